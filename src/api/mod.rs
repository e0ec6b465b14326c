/// Session lifecycle surface consumed by a host application's routes
mod dto;
mod terminals;

pub use dto::{CreateSessionRequest, ErrorResponse, SessionSummary, unix_seconds};
pub use terminals::TerminalsApi;
