/// Message handler translating between transport frames and session calls
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientMessage, OutboundFrame, OutputEncoder, ServerMessage, TerminalConnection,
    TerminalMessage,
};
use crate::service::error::TerminalError;
use crate::service::session::{SessionEvent, TerminalSession};

/// Per-connection message handler.
pub(crate) struct MessageHandler {
    connection_id: String,
    encoder: OutputEncoder,
}

impl MessageHandler {
    pub(crate) fn new(connection_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            encoder: OutputEncoder::new(),
        }
    }

    /// Handle a frame from the client. Returns true when the client asked to close.
    pub(crate) fn handle_message(&self, message: TerminalMessage, session: &TerminalSession) -> bool {
        match message {
            TerminalMessage::Text(text) => {
                self.handle_text_message(&text, session);
                false
            }
            TerminalMessage::Binary(bin) => {
                debug!(
                    "Received {} bytes of binary input from {}",
                    bin.len(),
                    self.connection_id
                );
                session.input(bin);
                false
            }
            TerminalMessage::Ping(_) | TerminalMessage::Pong(_) => false,
            TerminalMessage::Close => {
                info!("Received close message from {}", self.connection_id);
                true
            }
        }
    }

    fn handle_text_message(&self, text: &str, session: &TerminalSession) {
        match ClientMessage::parse(text) {
            Ok(ClientMessage::Stdin { data }) => session.input(data),
            Ok(ClientMessage::Resize { rows, cols }) => session.resize(rows, cols),
            Ok(ClientMessage::Ping) => debug!("Ping from {}", self.connection_id),
            Err(e) => warn!(
                "Ignoring message from {}: {} ({:?})",
                self.connection_id, e, text
            ),
        }
    }

    /// Deliver a session event to the client. Returns true once the session
    /// has ended and nothing more will follow.
    pub(crate) async fn handle_event(
        &mut self,
        event: SessionEvent,
        connection: &mut dyn TerminalConnection,
    ) -> Result<bool, TerminalError> {
        match event {
            SessionEvent::Output(chunk) => {
                if let Some(frame) = self.encoder.encode(&chunk)? {
                    send_frame(connection, frame).await?;
                }
                Ok(false)
            }
            SessionEvent::Size(size) => {
                let message = ServerMessage::Size {
                    rows: size.rows,
                    cols: size.cols,
                };
                connection.send_text(&message.to_json()?).await?;
                Ok(false)
            }
            SessionEvent::Exited(exit) => {
                if let Some(frame) = self.encoder.flush() {
                    send_frame(connection, frame).await?;
                }
                let message = ServerMessage::Exit { code: exit.code };
                connection.send_text(&message.to_json()?).await?;
                Ok(true)
            }
        }
    }
}

async fn send_frame(
    connection: &mut dyn TerminalConnection,
    frame: OutboundFrame,
) -> Result<(), TerminalError> {
    match frame {
        OutboundFrame::Text(text) => connection.send_text(&text).await?,
        OutboundFrame::Binary(data) => connection.send_binary(&data).await?,
    }
    Ok(())
}
