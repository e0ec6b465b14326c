/// PTY (pseudo terminal) handling.
///
/// `AsyncPty` is the seam between sessions and the terminal backend;
/// `PtyFactory` is how the registry obtains new ones.
mod memory_pty;
mod pty_process;
mod pty_trait;

pub use memory_pty::{MemoryPty, MemoryPtyControl, MemoryPtyFactory};
pub use pty_process::{NativePtyFactory, PtyProcess};
pub use pty_trait::*;

/// Spawn a pty through a specific factory.
pub async fn create_pty_with_factory(
    factory: &dyn PtyFactory,
    config: &PtyConfig,
) -> Result<Box<dyn AsyncPty>, PtyError> {
    factory.create(config).await
}
