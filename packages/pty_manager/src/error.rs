use std::io;

/// Errors that can occur while allocating or using a terminal pair
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// The kernel refused to hand out a new pseudo-terminal
    #[error("failed to open PTY: {0}")]
    Open(#[source] io::Error),
    /// A descriptor of a freshly opened pair could not be configured
    #[error("failed to configure PTY descriptor: {0}")]
    Configure(#[source] io::Error),
    /// Duplicating the process side for a reader, writer or child failed
    #[error("failed to duplicate PTY descriptor: {0}")]
    Duplicate(#[source] io::Error),
}

impl From<nix::Error> for PtyError {
    fn from(err: nix::Error) -> Self {
        PtyError::Open(err.into())
    }
}
