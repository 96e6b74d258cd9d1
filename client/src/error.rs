//! Error type shared by the reactor and the handle that talks to it.
use std::io;

use thiserror::Error;

/// Errors surfaced by the reactor's event loop, or by a [`crate::Handle`]
/// talking to a reactor that is no longer running.
#[derive(Debug, Error)]
pub enum Error {
    /// A socket or poll operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// The reactor thread is gone; its command or event channel is closed.
    #[error("the reactor is no longer running")]
    Disconnected,
}

impl<T> From<crossbeam_channel::SendError<T>> for Error {
    fn from(_: crossbeam_channel::SendError<T>) -> Self {
        Error::Disconnected
    }
}

impl From<crossbeam_channel::RecvError> for Error {
    fn from(_: crossbeam_channel::RecvError) -> Self {
        Error::Disconnected
    }
}
