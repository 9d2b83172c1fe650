//! Error kinds surfaced by sessions and dispatch.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`crate::session::Session`] and the dispatch
/// operations in [`crate::dispatch`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine was launched but one of its pipes could not be attached.
    #[error("failed to set up engine pipes: {0}")]
    Spawn(String),

    /// The engine binary could not be started.
    #[error("failed to start engine at {}: {source}", binary.display())]
    ProcessStart {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading engine output failed with something other than end-of-stream.
    #[error("failed to read engine output: {0}")]
    Read(#[source] std::io::Error),

    /// Writing a prompt to the engine failed.
    #[error("failed to write prompt to engine: {0}")]
    Write(#[source] std::io::Error),

    /// Engine output ended before the response boundary was seen.
    ///
    /// `partial` holds the sanitized text captured for the prompt.
    #[error("engine output ended before response {prompt_index} was complete")]
    Truncated { prompt_index: usize, partial: String },

    /// The engine produced no output within the read deadline.
    #[error("engine produced no output within {0:?}")]
    TimedOut(Duration),

    /// The dispatch was cancelled through its cancellation token.
    #[error("dispatch cancelled")]
    Cancelled,

    /// The session has already been closed.
    #[error("session is closed")]
    SessionClosed,

    /// Closing the engine input or terminating the process failed.
    #[error("engine teardown failed: {0}")]
    Teardown(#[source] std::io::Error),

    /// The streaming task panicked or was aborted.
    #[error("streaming task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl EngineError {
    /// Return `true` if the error means the engine went away mid-response.
    pub fn is_truncated(&self) -> bool {
        matches!(self, EngineError::Truncated { .. })
    }
}
