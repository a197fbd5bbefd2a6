use std::time::Duration;

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// The engine is shutting down (or already shut down)
    ///
    /// Any operation issued after [`crate::Engine::close`] has begun fails
    /// with this error.
    Stopped,

    /// A foreground write was stalled for longer than the configured timeout
    ///
    /// Writes stall while the queue of sealed memtables exceeds its soft
    /// limit. The stall is retried internally; this error only surfaces
    /// once the configured stall timeout has elapsed.
    WriteStall {
        /// How long the write waited before giving up
        waited: Duration,
    },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SkredError: {self:?}")
    }
}

impl std::error::Error for Error {}

/// Engine result
pub type Result<T> = std::result::Result<T, Error>;
