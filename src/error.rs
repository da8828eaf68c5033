//! Error taxonomy for the tracking engine.
//!
//! Failures on the allocation hot path are never propagated to the traced
//! program; the tracker converts them into a session deactivation and a
//! best-effort diagnostic. The reader surfaces errors through its result
//! enumerator instead of panicking on malformed input.

use thiserror::Error;

/// Errors produced by the tracker, writer, reader and patcher.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Sink write/read/seek failure. Fatal to the current session: the
    /// tracker deactivates and the traced program continues.
    #[error("capture sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed record, truncation beyond the recoverable zero padding,
    /// or a header magic mismatch. Reader-side only; the reader is
    /// considered closed afterwards.
    #[error("malformed capture stream: {0}")]
    Format(String),

    /// Unknown instruction pointer or missing debug info. Non-fatal;
    /// reconstructed stacks substitute a placeholder frame.
    #[error("could not resolve symbol: {0}")]
    Resolution(String),

    /// Failed to rewrite a relocation. Non-fatal; allocations from the
    /// affected image will be missed.
    #[error("failed to hook image {image}: {reason}")]
    Hooking { image: String, reason: String },

    /// The shadow stack refers to a frame the runtime no longer has.
    /// Handled by emitting pops for every emitted frame and rebuilding
    /// from the live frame chain.
    #[error("shadow stack desynchronized from runtime: {0}")]
    RuntimeDesync(String),

    /// Capture file grown past a limit, or an RSS read returned zero.
    /// Handled by deactivating the session.
    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    /// Session lifecycle misuse, e.g. starting a second concurrent
    /// tracking session.
    #[error("tracking session error: {0}")]
    Session(String),
}

impl TrackerError {
    /// Build a format error from anything displayable.
    pub fn format(msg: impl Into<String>) -> Self {
        TrackerError::Format(msg.into())
    }
}

/// Crate-wide result alias.
pub type TrackerResult<T> = Result<T, TrackerError>;
