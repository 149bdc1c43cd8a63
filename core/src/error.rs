//! Terminal error taxonomy reported to callers

use thiserror::Error;

/// Outcome class of an operation that will not be retried any further.
///
/// Everything retryable is absorbed inside the command executor; what comes
/// out of the engine is one of these.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retry budget exhausted on a retryable condition. Trying the whole
    /// operation again later may work.
    #[error("transient device error")]
    Transient,

    /// The operation cannot succeed without intervention: unreadable medium,
    /// write protection, reservation held elsewhere, no medium, or the
    /// device is gone.
    #[error("persistent device error")]
    Persistent,

    /// The device rejected the command as illegal or returned data that
    /// makes no sense.
    #[error("device protocol violation")]
    ProtocolViolation,

    /// The medium changed. Renegotiate capacity, then reissue the operation.
    #[error("media changed")]
    MediaChanged,

    /// The handle already has a request in flight.
    #[error("handle busy")]
    Busy,

    /// Resource allocation failed.
    #[error("out of memory")]
    NoMemory,

    /// Caller precondition violated: stale id, double free, missing
    /// required callback or mismatched block size.
    #[error("invalid request")]
    InvalidRequest,
}
