use thiserror::Error;
use uuid::Uuid;

/// Core error types for vpnguard
#[derive(Debug, Error)]
pub enum Error {
    /// Filtering engine session could not be opened (permissions, service down)
    #[error("filtering engine unavailable: {0}")]
    EngineUnavailable(String),

    /// A filter object with the same stable identity is already installed
    #[error("filter identity {0} already present in the engine")]
    RuleConflict(Uuid),

    /// Malformed dial-up device name, rejected before any dial is attempted
    #[error("invalid device name {0:?}")]
    InvalidName(String),

    /// Transport device enumeration failed
    #[error("device enumeration failed: {0}")]
    DeviceEnumerationFailed(String),

    /// Phonebook entry could not be read or written
    #[error("phonebook entry {name:?}: {message}")]
    PropertyWriteFailed { name: String, message: String },

    /// Dial request was rejected at submission, before any notification
    #[error("dial submission failed with code {0:#x}")]
    DialSubmitFailed(u32),

    /// A dial attempt is already outstanding; it must reach a terminal
    /// state before another connect is accepted
    #[error("a dial attempt is already in flight")]
    DialInProgress,

    /// Hang-up retries exhausted while the connection was still reported
    /// active; connection state is now uncertain
    #[error("connection still active after {attempts} hang-up attempts")]
    HangupFailed { attempts: u32 },

    /// Statistics query failed; callers usually substitute a zeroed snapshot
    #[error("statistics query failed: {0}")]
    StatQueryFailed(String),

    /// Operation requires an OS capability this platform does not provide
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal logic error
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
