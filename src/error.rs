use thiserror::Error;

use crate::device::DeviceRole;

/// Whether retrying this operation may succeed without operator action.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Transience {
    /// Retry will never help without changing inputs/state.
    Permanent,
    /// Retry may help (device reconnects, contention clears).
    Retryable,
}

impl Transience {
    pub fn is_retryable(self) -> bool {
        matches!(self, Transience::Retryable)
    }
}

/// Crate-level error taxonomy.
///
/// Each variant carries a stable `code()` and a fixed HTTP status so the
/// inbound request worker can map errors without inspecting messages.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("{role:?} is not connected and ready")]
    DeviceNotConnected { role: DeviceRole },

    #[error("unsupported state transition: {reason}")]
    UnsupportedStateTransition { reason: String },

    #[error("device lacks this capability: {reason}")]
    UnsupportedFeature { reason: String },

    #[error("bad request: {reason}")]
    BadRequest { reason: String },

    #[error("method not supported for this resource: {reason}")]
    MethodNotSupported { reason: String },

    #[error("{operation} timed out after {seconds} s")]
    Timeout { operation: String, seconds: f64 },

    #[error("sequence {sequence_id} has not closed; export refused")]
    IncompleteSequenceRecord { sequence_id: String },

    #[error("profile rejected: {reason}")]
    ProfileValidation { reason: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("fatal: {reason}")]
    Fatal { reason: String },
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::DeviceNotConnected { .. } => "device_not_connected",
            Error::UnsupportedStateTransition { .. } => "unsupported_state_transition",
            Error::UnsupportedFeature { .. } => "unsupported_feature",
            Error::BadRequest { .. } => "bad_request",
            Error::MethodNotSupported { .. } => "method_not_supported",
            Error::Timeout { .. } => "timeout",
            Error::IncompleteSequenceRecord { .. } => "incomplete_sequence_record",
            Error::ProfileValidation { .. } => "profile_validation",
            Error::Store(_) => "store_error",
            Error::Transport(_) => "transport_error",
            Error::Io(_) => "io_error",
            Error::Fatal { .. } => "fatal",
        }
    }

    /// Fixed status semantics: 400 bad input, 409 wrong state or device
    /// not connected, 418 capability missing, 501 unsupported method.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::BadRequest { .. } | Error::ProfileValidation { .. } => 400,
            Error::DeviceNotConnected { .. } | Error::UnsupportedStateTransition { .. } => 409,
            Error::UnsupportedFeature { .. } => 418,
            Error::MethodNotSupported { .. } => 501,
            Error::Timeout { .. } => 504,
            _ => 500,
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            Error::DeviceNotConnected { .. }
            | Error::Timeout { .. }
            | Error::Transport(_)
            | Error::Store(_)
            | Error::Io(_) => Transience::Retryable,
            Error::UnsupportedStateTransition { .. } => Transience::Retryable,
            Error::UnsupportedFeature { .. }
            | Error::BadRequest { .. }
            | Error::MethodNotSupported { .. }
            | Error::IncompleteSequenceRecord { .. }
            | Error::ProfileValidation { .. }
            | Error::Fatal { .. } => Transience::Permanent,
        }
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Error::BadRequest {
            reason: reason.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Error::Fatal {
            reason: reason.into(),
        }
    }
}
