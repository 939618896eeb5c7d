//! Error types for the bridge
//!
//! Design: native error codes are the lingua franca inside the bridge.
//! `BridgeError` only appears where a value is handed back to a managed caller.

use std::fmt;

/// Native error code, as passed through `extern "C"` callbacks.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub i32);

impl ErrorCode {
    pub const SUCCESS: Self = Self(0);
    pub const UNKNOWN: Self = Self(1);
    pub const INVALID_ARGUMENT: Self = Self(2);
    pub const INVALID_STATE: Self = Self(3);
    pub const CONNECTION_REFUSED: Self = Self(1040);
    pub const CONNECTION_CLOSED: Self = Self(1041);
    pub const CANCELED: Self = Self(1042);
    pub const BODY_TOO_LARGE: Self = Self(1043);
    pub const CALLBACK_FAILURE: Self = Self(1100);
    pub const CREDENTIALS_UNAVAILABLE: Self = Self(1200);
    pub const SIGNING_FAILED: Self = Self(1201);
    pub const SHUTDOWN_IN_PROGRESS: Self = Self(1300);

    #[inline]
    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    /// Convert a raw code into `Ok(())` or `Err(code)`
    #[inline]
    pub fn check(raw: i32) -> Result<(), ErrorCode> {
        match Self(raw) {
            Self::SUCCESS => Ok(()),
            code => Err(code),
        }
    }

    /// Symbolic name, used in logs and managed-side error messages
    pub fn name(self) -> &'static str {
        match self {
            Self::SUCCESS => "SUCCESS",
            Self::UNKNOWN => "UNKNOWN",
            Self::INVALID_ARGUMENT => "INVALID_ARGUMENT",
            Self::INVALID_STATE => "INVALID_STATE",
            Self::CONNECTION_REFUSED => "CONNECTION_REFUSED",
            Self::CONNECTION_CLOSED => "CONNECTION_CLOSED",
            Self::CANCELED => "CANCELED",
            Self::BODY_TOO_LARGE => "BODY_TOO_LARGE",
            Self::CALLBACK_FAILURE => "CALLBACK_FAILURE",
            Self::CREDENTIALS_UNAVAILABLE => "CREDENTIALS_UNAVAILABLE",
            Self::SIGNING_FAILED => "SIGNING_FAILED",
            Self::SHUTDOWN_IN_PROGRESS => "SHUTDOWN_IN_PROGRESS",
            _ => "UNRECOGNIZED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

/// The managed runtime has torn down (or is tearing down).
///
/// Not an error in the usual sense: callers treat it as "do nothing further".
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("managed runtime is unavailable")]
pub struct Unavailable;

/// Panic payload for a broken lifetime protocol.
///
/// Adapters abort the process when they catch one; it must never be turned
/// into a fallback return value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("lifetime protocol violation: {detail}")]
pub struct FatalViolation {
    pub detail: String,
}

impl FatalViolation {
    /// Log `detail` and unwind with a `FatalViolation` payload
    #[cold]
    #[track_caller]
    pub fn raise(detail: impl Into<String>) -> ! {
        let detail = detail.into();
        crate::logging::log_protocol_violation(&detail);
        std::panic::panic_any(Self { detail })
    }
}

/// An exception raised (or error returned) by managed code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ManagedError {
    /// Exception type name, e.g. `ValueError`
    pub kind: String,
    pub message: String,
}

impl ManagedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }
}

/// Errors surfaced to managed callers
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("native operation failed: {0}")]
    Native(ErrorCode),

    #[error(transparent)]
    RuntimeUnavailable(#[from] Unavailable),

    #[error("managed callback failed: {0}")]
    Managed(#[from] ManagedError),

    #[error("object is not a live {expected} handle")]
    WrongHandle { expected: &'static str },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Native error code carried by this error, if any
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Native(code) => Some(*code),
            Self::Managed(_) => Some(ErrorCode::CALLBACK_FAILURE),
            _ => None,
        }
    }
}

impl From<ErrorCode> for BridgeError {
    fn from(code: ErrorCode) -> Self {
        Self::Native(code)
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_maps_success() {
        assert_eq!(ErrorCode::check(0), Ok(()));
        assert_eq!(ErrorCode::check(1042), Err(ErrorCode::CANCELED));
    }

    #[test]
    fn test_display_includes_name_and_value() {
        assert_eq!(ErrorCode::CANCELED.to_string(), "CANCELED (1042)");
        assert_eq!(ErrorCode(77).name(), "UNRECOGNIZED");
    }

    #[test]
    fn test_bridge_error_code() {
        let err = BridgeError::from(ErrorCode::CONNECTION_REFUSED);
        assert_eq!(err.code(), Some(ErrorCode::CONNECTION_REFUSED));
        assert_eq!(BridgeError::from(Unavailable).code(), None);
        assert_eq!(
            BridgeError::from(ManagedError::type_error("bad")).code(),
            Some(ErrorCode::CALLBACK_FAILURE)
        );
    }
}
