//! Error types and numeric error codes
//!
//! Every failure a [`Context`](crate::Context) operation can produce maps to a
//! stable [`ErrorCode`]. The context keeps the code of its most recent
//! operation in a [`LastError`] so that callers which only see handles can
//! still find out what went wrong.

use crate::context::ContextHandle;
use crate::session::SessionHandle;
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Configuration text errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown section [{name}] at line {line}")]
    UnknownSection { line: usize, name: String },

    #[error("Missing [{0}] section")]
    MissingSection(&'static str),

    #[error("Second [Interface] section at line {line}")]
    DuplicateInterface { line: usize },

    #[error("Missing {key} in [{section}]")]
    MissingField {
        section: &'static str,
        key: &'static str,
    },

    #[error("Invalid address range '{value}' for {key} in [{section}]")]
    InvalidCidr {
        section: &'static str,
        key: &'static str,
        value: String,
    },

    #[error("Invalid key for {key} in [{section}]")]
    InvalidKey {
        section: &'static str,
        key: &'static str,
    },

    #[error("Invalid value '{value}' for {key} in [{section}]")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },

    #[error("Duplicate peer {0}")]
    DuplicatePeer(String),

    #[error("Syntax error at line {line}: {text}")]
    Syntax { line: usize, text: String },
}

/// Session and tunnel engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Unknown session handle {0}")]
    UnknownHandle(SessionHandle),

    #[error("Session {0} is already closed")]
    AlreadyClosed(SessionHandle),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Cannot resolve endpoint {endpoint}: {reason}")]
    Resolve { endpoint: String, reason: String },

    #[error("Socket error: {0}")]
    Io(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e.to_string())
    }
}

/// Execution context and configuration source errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("No such context {0}")]
    NoSuchContext(ContextHandle),

    #[error("Context unavailable: {0}")]
    Unavailable(String),

    #[error("No configuration found for '{0}'")]
    ConfigurationNotFound(String),

    #[error("Failed to load {path}: {reason}")]
    ConfigurationLoad { path: String, reason: String },

    #[error("Invalid configuration search path '{0}'")]
    InvalidSearchPath(String),
}

/// Any error from a context operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TunnelError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Context(#[from] ContextError),
}

impl TunnelError {
    /// Stable numeric code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            TunnelError::Parse(e) => e.code(),
            TunnelError::Engine(e) => e.code(),
            TunnelError::Context(e) => e.code(),
        }
    }
}

/// Stable numeric error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    None = 0,

    UnknownSection = 1,
    MissingField = 2,
    InvalidCidr = 3,
    InvalidConfigKey = 4,
    InvalidValue = 5,
    DuplicatePeer = 6,
    Syntax = 7,

    UnknownHandle = 10,
    AlreadyClosed = 11,
    HandshakeFailed = 12,
    InvalidKey = 13,
    Io = 14,

    NoSuchContext = 20,
    ContextUnavailable = 21,
    ConfigurationNotFound = 22,
    ConfigurationLoad = 23,
    InvalidSearchPath = 24,
}

impl ErrorCode {
    /// The raw code
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a raw code back, if it is one of ours
    pub fn from_i32(code: i32) -> Option<Self> {
        [
            Self::None,
            Self::UnknownSection,
            Self::MissingField,
            Self::InvalidCidr,
            Self::InvalidConfigKey,
            Self::InvalidValue,
            Self::DuplicatePeer,
            Self::Syntax,
            Self::UnknownHandle,
            Self::AlreadyClosed,
            Self::HandshakeFailed,
            Self::InvalidKey,
            Self::Io,
            Self::NoSuchContext,
            Self::ContextUnavailable,
            Self::ConfigurationNotFound,
            Self::ConfigurationLoad,
            Self::InvalidSearchPath,
        ]
        .into_iter()
        .find(|c| c.as_i32() == code)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, self.as_i32())
    }
}

impl ParseError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ParseError::UnknownSection { .. } => ErrorCode::UnknownSection,
            ParseError::MissingField { .. } => ErrorCode::MissingField,
            ParseError::InvalidCidr { .. } => ErrorCode::InvalidCidr,
            ParseError::InvalidKey { .. } => ErrorCode::InvalidConfigKey,
            ParseError::InvalidValue { .. } => ErrorCode::InvalidValue,
            ParseError::DuplicatePeer(_) => ErrorCode::DuplicatePeer,
            ParseError::MissingSection(_)
            | ParseError::DuplicateInterface { .. }
            | ParseError::Syntax { .. } => ErrorCode::Syntax,
        }
    }
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::UnknownHandle(_) => ErrorCode::UnknownHandle,
            EngineError::AlreadyClosed(_) => ErrorCode::AlreadyClosed,
            EngineError::HandshakeFailed(_) => ErrorCode::HandshakeFailed,
            EngineError::InvalidKey(_) => ErrorCode::InvalidKey,
            EngineError::Resolve { .. } | EngineError::Io(_) => ErrorCode::Io,
        }
    }
}

impl ContextError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ContextError::NoSuchContext(_) => ErrorCode::NoSuchContext,
            ContextError::Unavailable(_) => ErrorCode::ContextUnavailable,
            ContextError::ConfigurationNotFound(_) => ErrorCode::ConfigurationNotFound,
            ContextError::ConfigurationLoad { .. } => ErrorCode::ConfigurationLoad,
            ContextError::InvalidSearchPath(_) => ErrorCode::InvalidSearchPath,
        }
    }
}

/// Result of the most recent operation in one context
#[derive(Debug, Default)]
pub struct LastError {
    code: AtomicI32,
    message: Mutex<Option<String>>,
}

impl LastError {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current code; 0 until the first operation
    pub fn get(&self) -> i32 {
        self.code.load(Ordering::Acquire)
    }

    /// Description of the last failure, if the last operation failed
    pub fn message(&self) -> Option<String> {
        self.message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, code: ErrorCode, message: Option<String>) {
        let mut slot = self.message.lock().unwrap_or_else(PoisonError::into_inner);
        self.code.store(code.as_i32(), Ordering::Release);
        *slot = message;
    }

    /// Record the outcome of an operation, passing the result through
    pub fn record<T>(&self, result: Result<T, TunnelError>) -> Result<T, TunnelError> {
        match &result {
            Ok(_) => self.set(ErrorCode::None, None),
            Err(e) => self.set(e.code(), Some(e.to_string())),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct_and_reversible() {
        for raw in 0..32 {
            if let Some(code) = ErrorCode::from_i32(raw) {
                assert_eq!(code.as_i32(), raw);
            }
        }
        assert_eq!(ErrorCode::from_i32(0), Some(ErrorCode::None));
        assert_eq!(ErrorCode::from_i32(99), None);
    }

    #[test]
    fn test_error_mapping() {
        let parse: TunnelError = ParseError::MissingField {
            section: "Peer",
            key: "Endpoint",
        }
        .into();
        assert_eq!(parse.code(), ErrorCode::MissingField);

        let engine: TunnelError = EngineError::AlreadyClosed(SessionHandle::new(3)).into();
        assert_eq!(engine.code().as_i32(), 11);

        let ctx: TunnelError = ContextError::ConfigurationNotFound("wg0".into()).into();
        assert_eq!(ctx.code().as_i32(), 22);

        assert_eq!(ParseError::MissingSection("Interface").code(), ErrorCode::Syntax);
        assert_ne!(
            ParseError::InvalidKey { section: "Peer", key: "PublicKey" }.code(),
            EngineError::InvalidKey("x".into()).code()
        );
    }

    #[test]
    fn test_last_error_overwritten() {
        let last = LastError::new();
        assert_eq!(last.get(), 0);

        let failed: Result<(), TunnelError> =
            Err(EngineError::UnknownHandle(SessionHandle::new(42)).into());
        assert!(last.record(failed).is_err());
        assert_eq!(last.get(), ErrorCode::UnknownHandle.as_i32());
        assert_eq!(last.message().as_deref(), Some("Unknown session handle 42"));

        // Reading does not reset
        assert_eq!(last.get(), ErrorCode::UnknownHandle.as_i32());

        assert_eq!(last.record(Ok::<_, TunnelError>(7)).unwrap(), 7);
        assert_eq!(last.get(), 0);
        assert_eq!(last.message(), None);
    }

    #[test]
    fn test_display() {
        let err = EngineError::Resolve {
            endpoint: "vpn.invalid:51820".into(),
            reason: "not found".into(),
        };
        assert_eq!(err.to_string(), "Cannot resolve endpoint vpn.invalid:51820: not found");
        assert_eq!(ErrorCode::HandshakeFailed.to_string(), "HandshakeFailed (12)");
    }
}
