use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Wire-level error codes understood by both ends of the event stream.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Generic server-side failure on behalf of one instance.
    InstanceError,
    /// Unknown role name in a subscription service request.
    InvalidRole,
    /// UCX worker address already claimed by a live instance.
    DuplicateUcxAddress,
    /// The service's 16-bit tag space is used up.
    TagExhausted,
    /// Service redeclared with a different role set.
    ServiceMismatch,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::InstanceError => write!(f, "instance error"),
            ErrorCode::InvalidRole => write!(f, "invalid role"),
            ErrorCode::DuplicateUcxAddress => write!(f, "duplicate ucx worker address"),
            ErrorCode::TagExhausted => write!(f, "tag space exhausted"),
            ErrorCode::ServiceMismatch => write!(f, "service role set mismatch"),
        }
    }
}

/// Soft failure raised by a unary handler on behalf of one client.
///
/// `fatal` marks the few failures that also require an orderly server
/// shutdown (tag/service-id space exhaustion, table corruption); the
/// originating client still receives the error response first.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ControlError {
    pub code: ErrorCode,
    pub message: String,
    fatal: bool,
}

impl ControlError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            fatal: false,
        }
    }

    /// `InstanceError` shorthand.
    pub fn instance(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InstanceError, message)
    }

    pub fn invalid_role(service: &str, role: &str) -> Self {
        Self::new(
            ErrorCode::InvalidRole,
            format!("unknown role {role:?} in service {service:?}"),
        )
    }

    pub fn tag_exhausted(service_id: u32) -> Self {
        Self {
            code: ErrorCode::TagExhausted,
            message: format!("service {service_id} exhausted its 16-bit tag space"),
            fatal: true,
        }
    }

    pub fn into_fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl Error for ControlError {}

impl From<anyhow::Error> for ControlError {
    fn from(err: anyhow::Error) -> Self {
        ControlError::instance(err.to_string())
    }
}

pub type ControlResult<T> = Result<T, ControlError>;

/// Failure pushing an envelope into a stream's outbound queue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// Queue stayed full past the writer's patience.
    Full,
    /// Peer half of the stream is gone.
    Closed,
    /// The owning stop token was killed mid-write.
    Stopped,
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Full => write!(f, "stream queue is full"),
            WriteError::Closed => write!(f, "stream is closed"),
            WriteError::Stopped => write!(f, "stream writer stopped"),
        }
    }
}

impl Error for WriteError {}

/// Non-blocking receive outcome for stream readers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TryRecvError {
    Empty,
    Disconnected,
}

/// Blocking receive outcome for stream readers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvError {
    Timeout,
    Disconnected,
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout => write!(f, "receive timed out"),
            RecvError::Disconnected => write!(f, "stream disconnected"),
        }
    }
}

impl Error for RecvError {}
