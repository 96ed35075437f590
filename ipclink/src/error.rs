//! Error types surfaced to callers and to the host application.

use std::fmt;
use std::time::Duration;

use crate::bridge::protocol::{EncodeError, ErrorBody, ErrorKind};

/// Errors returned by the client API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    /// The discovery handshake produced no usable port.
    #[error("discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The connection could not be opened or dropped while the request was in flight.
    #[error("server unreachable: {0}")]
    ServerUnreachable(String),

    /// The local wait exceeded its deadline. The server is not notified.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered with an error envelope.
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("invalid request arguments: {0}")]
    InvalidArguments(String),

    #[error("correlation token already in flight: {0}")]
    TokenCollision(String),

    /// The target node did not advertise the endpoint; nothing was sent.
    #[error("endpoint '{0}' is not served by the target node")]
    UnknownEndpoint(String),

    #[error("client closed")]
    Closed,
}

impl IpcError {
    pub(crate) fn unreachable(reason: impl fmt::Display) -> Self {
        Self::ServerUnreachable(reason.to_string())
    }

    pub(crate) fn discovery(reason: impl fmt::Display) -> Self {
        Self::DiscoveryFailed(reason.to_string())
    }

    /// Wire error kind, for errors the server sent back.
    pub fn remote_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Remote(remote) => Some(remote.kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Structured error sent back by the server.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server returned {code} ({kind}): {message}")]
pub struct RemoteError {
    pub code: u16,
    pub kind: ErrorKind,
    pub message: String,
    /// Category name of the failure raised inside the handler, when reported.
    pub error_type: Option<String>,
}

impl From<ErrorBody> for RemoteError {
    fn from(body: ErrorBody) -> Self {
        Self {
            code: body.code,
            kind: body.kind,
            message: body.error,
            error_type: body.error_type,
        }
    }
}

/// Failure raised by an endpoint handler.
///
/// Any `std::error::Error` converts into it with `?`; the category is the
/// error's type name (e.g. `ParseIntError`). Must not implement `Error`
/// itself, or the blanket conversion overlaps `From<T> for T`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerError {
    category: String,
    message: String,
}

impl HandlerError {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Handler-level failure without a more specific category.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new("HandlerError", message)
    }

    pub(crate) fn panic(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

impl<E> From<E> for HandlerError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(short_type_name::<E>(), error.to_string())
    }
}

/// Last path segment of a type name, without generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Failure reported to the host application's error channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The handler returned an error or panicked.
    #[error("handler failed: {0}")]
    Handler(HandlerError),
    /// The handler's return value could not be encoded or does not fit in a frame.
    #[error(transparent)]
    Encode(EncodeError),
}

impl DispatchError {
    /// Category name reported on the wire.
    pub fn category(&self) -> &str {
        match self {
            Self::Handler(e) => e.category(),
            Self::Encode(_) => "EncodeError",
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            Self::Handler(e) => ErrorBody::new(
                ErrorKind::HandlerError,
                format!("IPC route raised error of type {}", e.category()),
            )
            .with_error_type(e.category()),
            Self::Encode(_) => ErrorBody::new(
                ErrorKind::EncodeError,
                "IPC route returned values which are not able to be sent over sockets. \
                 Only send plain data the client needs.",
            )
            .with_error_type("EncodeError"),
        }
    }
}
