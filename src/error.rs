use std::fmt;
use std::sync::Arc;

use crate::messages::{Dict, ErrorType, List, Reason};
use crate::Id;

/// Top-level error type for every fallible operation in this crate.
///
/// Composes the taxonomy from the protocol design: transport failures,
/// malformed wire data, and handshake rejections all arrive here. A peer
/// `ERROR` frame for one specific outstanding request is instead carried as
/// `OperationError`, confined to that operation (see §7).
#[derive(Debug)]
pub struct Error {
    pub kind: ErrorKind,
}

#[derive(Debug)]
pub enum ErrorKind {
    /// The transport reported that the connection closed (by either peer).
    TransportClosed,
    /// The transport failed for a reason other than an orderly close.
    TransportError(String),
    /// A frame could not be parsed as JSON, or had an unexpected shape for
    /// the protocol state (wrong kind, missing required field).
    ProtocolError(String),
    /// A `CHALLENGE` arrived but no authentication was configured for this
    /// session.
    UnexpectedChallenge,
    /// The router rejected the handshake with `ABORT(details, reason)`.
    AbortError(Dict, Reason),
    /// The url argument to `connect` could not be parsed.
    UrlError(url::ParseError),
    /// The session was asked to do something that only makes sense in a
    /// different connection state (e.g. `close()` called twice).
    InvalidState(&'static str),
    /// The transport never reached an established session (it closed, or
    /// the driver task died, before `WELCOME` arrived).
    ConnectionLost,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ErrorKind::TransportClosed => write!(f, "transport closed"),
            ErrorKind::TransportError(e) => write!(f, "transport error: {}", e),
            ErrorKind::ProtocolError(e) => write!(f, "protocol error: {}", e),
            ErrorKind::UnexpectedChallenge => {
                write!(f, "received CHALLENGE but no authentication was configured")
            }
            ErrorKind::AbortError(_, reason) => write!(f, "router aborted handshake: {}", reason),
            ErrorKind::UrlError(e) => write!(f, "invalid url: {}", e),
            ErrorKind::InvalidState(s) => write!(f, "invalid state: {}", s),
            ErrorKind::ConnectionLost => write!(f, "connection lost before handshake completed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Error {
        Error::new(ErrorKind::UrlError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::new(ErrorKind::ProtocolError(e.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Error {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => {
                Error::new(ErrorKind::TransportClosed)
            }
            other => Error::new(ErrorKind::TransportError(other.to_string())),
        }
    }
}

/// A peer `ERROR` frame for one specific outstanding request (CALL,
/// SUBSCRIBE, PUBLISH, REGISTER or UNREGISTER). Confined to the issuing
/// operation; never terminates the session.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationError {
    pub error_type: ErrorType,
    pub request_id: Id,
    pub reason: Reason,
    pub args: Option<List>,
    pub kwargs: Option<Dict>,
}

impl OperationError {
    pub fn new(
        error_type: ErrorType,
        request_id: Id,
        reason: Reason,
        args: Option<List>,
        kwargs: Option<Dict>,
    ) -> OperationError {
        OperationError {
            error_type,
            request_id,
            reason,
            args,
            kwargs,
        }
    }
}

impl fmt::Display for OperationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} request {} failed: {}",
            self.error_type, self.request_id, self.reason
        )
    }
}

impl std::error::Error for OperationError {}

/// The error half of a call or subscription payload: either a peer `ERROR`
/// frame confined to that one request, or the session-wide failure that
/// tore down every active operation at once (see §7 propagation policy).
#[derive(Debug, Clone)]
pub enum PayloadError {
    Operation(OperationError),
    Session(Arc<Error>),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Operation(e) => write!(f, "{}", e),
            PayloadError::Session(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for PayloadError {}

impl From<OperationError> for PayloadError {
    fn from(e: OperationError) -> PayloadError {
        PayloadError::Operation(e)
    }
}

/// An error raised by a callee's own handler while producing a response.
/// Translated into an outbound `ERROR(INVOCATION, ...)` frame; never
/// terminates the session (see §7 UserHandlerError).
#[derive(Debug, Clone)]
pub struct UserHandlerError {
    pub uri: Option<String>,
    pub args: Option<List>,
    pub kwargs: Option<Dict>,
}

impl UserHandlerError {
    pub fn new(uri: impl Into<String>) -> UserHandlerError {
        UserHandlerError {
            uri: Some(uri.into()),
            args: None,
            kwargs: None,
        }
    }

    pub fn with_message(uri: impl Into<String>, message: impl Into<String>) -> UserHandlerError {
        UserHandlerError {
            uri: Some(uri.into()),
            args: Some(vec![serde_json::Value::String(message.into())]),
            kwargs: None,
        }
    }
}

impl fmt::Display for UserHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler error: {}", self.uri.as_deref().unwrap_or("wamp.error"))
    }
}

impl std::error::Error for UserHandlerError {}
