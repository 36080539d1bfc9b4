//! A client-side WAMP v2 session core over WebSocket/JSON (`wamp.2.json`).
//!
//! [`connect`] negotiates the HELLO/WELCOME handshake and hands back a
//! [`Channel`]: a cheap-to-clone handle exposing the four peer operations —
//! `call`, `register`, `publish`, `subscribe` — over one multiplexed
//! connection. There is no router, dealer, or broker here; this crate is a
//! WAMP *client* only.

mod auth;
mod demux;
mod error;
mod id;
mod invocation;
mod messages;
mod session;
mod transport;

pub use auth::{Auth, ChallengeResponse};
pub use error::{Error, ErrorKind, OperationError, PayloadError, UserHandlerError};
pub use id::Id;
pub use invocation::{Handler, HandlerStream};
pub use messages::{Dict, ErrorType, List, Message, Reason, URI};
pub use session::{
    connect, connect_with_transport, CallStream, Channel, Payload, PublicationId,
    RegistrationHandle, SubscriptionStream,
};
pub use transport::{MockTransport, Transport};

/// Shorthand for a fallible session-level operation.
pub type WampResult<T> = Result<T, Error>;
