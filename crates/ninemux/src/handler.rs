//! The message handler seam between the session multiplexer and the
//! protocol implementation supplied by the embedding application.
//!
//! The multiplexer treats message bodies as opaque bytes; everything
//! that gives an opcode meaning lives behind [`MessageHandler`].

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::Error, utils::Result};

/// The body of a response message, ready to be framed.
///
/// The wire `size` field is derived from `fields.len()` when the
/// response is framed; handlers never compute it themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    /// Response opcode
    pub typ: u8,
    /// Opcode-specific payload
    pub fields: Bytes,
}

impl Response {
    pub fn new(typ: u8, fields: impl Into<Bytes>) -> Response {
        Response {
            typ,
            fields: fields.into(),
        }
    }
}

#[async_trait]
/// Protocol implementation consumed by a [`Session`](crate::session::Session).
///
/// One handler instance serves every request on a connection, and
/// requests run concurrently, so implementations hold shared state
/// behind `Arc`/`Mutex` the usual way.
///
/// Expected protocol-level failures (permission denied, no such fid,
/// ...) should be encoded by `process_msg` as a normal `Response`
/// carrying the protocol's error opcode. `Err` is for unexpected
/// failures only; the session routes those through
/// [`on_error`](MessageHandler::on_error) and keeps the connection
/// alive.
///
/// # Example
/// ```no_run
/// use async_trait::async_trait;
/// use bytes::Bytes;
/// use ninemux::{Error, MessageHandler, Response, Result};
///
/// struct Echo;
///
/// #[async_trait]
/// impl MessageHandler for Echo {
///     async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response> {
///         Ok(Response::new(typ.wrapping_add(1), body))
///     }
///
///     fn on_error(&self, err: &Error) -> Response {
///         Response::new(107, err.to_string().into_bytes())
///     }
/// }
/// ```
pub trait MessageHandler: Send + Sync {
    /// Compute the response for one request message.
    ///
    /// Runs as its own task; it may suspend freely. If the request is
    /// flushed while this is pending, the future is dropped and no
    /// response is written.
    async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response>;

    /// Build the error-response message for a failed `process_msg`.
    ///
    /// Must always succeed; there is no secondary fallback. The
    /// resulting response is written with the failed request's tag.
    fn on_error(&self, err: &Error) -> Response;
}
