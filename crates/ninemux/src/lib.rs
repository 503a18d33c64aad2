#![forbid(unsafe_code)]
//! Asynchronous 9P2000 transport and session multiplexing library.
//!
//! This crate implements the transport layer of the 9P protocol on top
//! of tokio: message framing, tag-based request/response correlation,
//! concurrent per-request dispatch, and out-of-band cancellation via
//! `Tflush`. It carries message bodies opaquely; what an opcode means
//! is entirely up to the [`MessageHandler`] supplied by the embedding
//! application, which makes the crate usable for any 9P dialect as
//! well as for 9P-framed private protocols.
//!
//! # Overview
//!
//! A [`session::Session`] owns one connection. Inbound bytes are
//! framed into `size[4] type[1] tag[2] body[size-7]` messages in strict
//! wire order; each request is handed to `MessageHandler::process_msg`
//! running as its own task, and its response is written back as soon as
//! it is ready. Because requests run concurrently, responses go out in
//! completion order, not request order; that is a property of the
//! protocol (correlation is by tag, never by position).
//!
//! `Tflush` is treated specially: it is answered synchronously from the
//! receive path and cancels the named in-flight request, best effort.
//!
//! # Getting Started
//!
//! 1. Implement [`MessageHandler`] for your protocol type
//! 2. Either start a listener with [`srv::serve`] or drive a
//!    [`session::Session`] over a transport you own
//!
//! # Example
//!
//! ```no_run
//! use async_trait::async_trait;
//! use bytes::Bytes;
//! use ninemux::{srv::serve, Error, MessageHandler, Response, Result};
//!
//! #[derive(Clone)]
//! struct Echo;
//!
//! #[async_trait]
//! impl MessageHandler for Echo {
//!     async fn process_msg(&self, typ: u8, body: Bytes) -> Result<Response> {
//!         // Interpret the body here; this server just echoes it.
//!         Ok(Response::new(typ.wrapping_add(1), body))
//!     }
//!
//!     fn on_error(&self, err: &Error) -> Response {
//!         Response::new(ninemux::MsgType::RError as u8, err.to_string().into_bytes())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     serve(Echo, "tcp!127.0.0.1!564").await
//! }
//! ```
//!
//! # Error Handling
//!
//! Per-request handler failures are contained: the session turns them
//! into an error response through `MessageHandler::on_error` and keeps
//! serving. Framing errors ([`error::FramingError`]) and I/O failures
//! are fatal to the session; the peer sees the connection close, never
//! a partial or corrupt message.
//!
//! # Transport
//!
//! The bundled listeners support:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
//!
//! Sessions can also be fed bytes directly through
//! [`session::Session::receive`] when the embedding application owns
//! the transport.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod error;
pub mod handler;
pub mod session;
pub mod srv;
#[macro_use]
pub mod utils;
pub mod wire;

pub use crate::error::{Error, FramingError};
pub use crate::handler::{MessageHandler, Response};
pub use crate::session::Session;
pub use crate::utils::Result;
pub use crate::wire::*;
