//! Bidirectional asynchronous RPC over reliable byte streams.
//!
//! Two interoperable wire dialects run on the same engine: msgpack-RPC and
//! JSON-RPC 2.0. A [`Session`] multiplexes any number of concurrent calls
//! over one connection and can play both roles at once: issue calls through
//! a [`Client`] while serving inbound requests through a shared
//! [`Dispatcher`].
//!
//! ## Architecture
//!
//! - `codec`: frame encode/decode per dialect, including the incremental
//!   JSON framer
//! - `session`: per-connection engine; read loop, ordered writes, teardown
//! - `pending`: correlation of responses with in-flight requests
//! - `dispatcher`: method registry and typed argument adaptation
//! - `client`: request/notification surface with timeouts and cancellation
//! - `server`: TCP accept loop binding sessions to a shared dispatcher

pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod message;
mod pending;
pub mod server;
pub mod session;

pub use client::Client;
pub use codec::Dialect;
pub use dispatcher::{AsyncHandler, CoroHandler, Dispatcher, FromParams, Responder, SyncHandler};
pub use error::Error;
pub use message::{Id, Message, Params};
pub use server::Server;
pub use session::Session;
