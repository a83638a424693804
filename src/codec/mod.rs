//! Wire codecs for the two supported dialects.
//!
//! A codec turns whole logical messages into framed bytes and back. Decode
//! state (the JSON framer) lives in the codec instance; encode is stateless.
//! Structural decode failures are fatal: the session closes on the first
//! one, with no partial recovery.

mod framer;
mod json;
mod msgpack;

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::error::Error;
use crate::message::{Id, Message, Params};

/// The wire dialect spoken on a session, fixed for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// msgpack-RPC: binary `[type, ...]` array framing.
    Msgpack,
    /// JSON-RPC 2.0: object framing, incrementally segmented.
    JsonRpc,
}

impl Dialect {
    pub(crate) fn codec(self) -> Box<dyn Codec> {
        match self {
            Dialect::Msgpack => Box::new(msgpack::MsgpackCodec),
            Dialect::JsonRpc => Box::new(json::JsonCodec::new()),
        }
    }
}

pub(crate) trait Codec: Send {
    fn encode_request(&self, id: u32, method: &str, params: &Params) -> Bytes;

    fn encode_notification(&self, method: &str, params: &Params) -> Bytes;

    fn encode_response(&self, id: &Id, result: Result<&Value, &Value>) -> Bytes;

    /// Decode the next whole message out of `read`. `Ok(None)` means more
    /// bytes are needed; bytes not yet forming a complete message are
    /// retained, in `read` or in codec state.
    fn decode_next(&mut self, read: &mut BytesMut) -> Result<Option<Message>, Error>;
}
