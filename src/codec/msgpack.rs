//! msgpack-RPC codec.
//!
//! Frames are the classic `[type, ...]` arrays: requests are 4 elements,
//! responses 4, notifications 3. Messages decode straight off the read
//! buffer; a truncated frame leaves the buffer untouched until more bytes
//! arrive.

use std::io::{Cursor, ErrorKind};

use bytes::{Buf, Bytes, BytesMut};
use rmpv::decode;
use serde_json::{Map, Number, Value};

use super::Codec;
use crate::error::Error;
use crate::message::{Id, Message, Params};

const TYPE_REQUEST: u64 = 0;
const TYPE_RESPONSE: u64 = 1;
const TYPE_NOTIFICATION: u64 = 2;

pub(crate) struct MsgpackCodec;

impl Codec for MsgpackCodec {
    fn encode_request(&self, id: u32, method: &str, params: &Params) -> Bytes {
        write_frame(&rmpv::Value::Array(vec![
            rmpv::Value::from(TYPE_REQUEST),
            rmpv::Value::from(id),
            rmpv::Value::from(method),
            params_to_msgpack(params),
        ]))
    }

    fn encode_notification(&self, method: &str, params: &Params) -> Bytes {
        write_frame(&rmpv::Value::Array(vec![
            rmpv::Value::from(TYPE_NOTIFICATION),
            rmpv::Value::from(method),
            params_to_msgpack(params),
        ]))
    }

    fn encode_response(&self, id: &Id, result: Result<&Value, &Value>) -> Bytes {
        // String ids never originate from this dialect; requests carry
        // 32-bit ids by construction.
        let id = match id {
            Id::Number(n) => *n,
            Id::String(s) => s.parse().unwrap_or_default(),
        };
        let (error, result) = match result {
            Ok(value) => (rmpv::Value::Nil, to_msgpack(value)),
            Err(payload) => (to_msgpack(payload), rmpv::Value::Nil),
        };
        write_frame(&rmpv::Value::Array(vec![
            rmpv::Value::from(TYPE_RESPONSE),
            rmpv::Value::from(id),
            error,
            result,
        ]))
    }

    fn decode_next(&mut self, read: &mut BytesMut) -> Result<Option<Message>, Error> {
        if read.is_empty() {
            return Ok(None);
        }
        let mut cursor = Cursor::new(&read[..]);
        let frame = match decode::read_value(&mut cursor) {
            Ok(frame) => frame,
            Err(err) if is_truncation(&err) => return Ok(None),
            Err(err) => {
                return Err(Error::Protocol(format!("malformed msgpack frame: {}", err)))
            }
        };
        let consumed = cursor.position() as usize;
        read.advance(consumed);
        decode_frame(frame).map(Some)
    }
}

fn is_truncation(err: &decode::Error) -> bool {
    match err {
        decode::Error::InvalidMarkerRead(e) | decode::Error::InvalidDataRead(e) => {
            e.kind() == ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn write_frame(frame: &rmpv::Value) -> Bytes {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, frame).expect("msgpack encoding to memory cannot fail");
    Bytes::from(buf)
}

fn decode_frame(frame: rmpv::Value) -> Result<Message, Error> {
    let rmpv::Value::Array(items) = frame else {
        return Err(Error::Protocol("message is not an array".to_string()));
    };
    let tag = match items.first().and_then(rmpv::Value::as_u64) {
        Some(tag) => tag,
        None => return Err(Error::Protocol("missing message type tag".to_string())),
    };

    match tag {
        TYPE_REQUEST => {
            let [_, id, method, params]: [rmpv::Value; 4] = items
                .try_into()
                .map_err(|_| Error::Protocol("request frame must have 4 elements".to_string()))?;
            Ok(Message::Request {
                id: decode_request_id(&id)?,
                method: string_of(method)?,
                params: Params::from_wire(from_msgpack(params)?),
            })
        }
        TYPE_RESPONSE => {
            let [_, id, error, result]: [rmpv::Value; 4] = items
                .try_into()
                .map_err(|_| Error::Protocol("response frame must have 4 elements".to_string()))?;
            let result = if error.is_nil() {
                Ok(from_msgpack(result)?)
            } else {
                Err(from_msgpack(error)?)
            };
            Ok(Message::Response {
                id: decode_request_id(&id)?,
                result,
            })
        }
        TYPE_NOTIFICATION => {
            let [_, method, params]: [rmpv::Value; 3] = items.try_into().map_err(|_| {
                Error::Protocol("notification frame must have 3 elements".to_string())
            })?;
            Ok(Message::Notification {
                method: string_of(method)?,
                params: Params::from_wire(from_msgpack(params)?),
            })
        }
        other => Err(Error::Protocol(format!("unknown message type tag: {}", other))),
    }
}

fn decode_request_id(id: &rmpv::Value) -> Result<Id, Error> {
    id.as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .map(Id::from)
        .ok_or_else(|| Error::Protocol(format!("request id must be a 32-bit unsigned integer: {}", id)))
}

fn string_of(value: rmpv::Value) -> Result<String, Error> {
    let rmpv::Value::String(s) = value else {
        return Err(Error::Protocol("method name must be a string".to_string()));
    };
    s.into_str()
        .ok_or_else(|| Error::Protocol("method name must be valid UTF-8".to_string()))
}

fn params_to_msgpack(params: &Params) -> rmpv::Value {
    match params {
        Params::Positional(args) => rmpv::Value::Array(args.iter().map(to_msgpack).collect()),
        Params::Named(args) => rmpv::Value::Map(
            args.iter()
                .map(|(key, value)| (rmpv::Value::from(key.as_str()), to_msgpack(value)))
                .collect(),
        ),
        Params::Other(value) => to_msgpack(value),
    }
}

fn to_msgpack(value: &Value) -> rmpv::Value {
    match value {
        Value::Null => rmpv::Value::Nil,
        Value::Bool(b) => rmpv::Value::from(*b),
        Value::Number(n) => {
            if let Some(n) = n.as_u64() {
                rmpv::Value::from(n)
            } else if let Some(n) = n.as_i64() {
                rmpv::Value::from(n)
            } else {
                rmpv::Value::from(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => rmpv::Value::from(s.as_str()),
        Value::Array(items) => rmpv::Value::Array(items.iter().map(to_msgpack).collect()),
        Value::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(key, value)| (rmpv::Value::from(key.as_str()), to_msgpack(value)))
                .collect(),
        ),
    }
}

fn from_msgpack(value: rmpv::Value) -> Result<Value, Error> {
    Ok(match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => Value::Bool(b),
        rmpv::Value::Integer(n) => {
            if let Some(n) = n.as_u64() {
                Value::Number(Number::from(n))
            } else if let Some(n) = n.as_i64() {
                Value::Number(Number::from(n))
            } else {
                return Err(Error::Protocol("integer out of range".to_string()));
            }
        }
        rmpv::Value::F32(f) => number_from_f64(f64::from(f)),
        rmpv::Value::F64(f) => number_from_f64(f),
        rmpv::Value::String(s) => match s.into_str() {
            Some(s) => Value::String(s),
            None => return Err(Error::Protocol("string is not valid UTF-8".to_string())),
        },
        rmpv::Value::Binary(bytes) => Value::Array(
            bytes
                .into_iter()
                .map(|b| Value::Number(Number::from(b)))
                .collect(),
        ),
        rmpv::Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(from_msgpack)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        rmpv::Value::Map(entries) => {
            let mut map = Map::with_capacity(entries.len());
            for (key, value) in entries {
                let rmpv::Value::String(key) = key else {
                    return Err(Error::Protocol("map key is not a string".to_string()));
                };
                let Some(key) = key.into_str() else {
                    return Err(Error::Protocol("map key is not valid UTF-8".to_string()));
                };
                map.insert(key, from_msgpack(value)?);
            }
            Value::Object(map)
        }
        rmpv::Value::Ext(..) => {
            return Err(Error::Protocol("unsupported msgpack extension".to_string()))
        }
    })
}

fn number_from_f64(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}
