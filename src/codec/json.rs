//! JSON-RPC 2.0 codec.
//!
//! Wire shapes follow the JSON-RPC 2.0 specification. Since the dialect has
//! no length prefix, decode runs behind the incremental framer, which
//! recovers message boundaries without parsing value interiors.

use bytes::{Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{json, Value};

use super::framer::JsonFramer;
use super::Codec;
use crate::error::{Error, INCOMPATIBLE_ARGUMENTS, UNKNOWN_FUNCTION};
use crate::message::{Id, Message, Params};

// Standard JSON-RPC 2.0 error codes
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;
pub(crate) const INVALID_PARAMS: i64 = -32602;
pub(crate) const SERVER_ERROR: i64 = -32000;

/// JSON-RPC 2.0 error object.
#[derive(Debug, Deserialize)]
struct WireError {
    #[allow(dead_code)]
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// One decoded JSON-RPC 2.0 object, before shape classification.
#[derive(Debug, Deserialize)]
struct WireMessage {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<WireError>,
}

#[derive(Default)]
pub(crate) struct JsonCodec {
    framer: JsonFramer,
}

impl JsonCodec {
    pub fn new() -> JsonCodec {
        JsonCodec::default()
    }
}

impl Codec for JsonCodec {
    fn encode_request(&self, id: u32, method: &str, params: &Params) -> Bytes {
        to_bytes(&json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params.to_wire(),
        }))
    }

    fn encode_notification(&self, method: &str, params: &Params) -> Bytes {
        to_bytes(&json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.to_wire(),
        }))
    }

    fn encode_response(&self, id: &Id, result: Result<&Value, &Value>) -> Bytes {
        let id = match id {
            Id::Number(n) => json!(n),
            Id::String(s) => json!(s),
        };
        let body = match result {
            Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            Err(payload) => json!({"jsonrpc": "2.0", "id": id, "error": encode_error(payload)}),
        };
        to_bytes(&body)
    }

    fn decode_next(&mut self, read: &mut BytesMut) -> Result<Option<Message>, Error> {
        self.framer.feed(read);
        read.clear();
        match self.framer.next() {
            Some(frame) => decode_frame(&frame).map(Some),
            None => Ok(None),
        }
    }
}

fn to_bytes(body: &Value) -> Bytes {
    Bytes::from(body.to_string().into_bytes())
}

/// Build the error object for an outgoing error reply. String payloads
/// become the `message`; anything else travels in `data`.
fn encode_error(payload: &Value) -> Value {
    match payload {
        Value::String(message) => {
            let code = match message.as_str() {
                UNKNOWN_FUNCTION => METHOD_NOT_FOUND,
                INCOMPATIBLE_ARGUMENTS => INVALID_PARAMS,
                _ => SERVER_ERROR,
            };
            json!({"code": code, "message": message})
        }
        other => json!({"code": SERVER_ERROR, "message": "Server error", "data": other}),
    }
}

fn decode_frame(frame: &[u8]) -> Result<Message, Error> {
    let message: WireMessage = serde_json::from_slice(frame)
        .map_err(|e| Error::Protocol(format!("malformed JSON-RPC message: {}", e)))?;
    if message.jsonrpc != "2.0" {
        return Err(Error::Protocol(format!(
            "unsupported jsonrpc version: {:?}",
            message.jsonrpc
        )));
    }

    let id = decode_id(message.id)?;

    if let Some(method) = message.method {
        let params = Params::from_wire(message.params.unwrap_or(Value::Null));
        return Ok(match id {
            Some(id) => Message::Request { id, method, params },
            None => Message::Notification { method, params },
        });
    }

    let id = id.ok_or_else(|| Error::Protocol("response without an id".to_string()))?;
    let result = match (message.error, message.result) {
        (Some(error), _) => Err(error.data.unwrap_or(Value::String(error.message))),
        (None, result) => Ok(result.unwrap_or(Value::Null)),
    };
    Ok(Message::Response { id, result })
}

fn decode_id(id: Option<Value>) -> Result<Option<Id>, Error> {
    match id {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(n) => Ok(Some(Id::Number(n))),
            None => Err(Error::Protocol(format!("unsupported request id: {}", n))),
        },
        Some(Value::String(s)) => Ok(Some(Id::String(s))),
        Some(other) => Err(Error::Protocol(format!("unsupported request id: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut JsonCodec, bytes: &[u8]) -> Vec<Message> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(message) = codec.decode_next(&mut buf).unwrap() {
            out.push(message);
        }
        out
    }

    #[test]
    fn decodes_positional_request() {
        let mut codec = JsonCodec::new();
        let messages = decode_all(
            &mut codec,
            br#"{"jsonrpc":"2.0","id":7,"method":"add","params":[1,2]}"#,
        );
        assert_eq!(
            messages,
            vec![Message::Request {
                id: Id::Number(7),
                method: "add".to_string(),
                params: Params::Positional(vec![json!(1), json!(2)]),
            }]
        );
    }

    #[test]
    fn decodes_named_request_and_notification() {
        let mut codec = JsonCodec::new();
        let messages = decode_all(
            &mut codec,
            br#"{"jsonrpc":"2.0","id":1,"method":"mul","params":{"a":2}}{"jsonrpc":"2.0","method":"ping"}"#,
        );
        assert!(matches!(
            &messages[0],
            Message::Request { params: Params::Named(_), .. }
        ));
        assert_eq!(
            messages[1],
            Message::Notification {
                method: "ping".to_string(),
                params: Params::none(),
            }
        );
    }

    #[test]
    fn null_id_is_a_notification() {
        let mut codec = JsonCodec::new();
        let messages = decode_all(
            &mut codec,
            br#"{"jsonrpc":"2.0","id":null,"method":"ping","params":[]}"#,
        );
        assert!(matches!(messages[0], Message::Notification { .. }));
    }

    #[test]
    fn decodes_responses() {
        let mut codec = JsonCodec::new();
        let messages = decode_all(
            &mut codec,
            br#"{"jsonrpc":"2.0","id":3,"result":66}{"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"Unknown function"}}"#,
        );
        assert_eq!(
            messages[0],
            Message::Response {
                id: Id::Number(3),
                result: Ok(json!(66)),
            }
        );
        assert_eq!(
            messages[1],
            Message::Response {
                id: Id::Number(4),
                result: Err(Value::String(UNKNOWN_FUNCTION.to_string())),
            }
        );
    }

    #[test]
    fn error_data_takes_precedence_over_message() {
        let mut codec = JsonCodec::new();
        let messages = decode_all(
            &mut codec,
            br#"{"jsonrpc":"2.0","id":5,"error":{"code":-32000,"message":"Server error","data":{"k":1}}}"#,
        );
        assert_eq!(
            messages[0],
            Message::Response {
                id: Id::Number(5),
                result: Err(json!({"k": 1})),
            }
        );
    }

    #[test]
    fn request_round_trip() {
        let mut codec = JsonCodec::new();
        let frame = codec.encode_request(9, "add", &Params::Positional(vec![json!(1), json!(2)]));
        let messages = decode_all(&mut codec, &frame);
        assert_eq!(
            messages,
            vec![Message::Request {
                id: Id::Number(9),
                method: "add".to_string(),
                params: Params::Positional(vec![json!(1), json!(2)]),
            }]
        );
    }

    #[test]
    fn error_reply_round_trips_sentinel_strings() {
        let mut codec = JsonCodec::new();
        let frame = codec.encode_response(
            &Id::Number(2),
            Err(&Value::String(INCOMPATIBLE_ARGUMENTS.to_string())),
        );
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.contains(r#""code":-32602"#));
        let messages = decode_all(&mut codec, text.as_bytes());
        assert_eq!(
            messages[0],
            Message::Response {
                id: Id::Number(2),
                result: Err(Value::String(INCOMPATIBLE_ARGUMENTS.to_string())),
            }
        );
    }

    #[test]
    fn string_id_round_trips() {
        let mut codec = JsonCodec::new();
        let frame = codec.encode_response(&Id::String("abc".to_string()), Ok(&json!(1)));
        let messages = decode_all(&mut codec, &frame);
        assert_eq!(
            messages[0],
            Message::Response {
                id: Id::String("abc".to_string()),
                result: Ok(json!(1)),
            }
        );
    }

    #[test]
    fn wrong_version_is_fatal() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&br#"{"jsonrpc":"1.0","id":1,"method":"x"}"#[..]);
        assert!(matches!(
            codec.decode_next(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn malformed_json_is_fatal() {
        let mut codec = JsonCodec::new();
        let mut buf = BytesMut::from(&b"{\"jsonrpc\" oops}"[..]);
        assert!(matches!(
            codec.decode_next(&mut buf),
            Err(Error::Protocol(_))
        ));
    }
}
