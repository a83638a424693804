//! Dialect-neutral message model.
//!
//! Both wire dialects decode into the same three message kinds, so the
//! session, dispatcher and pending-call table never see dialect-specific
//! framing.

use serde_json::{Map, Value};

/// Identifier of a request, echoed verbatim in its response.
///
/// The engine assigns numeric ids. The JSON dialect additionally accepts
/// string ids from peers and mirrors them back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Id {
    Number(u64),
    String(String),
}

impl Id {
    /// Interpret this id as a client-assigned request id, accepting the
    /// string form some JSON peers reply with.
    pub(crate) fn as_request_id(&self) -> Option<u32> {
        match self {
            Id::Number(n) => u32::try_from(*n).ok(),
            Id::String(s) => s.parse().ok(),
        }
    }
}

impl From<u32> for Id {
    fn from(id: u32) -> Self {
        Id::Number(u64::from(id))
    }
}

/// Call parameters as found on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Params {
    /// A positional argument array.
    Positional(Vec<Value>),
    /// A named argument map.
    Named(Map<String, Value>),
    /// Anything else. Carried through so the handler adapter can reject the
    /// call with a call-level error instead of tearing the session down.
    Other(Value),
}

impl Params {
    /// An empty positional argument list.
    pub fn none() -> Params {
        Params::Positional(Vec::new())
    }

    pub fn len(&self) -> usize {
        match self {
            Params::Positional(args) => args.len(),
            Params::Named(args) => args.len(),
            Params::Other(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Params::Positional(args) => args.is_empty(),
            Params::Named(args) => args.is_empty(),
            Params::Other(_) => false,
        }
    }

    pub(crate) fn from_wire(value: Value) -> Params {
        match value {
            Value::Null => Params::none(),
            Value::Array(args) => Params::Positional(args),
            Value::Object(args) => Params::Named(args),
            other => Params::Other(other),
        }
    }

    pub(crate) fn to_wire(&self) -> Value {
        match self {
            Params::Positional(args) => Value::Array(args.clone()),
            Params::Named(args) => Value::Object(args.clone()),
            Params::Other(value) => value.clone(),
        }
    }
}

/// A single decoded wire message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: Id,
        method: String,
        params: Params,
    },
    Notification {
        method: String,
        params: Params,
    },
    /// `result` carries the call outcome; `Err` holds the peer's error
    /// payload.
    Response {
        id: Id,
        result: Result<Value, Value>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_from_wire_shapes() {
        assert_eq!(Params::from_wire(Value::Null), Params::none());
        assert_eq!(
            Params::from_wire(json!([1, 2])),
            Params::Positional(vec![json!(1), json!(2)])
        );
        assert!(matches!(Params::from_wire(json!({"a": 1})), Params::Named(_)));
        assert!(matches!(Params::from_wire(json!(42)), Params::Other(_)));
    }

    #[test]
    fn params_round_trip_to_wire() {
        let positional = Params::from_wire(json!(["x", 2]));
        assert_eq!(positional.to_wire(), json!(["x", 2]));

        let named = Params::from_wire(json!({"a": 1}));
        assert_eq!(named.to_wire(), json!({"a": 1}));
    }

    #[test]
    fn id_correlation_accepts_string_form() {
        assert_eq!(Id::Number(7).as_request_id(), Some(7));
        assert_eq!(Id::String("7".to_string()).as_request_id(), Some(7));
        assert_eq!(Id::String("seven".to_string()).as_request_id(), None);
        assert_eq!(Id::Number(u64::MAX).as_request_id(), None);
    }
}
