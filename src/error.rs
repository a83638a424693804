//! Engine error type and the wire-contract error messages.
//!
//! Errors partition into call-level (reach exactly one caller, leave the
//! session running) and session-level (tear the session down and fail every
//! outstanding call). The string constants below travel on the wire verbatim
//! and peers depend on them.

use std::fmt;

use serde_json::Value;

/// Reply payload when a handler signals an error without one.
pub const ERROR_DURING_CALL: &str = "Error during call";
/// Reply payload when a completion handle is dropped unfired.
pub const NO_RESULT: &str = "Call finished with no result";
/// Reply payload for a method name with no registered handler.
pub const UNKNOWN_FUNCTION: &str = "Unknown function";
/// Reply payload when wire params cannot be adapted to a handler signature.
pub const INCOMPATIBLE_ARGUMENTS: &str = "Incompatible arguments";

/// Error surfaced by client calls and session operations.
#[derive(Debug)]
pub enum Error {
    /// The peer answered the call with an error payload.
    Call(Value),
    /// The call's deadline elapsed before a response arrived.
    Timeout,
    /// The call was cancelled locally before it completed.
    Cancelled,
    /// The session closed before the call completed.
    SessionClosed,
    /// The wire protocol was violated, or arguments could not be
    /// represented on it. Decode-side violations are fatal to the session.
    Protocol(String),
}

impl Error {
    /// The error payload the peer attached to a failed call, if any.
    pub fn call_payload(&self) -> Option<&Value> {
        match self {
            Error::Call(payload) => Some(payload),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Call(Value::String(payload)) => write!(f, "Call error: {}", payload),
            Error::Call(payload) => write!(f, "Call error: {}", payload),
            Error::Timeout => write!(f, "Call timed out"),
            Error::Cancelled => write!(f, "Call cancelled"),
            Error::SessionClosed => write!(f, "Session closed"),
            Error::Protocol(detail) => write!(f, "Protocol violation: {}", detail),
        }
    }
}

impl std::error::Error for Error {}
