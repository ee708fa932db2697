//! Call envelopes for the request/response transport.
//!
//! Message delimiting lives in the mux layer ([`crate::mux::MuxStream`]'s
//! `send_message`/`recv_message`); this module only defines what the bytes
//! say. Every message is one JSON envelope: a `call` names a service and a
//! method and carries its arguments, a `reply` echoes the call's sequence
//! number with either a value or an error. Sequence numbers are allocated
//! by the calling side and let it detect replies arriving out of order.
//!
//! ```text
//! {"kind":"call","seq":4,"service":"Control","method":"ping","args":null}
//! {"kind":"reply","seq":4,"value":"pong"}
//! {"kind":"reply","seq":9,"error":{"code":2,"message":"unknown plugin: kv"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SkiffError};

/// Error codes carried in a reply's `error.code` field.
pub mod code {
    /// The envelope itself could not be decoded.
    pub const MALFORMED: i32 = 1;
    /// No such service, method, or plugin.
    pub const UNKNOWN_TARGET: i32 = 2;
    /// The arguments did not fit the method.
    pub const BAD_ARGS: i32 = 3;
    /// The handler failed.
    pub const FAULT: i32 = 4;
}

/// One message on a substream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    Call(Call),
    Reply(Reply),
}

/// An invocation of `service.method(args)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub seq: u64,
    pub service: String,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

/// The outcome of a call. Exactly one of `value` and `error` is set; a
/// reply carrying neither reads as a null value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
}

/// A failed call, as it travels on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallError {
    pub code: i32,
    pub message: String,
}

impl Envelope {
    pub fn call(seq: u64, service: &str, method: &str, args: Value) -> Envelope {
        Envelope::Call(Call {
            seq,
            service: service.to_string(),
            method: method.to_string(),
            args,
        })
    }

    pub fn reply_ok(seq: u64, value: Value) -> Envelope {
        Envelope::Reply(Reply {
            seq,
            value: Some(value),
            error: None,
        })
    }

    pub fn reply_err(seq: u64, code: i32, message: impl Into<String>) -> Envelope {
        Envelope::Reply(Reply {
            seq,
            value: None,
            error: Some(CallError {
                code,
                message: message.into(),
            }),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl Reply {
    /// Collapse the wire outcome into the caller's result.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(SkiffError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(self.value.unwrap_or(Value::Null))
    }
}

/// The wire code a handler-side error travels under.
pub fn error_code(err: &SkiffError) -> i32 {
    match err {
        SkiffError::UnknownPlugin { .. } => code::UNKNOWN_TARGET,
        SkiffError::Json { .. } => code::BAD_ARGS,
        SkiffError::Config { .. } => code::BAD_ARGS,
        _ => code::FAULT,
    }
}
