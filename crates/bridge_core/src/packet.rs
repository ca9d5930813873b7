//! Wire shapes exchanged by two sessions.
//!
//! After the handshake every frame carries one [`Packet`]:
//!
//! * `{name, args, echo}` – a call expecting a reply tagged with `echo`
//! * `{name, args}`       – a notification, no reply
//! * `{echo, result}`     – a successful reply
//! * `{echo, error}`      – a failed reply
//!
//! ```ignore
//! let call = Packet::call("7", "getLog", Some(json!({"level": "info"})));
//! let bytes = encoder.encode(&call)?;
//! ```

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::encoder::EncoderPrefs;

/// First frame each peer sends after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct HandshakeMeta {
    pub id: String,
    pub name: String,
    pub encoders: EncoderPrefs,
}

/// `error` field of a failed reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub echo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteError>,
}

/// What an incoming packet means to the session receiving it.
#[derive(Debug, PartialEq)]
pub enum PacketKind {
    Call {
        name: String,
        args: Value,
        echo: Option<String>,
    },
    Reply {
        echo: String,
        outcome: Result<Value, RemoteError>,
    },
    Malformed,
}

impl Packet {
    /// A call expecting a reply.
    pub fn call(echo: impl Into<String>, name: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            name: Some(name.into()),
            args,
            echo: Some(echo.into()),
            ..Default::default()
        }
    }

    /// A call without `echo`; the receiver never replies.
    pub fn notification(name: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            name: Some(name.into()),
            args,
            ..Default::default()
        }
    }

    pub fn success(echo: impl Into<String>, result: Value) -> Self {
        Self {
            echo: Some(echo.into()),
            result: Some(result),
            ..Default::default()
        }
    }

    pub fn failure(echo: impl Into<String>, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            echo: Some(echo.into()),
            error: Some(RemoteError {
                message: message.into(),
                data,
            }),
            ..Default::default()
        }
    }

    /// A packet with a `name` is a call, otherwise an `echo` makes it a reply.
    pub fn classify(self) -> PacketKind {
        match (self.name, self.echo) {
            (Some(name), echo) => PacketKind::Call {
                name,
                args: self.args.unwrap_or(Value::Null),
                echo,
            },
            (None, Some(echo)) => PacketKind::Reply {
                echo,
                outcome: match self.error {
                    Some(err) => Err(err),
                    None => Ok(self.result.unwrap_or(Value::Null)),
                },
            },
            (None, None) => PacketKind::Malformed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn call_serializes_without_empty_fields() {
        let call = Packet::call("1", "echo", Some(json!("hi")));
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"name": "echo", "args": "hi", "echo": "1"})
        );
    }

    #[test]
    fn classify_packets() {
        assert_eq!(
            Packet::call("9", "ping", None).classify(),
            PacketKind::Call { name: "ping".into(), args: Value::Null, echo: Some("9".into()) }
        );
        assert_eq!(
            Packet::notification("log", Some(json!({"a": 1}))).classify(),
            PacketKind::Call { name: "log".into(), args: json!({"a": 1}), echo: None }
        );
        assert_eq!(
            Packet::success("3", json!(null)).classify(),
            PacketKind::Reply { echo: "3".into(), outcome: Ok(Value::Null) }
        );
        match Packet::failure("4", "boom", None).classify() {
            PacketKind::Reply { echo, outcome: Err(err) } => {
                assert_eq!(echo, "4");
                assert_eq!(err.message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(Packet::default().classify(), PacketKind::Malformed);
    }

    #[test]
    fn handshake_meta_accepts_missing_compress() {
        let meta: HandshakeMeta = serde_json::from_value(json!({
            "id": "a",
            "name": "onebot",
            "encoders": {"encode": ["json"], "verify": ["sha256"]}
        }))
        .unwrap();
        assert!(meta.encoders.compress.is_empty());
        assert_eq!(meta.encoders.verify, vec!["sha256".to_string()]);
    }
}
