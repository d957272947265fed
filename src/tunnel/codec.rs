//! Control Protocol Codec.
//!
//! Translates [`ControlMessage`]s to and from the text and binary messages the
//! peer transport carries. Three framings are supported:
//!
//! * `multiplexed`: one JSON object per message, payload bytes as a JSON array.
//! * `compact`: one binary message per control message, bincode encoded.
//! * `unplexed`: JSON control messages without ids, payload as raw binary
//!   messages. Only a single logical connection can exist.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::transport::WireMessage;
use crate::tunnel::protocol::{ConnectionId, ControlMessage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Framing {
    #[default]
    Multiplexed,
    Compact,
    Unplexed,
}

impl Framing {
    pub fn name(self) -> &'static str {
        match self {
            Framing::Multiplexed => "multiplexed",
            Framing::Compact => "compact",
            Framing::Unplexed => "unplexed",
        }
    }

    /// Whether more than one logical connection may share the channel.
    pub fn is_multiplexed(self) -> bool {
        !matches!(self, Framing::Unplexed)
    }
}

/// JSON shape of a control message.
#[derive(Serialize, Deserialize, Debug, Default)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, alias = "connectionId", skip_serializing_if = "Option::is_none")]
    id: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// Payload bytes; peers written for Node send buffers as `{"type":"Buffer","data":[..]}`.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
enum Payload {
    Bytes(Vec<u8>),
    Buffer {
        #[serde(rename = "type")]
        kind: String,
        data: Vec<u8>,
    },
}

impl Payload {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Payload::Bytes(data) | Payload::Buffer { data, .. } => data,
        }
    }
}

impl Envelope {
    fn from_message(msg: &ControlMessage, with_id: bool) -> Self {
        let mut env = Envelope {
            kind: msg.kind().to_string(),
            id: with_id.then(|| msg.id().clone()),
            ..Envelope::default()
        };
        match msg {
            ControlMessage::Connect { host, port, .. } => {
                env.host = Some(host.clone());
                env.port = Some(*port);
            }
            ControlMessage::Data { data, .. } => env.data = Some(Payload::Bytes(data.clone())),
            ControlMessage::Error { message, .. } => env.message = Some(message.clone()),
            ControlMessage::Connected { .. } | ControlMessage::Closed { .. } => {}
        }
        env
    }

    fn into_message(self, fallback_id: Option<ConnectionId>) -> Result<ControlMessage, CodecError> {
        let id = self
            .id
            .or(fallback_id)
            .ok_or(CodecError::MissingField("id"))?;
        let msg = match self.kind.as_str() {
            "connect" => ControlMessage::Connect {
                id,
                host: self.host.ok_or(CodecError::MissingField("host"))?,
                port: self.port.ok_or(CodecError::MissingField("port"))?,
            },
            "connected" => ControlMessage::Connected { id },
            "data" => ControlMessage::Data {
                id,
                data: self
                    .data
                    .ok_or(CodecError::MissingField("data"))?
                    .into_bytes(),
            },
            "closed" => ControlMessage::Closed { id },
            "error" => ControlMessage::Error {
                id,
                message: self.message.ok_or(CodecError::MissingField("message"))?,
            },
            _ => return Err(CodecError::UnknownType(self.kind)),
        };
        Ok(msg)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Codec {
    framing: Framing,
}

impl Codec {
    pub fn new(framing: Framing) -> Self {
        Self { framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn encode(&self, msg: &ControlMessage) -> Result<WireMessage, CodecError> {
        match self.framing {
            Framing::Multiplexed => {
                let env = Envelope::from_message(msg, true);
                Ok(WireMessage::Text(serde_json::to_string(&env)?))
            }
            Framing::Compact => Ok(WireMessage::Binary(bincode::serialize(msg)?)),
            Framing::Unplexed => match msg {
                ControlMessage::Data { data, .. } => Ok(WireMessage::Binary(data.clone())),
                other => {
                    let env = Envelope::from_message(other, false);
                    Ok(WireMessage::Text(serde_json::to_string(&env)?))
                }
            },
        }
    }

    pub fn decode(&self, wire: WireMessage) -> Result<ControlMessage, CodecError> {
        match (self.framing, wire) {
            (Framing::Multiplexed, WireMessage::Text(text)) => {
                serde_json::from_str::<Envelope>(&text)?.into_message(None)
            }
            (Framing::Compact, WireMessage::Binary(bytes)) => Ok(bincode::deserialize(&bytes)?),
            (Framing::Unplexed, WireMessage::Text(text)) => {
                serde_json::from_str::<Envelope>(&text)?.into_message(Some(ConnectionId::solo()))
            }
            (Framing::Unplexed, WireMessage::Binary(data)) => Ok(ControlMessage::Data {
                id: ConnectionId::solo(),
                data,
            }),
            (framing, wire) => Err(CodecError::UnexpectedKind {
                kind: wire.kind(),
                framing: framing.name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<ControlMessage> {
        vec![
            ControlMessage::Connect {
                id: "conn_1".into(),
                host: "example.com".into(),
                port: 80,
            },
            ControlMessage::Connected { id: "conn_1".into() },
            ControlMessage::Data {
                id: "conn_1".into(),
                data: vec![0, 1, 2, 255],
            },
            ControlMessage::Closed { id: "conn_1".into() },
            ControlMessage::Error {
                id: "conn_1".into(),
                message: "connection refused".into(),
            },
        ]
    }

    #[test]
    fn test_multiplexed_and_compact_preserve_every_kind() {
        for framing in [Framing::Multiplexed, Framing::Compact] {
            let codec = Codec::new(framing);
            for msg in samples() {
                let wire = codec.encode(&msg).unwrap();
                assert_eq!(codec.decode(wire).unwrap(), msg, "{:?}", framing);
            }
        }
    }

    #[test]
    fn test_multiplexed_wire_shape() {
        let codec = Codec::new(Framing::Multiplexed);
        let wire = codec
            .encode(&ControlMessage::Connect {
                id: "c1".into(),
                host: "10.0.0.5".into(),
                port: 22,
            })
            .unwrap();
        let WireMessage::Text(text) = wire else {
            panic!("expected text message");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "connect");
        assert_eq!(value["id"], "c1");
        assert_eq!(value["host"], "10.0.0.5");
        assert_eq!(value["port"], 22);
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_decodes_node_buffer_payload_and_legacy_id() {
        let codec = Codec::new(Framing::Multiplexed);
        let text = r#"{"type":"data","connectionId":"conn_3","data":{"type":"Buffer","data":[104,105]}}"#;
        let msg = codec.decode(WireMessage::Text(text.into())).unwrap();
        assert_eq!(
            msg,
            ControlMessage::Data {
                id: "conn_3".into(),
                data: b"hi".to_vec(),
            }
        );
    }

    #[test]
    fn test_unplexed_sends_raw_payloads() {
        let codec = Codec::new(Framing::Unplexed);
        let wire = codec
            .encode(&ControlMessage::Data {
                id: ConnectionId::solo(),
                data: b"raw".to_vec(),
            })
            .unwrap();
        assert_eq!(wire, WireMessage::Binary(b"raw".to_vec()));

        let wire = codec
            .encode(&ControlMessage::Closed {
                id: ConnectionId::solo(),
            })
            .unwrap();
        assert_eq!(wire, WireMessage::Text(r#"{"type":"closed"}"#.into()));
        assert_eq!(
            codec.decode(wire).unwrap(),
            ControlMessage::Closed {
                id: ConnectionId::solo()
            }
        );
    }

    #[test]
    fn test_malformed_messages_are_errors() {
        let codec = Codec::new(Framing::Multiplexed);
        assert!(codec.decode(WireMessage::Text("not json".into())).is_err());
        assert!(codec
            .decode(WireMessage::Text(r#"{"type":"connect","id":"c1"}"#.into()))
            .is_err());
        assert!(codec
            .decode(WireMessage::Text(r#"{"type":"bogus","id":"c1"}"#.into()))
            .is_err());
        assert!(matches!(
            codec.decode(WireMessage::Text(r#"{"type":"error","id":"c1"}"#.into())),
            Err(CodecError::MissingField("message"))
        ));
        assert!(codec.decode(WireMessage::Binary(vec![1, 2, 3])).is_err());

        let compact = Codec::new(Framing::Compact);
        assert!(compact.decode(WireMessage::Binary(vec![9, 9])).is_err());
    }
}
