// GraphQL over WebSocket subprotocols

//! # WebSocket Subprotocols
//!
//! Two subprotocols are spoken on `GET /graphql`:
//!
//! | direction | `graphql-transport-ws` | legacy `graphql-ws` |
//! |-----------|------------------------|---------------------|
//! | client    | `connection_init`, `subscribe`, `complete`, `ping`, `pong` | `connection_init`, `start`, `stop`, `connection_terminate` |
//! | server    | `connection_ack`, `next`, `error`, `complete`, `ping`, `pong` | `connection_ack`, `data`, `error`, `complete`, `ka` |
//!
//! Both share the envelope `{"id", "type", "payload"}`, so decoding goes
//! through one raw message type and the protocol only decides the names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::connection::{Frame, OutboundFrame};
use crate::models::event::errors_payload;
use crate::models::{GraphQLError, SubscriptionRequest};
use crate::{EventRouterError, Result};

pub const TRANSPORT_WS_PROTOCOL: &str = "graphql-transport-ws";
pub const LEGACY_WS_PROTOCOL: &str = "graphql-ws";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WsProtocol {
    #[default]
    TransportWs,
    LegacyWs,
}

impl WsProtocol {
    pub fn name(&self) -> &'static str {
        match self {
            WsProtocol::TransportWs => TRANSPORT_WS_PROTOCOL,
            WsProtocol::LegacyWs => LEGACY_WS_PROTOCOL,
        }
    }

    /// Picks the first supported entry of a `Sec-WebSocket-Protocol` header.
    ///
    /// Falls back to `graphql-transport-ws` when nothing usable is offered.
    pub fn from_header(header: Option<&str>) -> Self {
        header
            .into_iter()
            .flat_map(|value| value.split(','))
            .map(str::trim)
            .find_map(|offered| match offered {
                TRANSPORT_WS_PROTOCOL => Some(WsProtocol::TransportWs),
                LEGACY_WS_PROTOCOL => Some(WsProtocol::LegacyWs),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn decode(&self, text: &str) -> Result<ClientMessage> {
        let raw: RawMessage = serde_json::from_str(text)
            .map_err(|e| EventRouterError::InvalidOperation(format!("Invalid message received: {}", e)))?;

        let message = match (self, raw.kind.as_str()) {
            (_, "connection_init") => ClientMessage::ConnectionInit(raw.payload),
            (WsProtocol::TransportWs, "subscribe") | (WsProtocol::LegacyWs, "start") => {
                let id = raw.require_id()?;
                let payload = raw.payload.unwrap_or(Value::Null);
                let request: SubscriptionRequest = serde_json::from_value(payload).map_err(|e| {
                    EventRouterError::InvalidOperation(format!("Invalid subscribe payload: {}", e))
                })?;
                ClientMessage::Subscribe { id, request }
            }
            (WsProtocol::TransportWs, "complete") | (WsProtocol::LegacyWs, "stop") => {
                ClientMessage::Complete {
                    id: raw.require_id()?,
                }
            }
            (WsProtocol::TransportWs, "ping") => ClientMessage::Ping(raw.payload),
            (WsProtocol::TransportWs, "pong") => ClientMessage::Pong,
            (WsProtocol::LegacyWs, "connection_terminate") => ClientMessage::Terminate,
            (_, other) => {
                return Err(EventRouterError::InvalidOperation(format!(
                    "Unsupported message type '{}' for {}",
                    other,
                    self.name()
                )))
            }
        };
        Ok(message)
    }

    pub fn encode(&self, message: &ServerMessage) -> Result<String> {
        let raw = match (self, message) {
            (_, ServerMessage::ConnectionAck) => RawMessage::new("connection_ack"),
            (WsProtocol::TransportWs, ServerMessage::KeepAlive) => RawMessage::new("ping"),
            (WsProtocol::LegacyWs, ServerMessage::KeepAlive) => RawMessage::new("ka"),
            (WsProtocol::TransportWs, ServerMessage::Next { id, payload }) => {
                RawMessage::new("next").with_id(id).with_payload(payload.clone())
            }
            (WsProtocol::LegacyWs, ServerMessage::Next { id, payload }) => {
                RawMessage::new("data").with_id(id).with_payload(payload.clone())
            }
            (WsProtocol::TransportWs, ServerMessage::Error { id, errors }) => RawMessage::new("error")
                .with_id(id)
                .with_payload(serde_json::to_value(errors)?),
            // Legacy clients expect execution errors inside a data message
            (WsProtocol::LegacyWs, ServerMessage::Error { id, errors }) => {
                RawMessage::new("data").with_id(id).with_payload(errors_payload(errors))
            }
            (_, ServerMessage::Complete { id }) => RawMessage::new("complete").with_id(id),
            (_, ServerMessage::Pong(payload)) => {
                let raw = RawMessage::new("pong");
                match payload {
                    Some(payload) => raw.with_payload(payload.clone()),
                    None => raw,
                }
            }
            (_, ServerMessage::Close { .. }) => {
                return Err(EventRouterError::Internal(
                    "close frames are not text messages".to_string(),
                ))
            }
        };
        Ok(serde_json::to_string(&raw)?)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,

    #[serde(rename = "type")]
    kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
}

impl RawMessage {
    fn new(kind: &str) -> Self {
        Self {
            id: None,
            kind: kind.to_string(),
            payload: None,
        }
    }

    fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    fn require_id(&self) -> Result<String> {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(EventRouterError::InvalidOperation(format!(
                "Message of type '{}' is missing an id",
                self.kind
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ConnectionInit(Option<Value>),
    Subscribe { id: String, request: SubscriptionRequest },
    Complete { id: String },
    Ping(Option<Value>),
    Pong,
    Terminate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ConnectionAck,
    KeepAlive,
    Next { id: String, payload: Value },
    Error { id: String, errors: Vec<GraphQLError> },
    Complete { id: String },
    Pong(Option<Value>),
    /// Closes the socket with a protocol close code
    Close { code: u16, reason: String },
}

impl From<OutboundFrame> for ServerMessage {
    fn from(outbound: OutboundFrame) -> Self {
        let id = outbound.client_id;
        match outbound.frame {
            Frame::Next(payload) => ServerMessage::Next { id, payload },
            Frame::Error(errors) => ServerMessage::Error { id, errors },
            Frame::Complete => ServerMessage::Complete { id },
        }
    }
}

pub mod close_code {
    pub const INVALID_MESSAGE: u16 = 4400;
    pub const UNAUTHORIZED: u16 = 4401;
    pub const INIT_TIMEOUT: u16 = 4408;
    pub const SUBSCRIBER_EXISTS: u16 = 4409;
    pub const TOO_MANY_INIT_REQUESTS: u16 = 4429;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_negotiation() {
        assert_eq!(WsProtocol::from_header(None), WsProtocol::TransportWs);
        assert_eq!(WsProtocol::from_header(Some("graphql-ws")), WsProtocol::LegacyWs);
        assert_eq!(
            WsProtocol::from_header(Some("chat, graphql-transport-ws, graphql-ws")),
            WsProtocol::TransportWs
        );
        assert_eq!(WsProtocol::from_header(Some("chat")), WsProtocol::TransportWs);
    }

    #[test]
    fn test_decode_subscribe() {
        let text = r#"{"id":"1","type":"subscribe","payload":{"query":"subscription { a { id } }","variables":{"x":1}}}"#;
        match WsProtocol::TransportWs.decode(text).unwrap() {
            ClientMessage::Subscribe { id, request } => {
                assert_eq!(id, "1");
                assert_eq!(request.query, "subscription { a { id } }");
                assert_eq!(request.variables, Some(json!({"x": 1})));
            }
            other => panic!("unexpected message {:?}", other),
        }

        // `start` only exists in the legacy protocol
        let legacy = r#"{"id":"1","type":"start","payload":{"query":"subscription { a { id } }"}}"#;
        assert!(matches!(
            WsProtocol::LegacyWs.decode(legacy),
            Ok(ClientMessage::Subscribe { .. })
        ));
        assert!(WsProtocol::TransportWs.decode(legacy).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_messages() {
        assert!(WsProtocol::TransportWs.decode("not json").is_err());
        assert!(WsProtocol::TransportWs
            .decode(r#"{"type":"subscribe","payload":{"query":"x"}}"#)
            .is_err());
        assert!(WsProtocol::TransportWs.decode(r#"{"type":"ka"}"#).is_err());
        assert_eq!(
            WsProtocol::LegacyWs.decode(r#"{"type":"connection_terminate"}"#).unwrap(),
            ClientMessage::Terminate
        );
    }

    #[test]
    fn test_encode_errors_per_protocol() {
        let message = ServerMessage::Error {
            id: "1".to_string(),
            errors: vec![GraphQLError::internal()],
        };

        assert_eq!(
            WsProtocol::TransportWs.encode(&message).unwrap(),
            r#"{"id":"1","type":"error","payload":[{"message":"Internal server error"}]}"#
        );
        assert_eq!(
            WsProtocol::LegacyWs.encode(&message).unwrap(),
            r#"{"id":"1","type":"data","payload":{"errors":[{"message":"Internal server error"}],"data":null}}"#
        );
    }

    #[test]
    fn test_encode_keep_alive() {
        assert_eq!(WsProtocol::LegacyWs.encode(&ServerMessage::KeepAlive).unwrap(), r#"{"type":"ka"}"#);
        assert_eq!(
            WsProtocol::TransportWs.encode(&ServerMessage::ConnectionAck).unwrap(),
            r#"{"type":"connection_ack"}"#
        );
        assert!(WsProtocol::TransportWs
            .encode(&ServerMessage::Close {
                code: 4400,
                reason: String::new()
            })
            .is_err());
    }
}
