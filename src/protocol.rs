//! Wire frame types for the persistent text-framed socket.
//!
//! Every frame is a JSON object carrying a numeric `action` field. The
//! integer values below are part of the wire contract and must not change.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Hash)]
#[repr(i32)]
pub enum Action {
    Connect = 0,
    Connected = 1,
    Disconnect = 2,
    Disconnected = 3,
    Subscribe = 4,
    Subscribed = 5,
    Unsubscribe = 6,
    Unsubscribed = 7,
    Publish = 8,
    Message = 9,
    Error = 10,
    Ping = 12,
    Pong = 13,
}

impl TryFrom<i32> for Action {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Action::Connect),
            1 => Ok(Action::Connected),
            2 => Ok(Action::Disconnect),
            3 => Ok(Action::Disconnected),
            4 => Ok(Action::Subscribe),
            5 => Ok(Action::Subscribed),
            6 => Ok(Action::Unsubscribe),
            7 => Ok(Action::Unsubscribed),
            8 => Ok(Action::Publish),
            9 => Ok(Action::Message),
            10 => Ok(Action::Error),
            12 => Ok(Action::Ping),
            13 => Ok(Action::Pong),
            other => Err(ProtocolError::UnknownAction(other)),
        }
    }
}

impl From<Action> for i32 {
    fn from(action: Action) -> Self {
        action as i32
    }
}

impl Serialize for Action {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_i32(i32::from(*self))
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = i32::deserialize(deserializer)?;
        Action::try_from(raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown wire action {0}")]
    UnknownAction(i32),
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame carried action {0:?}, expected {1:?}")]
    UnexpectedAction(Action, Action),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDetails {
    pub alias: Option<String>,
    pub client_id: Option<String>,
    pub server_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedFrame {
    pub action: Action,
    pub connection_id: String,
    pub connection_details: ConnectionDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMessage {
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscribeFrame {
    pub action: Action,
    pub channel: String,
}

impl SubscribeFrame {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            action: Action::Subscribe,
            channel: channel.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribedFrame {
    pub action: Action,
    pub channel: String,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnsubscribeFrame {
    pub action: Action,
    pub channel: String,
}

impl UnsubscribeFrame {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            action: Action::Unsubscribe,
            channel: channel.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribedFrame {
    pub action: Action,
    pub channel: String,
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishFrame {
    pub action: Action,
    pub channel: String,
    pub messages: Vec<DataMessage>,
}

impl PublishFrame {
    pub fn new(channel: impl Into<String>, messages: Vec<DataMessage>) -> Self {
        Self {
            action: Action::Publish,
            channel: channel.into(),
            messages,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IncomingDataMessage {
    pub action: Action,
    pub id: String,
    pub timestamp: i64,
    pub channel: String,
    pub messages: Vec<DataMessage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PingFrame {
    pub action: Action,
    pub timestamp: u64,
}

impl PingFrame {
    pub fn new(ping_id: u64) -> Self {
        Self {
            action: Action::Ping,
            timestamp: ping_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PongFrame {
    pub action: Action,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    pub code: Option<i64>,
    pub href: Option<String>,
    pub message: String,
    pub status_code: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorFrame {
    pub action: Action,
    pub channel: Option<String>,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DisconnectedFrame {
    pub action: Action,
}

/// A typed view over an inbound frame, dispatched on its `action` field.
/// `parse` peeks the action out of the raw JSON before committing to the
/// concrete shape, since a malformed `SUBSCRIBED` frame must not be
/// mistaken for some other action.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Connected(ConnectedFrame),
    Disconnected(DisconnectedFrame),
    Subscribed(SubscribedFrame),
    Unsubscribed(UnsubscribedFrame),
    Message(IncomingDataMessage),
    Pong(PongFrame),
    Error(ErrorFrame),
}

impl InboundFrame {
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw)?;
        let action_raw = value.get("action").and_then(Value::as_i64).ok_or_else(|| {
            ProtocolError::Malformed(serde::de::Error::custom("missing action field"))
        })?;
        let action = Action::try_from(action_raw as i32)?;

        Ok(match action {
            Action::Connected => InboundFrame::Connected(serde_json::from_value(value)?),
            Action::Disconnected => InboundFrame::Disconnected(serde_json::from_value(value)?),
            Action::Subscribed => InboundFrame::Subscribed(serde_json::from_value(value)?),
            Action::Unsubscribed => InboundFrame::Unsubscribed(serde_json::from_value(value)?),
            Action::Message => InboundFrame::Message(serde_json::from_value(value)?),
            Action::Pong => InboundFrame::Pong(serde_json::from_value(value)?),
            Action::Error => InboundFrame::Error(serde_json::from_value(value)?),
            other => return Err(ProtocolError::UnexpectedAction(other, Action::Connected)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_json() {
        let json = serde_json::to_string(&Action::Subscribe).unwrap();
        assert_eq!(json, "4");
        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Action::Subscribe);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = Action::try_from(999).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownAction(999)));
    }

    #[test]
    fn parses_subscribed_frame() {
        let raw = r#"{"action":5,"channel":"news","subscription_id":"sub-1"}"#;
        let frame = InboundFrame::parse(raw).unwrap();
        let InboundFrame::Subscribed(subscribed) = frame else {
            panic!("expected Subscribed frame");
        };
        assert_eq!(subscribed.channel, "news");
        assert_eq!(subscribed.subscription_id.as_deref(), Some("sub-1"));
    }

    #[test]
    fn expands_batched_message_ids() {
        let raw = r#"{"action":9,"id":"m1","timestamp":1,"channel":"c","messages":[{"data":1},{"data":2}]}"#;
        let frame = InboundFrame::parse(raw).unwrap();
        let InboundFrame::Message(message) = frame else {
            panic!("expected Message frame");
        };
        assert_eq!(message.messages.len(), 2);
    }

    #[test]
    fn publish_frame_serializes_without_optional_fields() {
        let frame = PublishFrame::new("c", vec![DataMessage {
            data: Value::from(1),
            event: None,
            alias: None,
        }]);
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["messages"][0].get("event"), None);
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        i32::from(*self) == i32::from(*other)
    }
}

impl Eq for Action {}
