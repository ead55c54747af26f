//! Plain data exchanged between the connector, its transport and the
//! subscribers: protocol revisions, connection parameters, option sets and
//! the event model.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{SyncError, SyncResult};

/// Protocol name the 3.1 handshake announces.
pub const LEGACY_PROTOCOL_ID: &str = "MQIsdp";
/// Protocol level byte of the 3.1 handshake.
pub const LEGACY_PROTOCOL_LEVEL: u8 = 3;

/// Retain handling value meaning "never send retained state on subscribe".
pub const RH_NEVER: u8 = 2;

/// Supported MQTT protocol revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MqttVersion {
    #[serde(rename = "3.1")]
    V3_1,
    #[default]
    #[serde(rename = "3.1.1")]
    V3_1_1,
    #[serde(rename = "5.0", alias = "5")]
    V5,
}

impl MqttVersion {
    /// Revisions without native retain handling and disconnect signalling.
    pub fn is_legacy(&self) -> bool {
        matches!(self, MqttVersion::V3_1 | MqttVersion::V3_1_1)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MqttVersion::V3_1 => "3.1",
            MqttVersion::V3_1_1 => "3.1.1",
            MqttVersion::V5 => "5.0",
        }
    }
}

/// Everything that identifies one broker connection.
///
/// Two connectors built from equal parameters share one socket, see
/// [`super::ConnectorRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParams {
    pub host: String,
    pub port: Option<u16>,
    #[serde(default)]
    pub path: String,
    /// `mqtt`, `mqtts`, `ws` or `wss`.
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub mqtt_version: MqttVersion,
    /// HTTP base used to simulate retained messages on legacy revisions.
    #[serde(default)]
    pub rh_path: String,
}

fn default_protocol() -> String {
    "wss".to_string()
}

impl ConnectionParams {
    /// Stable serialization used as registry key. Field order is fixed by
    /// the struct definition.
    pub fn canonical_key(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::Validation(format!("connection parameters: {}", e)))
    }

    /// `<protocol>://<host>:<port><path>`, the port omitted when unset.
    pub fn broker_url(&self) -> String {
        let port = self.port.map(|p| format!(":{}", p)).unwrap_or_default();
        format!("{}://{}{}{}", self.protocol, self.host, port, self.path)
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self.protocol.as_str(), "ws" | "wss")
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.protocol.as_str(), "wss" | "mqtts" | "ssl" | "tls")
    }

    pub fn default_port(&self) -> u16 {
        match self.protocol.as_str() {
            "wss" => 443,
            "ws" => 80,
            "mqtts" | "ssl" | "tls" => 8883,
            _ => 1883,
        }
    }
}

/// Options handed to the transport when opening the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectOptions {
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub clean: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Legacy handshake protocol name; only set for MQTT 3.1.
    pub protocol_id: Option<String>,
    /// Legacy handshake protocol level; only set for MQTT 3.1.
    pub protocol_version: Option<u8>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: format!("sensorsync_{}", uuid::Uuid::new_v4().simple()),
            keep_alive_secs: 60,
            clean: true,
            username: None,
            password: None,
            protocol_id: None,
            protocol_version: None,
        }
    }
}

/// Effective subscribe options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    pub qos: u8,
    pub rh: u8,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { qos: 0, rh: RH_NEVER }
    }
}

/// Caller overrides, merged over [`SubscribeOptions::default`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOverrides {
    pub qos: Option<u8>,
    pub rh: Option<u8>,
}

impl SubscribeOverrides {
    pub fn resolve(&self) -> SubscribeOptions {
        let defaults = SubscribeOptions::default();
        SubscribeOptions {
            qos: self.qos.unwrap_or(defaults.qos),
            rh: self.rh.unwrap_or(defaults.rh),
        }
    }
}

/// A granted subscription as acknowledged by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Granted {
    pub topic: String,
    pub qos: u8,
}

/// Event names handlers can be registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Reconnect,
    Close,
    Disconnect,
    Offline,
    Error,
    End,
    Message,
}

/// A delivered message. Payload and packet are JSON when they parse, or
/// the raw text as a JSON string when they do not.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Value,
    pub packet: Value,
}

impl MqttMessage {
    /// The `retain` flag of the packet, `false` when absent.
    pub fn is_retained(&self) -> bool {
        self.packet.get("retain").and_then(Value::as_bool).unwrap_or(false)
    }
}

/// What registered handlers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum MqttEvent {
    Connect,
    Reconnect,
    Close,
    Disconnect,
    Offline,
    End,
    Error(SyncError),
    Message(MqttMessage),
}

impl MqttEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MqttEvent::Connect => EventKind::Connect,
            MqttEvent::Reconnect => EventKind::Reconnect,
            MqttEvent::Close => EventKind::Close,
            MqttEvent::Disconnect => EventKind::Disconnect,
            MqttEvent::Offline => EventKind::Offline,
            MqttEvent::End => EventKind::End,
            MqttEvent::Error(_) => EventKind::Error,
            MqttEvent::Message(_) => EventKind::Message,
        }
    }
}

/// What a transport emits, before payload decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEvent {
    Connect,
    Reconnect,
    Close,
    Disconnect,
    Offline,
    End,
    Error(SyncError),
    Message { topic: String, payload: Vec<u8>, packet: Vec<u8> },
}

impl RawEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RawEvent::Connect => EventKind::Connect,
            RawEvent::Reconnect => EventKind::Reconnect,
            RawEvent::Close => EventKind::Close,
            RawEvent::Disconnect => EventKind::Disconnect,
            RawEvent::Offline => EventKind::Offline,
            RawEvent::End => EventKind::End,
            RawEvent::Error(_) => EventKind::Error,
            RawEvent::Message { .. } => EventKind::Message,
        }
    }
}
