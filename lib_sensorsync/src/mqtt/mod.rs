//! # MQTT Module
//!
//! A protocol-normalizing layer over MQTT 3.1, 3.1.1 and 5.0 so that push
//! subscribers see one behaviour regardless of the broker's revision.
//!
//! ## Contained Modules:
//!
//! - **`types`**: Protocol revisions, connection parameters, connect and
//!   subscribe options, and the event model.
//! - **`transport`**: The `MqttTransport` seam a client library plugs into.
//! - **`connector`**: `MqttConnector`, which adds handler fan-out, lenient
//!   decoding, legacy handshake injection and retained-message simulation.
//! - **`registry`**: `ConnectorRegistry`, sharing one connector between all
//!   users of identical connection parameters.
//! - **`rumqtt`**: The `rumqttc` transport (feature `rumqttc-transport`).

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod connector;
pub mod registry;
#[cfg(feature = "rumqttc-transport")]
pub mod rumqtt;
pub mod transport;
pub mod types;

pub use connector::{EventHandler, HandlerId, MqttConnector};
pub use registry::ConnectorRegistry;
#[cfg(feature = "rumqttc-transport")]
pub use rumqtt::{RumqttFactory, RumqttTransport};
pub use transport::{MqttTransport, RawListener, TransportFactory};
pub use types::{
    ConnectOptions, ConnectionParams, EventKind, Granted, MqttEvent, MqttMessage, MqttVersion, RawEvent,
    SubscribeOptions, SubscribeOverrides,
};
