//! The seam between the connector and an MQTT client library.
//!
//! A transport owns exactly one socket. It forwards low-level events to the
//! listeners bound per [`EventKind`] and reports subscription grants once
//! the broker acknowledges them.

use std::sync::Arc;

use async_trait::async_trait;

use super::types::{ConnectOptions, ConnectionParams, EventKind, Granted, RawEvent, SubscribeOptions};
use crate::errors::SyncResult;

/// Low-level listener bound once per event kind.
pub type RawListener = Arc<dyn Fn(RawEvent) + Send + Sync>;

#[async_trait]
pub trait MqttTransport: Send + Sync {
    /// Opens the socket and completes the handshake.
    async fn connect(&self, options: &ConnectOptions) -> SyncResult<()>;

    /// Adds a listener for `kind`. May be called before `connect`.
    fn bind(&self, kind: EventKind, listener: RawListener);

    /// Subscribes and resolves with the granted QoS.
    async fn subscribe(&self, topic: &str, options: &SubscribeOptions) -> SyncResult<Granted>;

    async fn unsubscribe(&self, topic: &str) -> SyncResult<()>;

    /// Closes the socket. `force` skips the graceful DISCONNECT.
    async fn end(&self, force: bool) -> SyncResult<()>;
}

/// Builds the transport for a new connector.
pub trait TransportFactory: Send + Sync {
    fn create(&self, params: &ConnectionParams) -> SyncResult<Arc<dyn MqttTransport>>;
}
