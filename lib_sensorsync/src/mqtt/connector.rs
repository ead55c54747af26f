//! # MQTT Connector
//!
//! One connector per broker connection. It normalizes the differences
//! between MQTT 3.1, 3.1.1 and 5.0 for its subscribers:
//!
//! - 3.1 handshakes get the legacy protocol name and level injected.
//! - Handlers are fanned out: the first handler for an event kind binds a
//!   single transport listener that calls every handler of that kind.
//! - Payloads and packets are JSON-decoded leniently.
//! - Legacy revisions cannot deliver retained state on subscribe, so the
//!   latest state is fetched over HTTP and delivered as a retained message.
//! - Granted subscriptions are remembered and issued again after the
//!   transport reconnected with a clean session.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};
use serde_json::{json, Value};

use super::transport::{MqttTransport, RawListener};
use super::types::{
    ConnectOptions, ConnectionParams, EventKind, Granted, MqttEvent, MqttMessage, MqttVersion, RawEvent,
    SubscribeOptions, SubscribeOverrides, LEGACY_PROTOCOL_ID, LEGACY_PROTOCOL_LEVEL, RH_NEVER,
};
use crate::errors::{SyncError, SyncResult};
use crate::retrieve::HttpGet;

/// Query suffix selecting the newest entry of an Observations collection.
pub const LATEST_OBSERVATION_QUERY: &str = "?$orderby=phenomenonTime%20desc&$top=1";

/// A registered event handler.
pub type EventHandler = Arc<dyn Fn(&MqttEvent) + Send + Sync>;

/// Identifies a handler for [`MqttConnector::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct HandlerTable {
    next_id: u64,
    handlers: HashMap<EventKind, Vec<(HandlerId, EventHandler)>>,
    bound: HashSet<EventKind>,
}

impl HandlerTable {
    fn snapshot(&self, kind: EventKind) -> Vec<EventHandler> {
        self.handlers
            .get(&kind)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// Topics granted on this connection, replayed after a reconnect.
#[derive(Clone)]
struct Resubscriber {
    transport: Arc<dyn MqttTransport>,
    granted: Arc<Mutex<BTreeMap<String, SubscribeOptions>>>,
}

impl Resubscriber {
    fn remember(&self, topic: &str, options: SubscribeOptions) {
        self.granted.lock().unwrap_or_else(PoisonError::into_inner).insert(topic.to_string(), options);
    }

    fn forget(&self, topic: &str) {
        self.granted.lock().unwrap_or_else(PoisonError::into_inner).remove(topic);
    }

    fn topics(&self) -> Vec<String> {
        self.granted.lock().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }

    /// Issues every remembered subscription again on a background task.
    /// Failures reach the `Error` handlers.
    fn replay(&self, handlers: Arc<Mutex<HandlerTable>>) {
        let pending: Vec<(String, SubscribeOptions)> = self
            .granted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(topic, options)| (topic.clone(), *options))
            .collect();
        if pending.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to restore {} subscriptions after reconnect", pending.len());
            return;
        };

        info!("Restoring {} subscriptions after reconnect", pending.len());
        let transport = self.transport.clone();
        runtime.spawn(async move {
            for (topic, options) in pending {
                match transport.subscribe(&topic, &options).await {
                    Ok(granted) => debug!("Resubscribed to {} with qos {}", granted.topic, granted.qos),
                    Err(e) => {
                        warn!("Resubscribing {} failed: {}", topic, e);
                        let snapshot =
                            handlers.lock().unwrap_or_else(PoisonError::into_inner).snapshot(EventKind::Error);
                        let event = MqttEvent::Error(e);
                        for handler in snapshot {
                            handler(&event);
                        }
                    }
                }
            }
        });
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ConnectionState {
    connected: bool,
    ended: bool,
}

pub struct MqttConnector {
    params: ConnectionParams,
    transport: Arc<dyn MqttTransport>,
    http: Arc<dyn HttpGet>,
    handlers: Arc<Mutex<HandlerTable>>,
    resubscriber: Resubscriber,
    state: Mutex<ConnectionState>,
}

impl MqttConnector {
    /// Builds an unconnected connector. Prefer
    /// [`super::ConnectorRegistry::get_or_create`], which shares connectors
    /// with identical parameters.
    pub fn new(params: ConnectionParams, transport: Arc<dyn MqttTransport>, http: Arc<dyn HttpGet>) -> Self {
        let resubscriber = Resubscriber { transport: transport.clone(), granted: Arc::default() };
        Self {
            params,
            transport,
            http,
            handlers: Arc::new(Mutex::new(HandlerTable::default())),
            resubscriber,
            state: Mutex::new(ConnectionState::default()),
        }
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn version(&self) -> MqttVersion {
        self.params.mqtt_version
    }

    /// `true` until [`MqttConnector::end`] succeeded.
    pub fn is_live(&self) -> bool {
        !self.state().ended
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self, operation: &str) -> SyncResult<()> {
        let state = self.state();
        if state.ended {
            return Err(SyncError::Configuration(format!("cannot {}: connection has ended", operation)));
        }
        if !state.connected {
            return Err(SyncError::Configuration(format!("cannot {}: not connected", operation)));
        }
        Ok(())
    }

    /// Opens the connection. Connecting an already connected connector is
    /// a no-op, so layers sharing it may all call this.
    pub async fn connect(&self, options: ConnectOptions) -> SyncResult<()> {
        let state = self.state();
        if state.ended {
            return Err(SyncError::Configuration("connection has ended".to_string()));
        }
        if state.connected {
            return Ok(());
        }
        let options = adapt_connect_options(options, self.version());
        info!("Connecting to {} (MQTT {})", self.params.broker_url(), self.version().as_str());
        self.bind(EventKind::Reconnect);
        self.transport.connect(&options).await?;
        self.state.lock().unwrap_or_else(PoisonError::into_inner).connected = true;
        Ok(())
    }

    /// Registers `handler` for `kind`.
    ///
    /// # Errors
    /// `Disconnect` handlers require MQTT 5.0; older revisions have no
    /// disconnect signalling and fail with `SyncError::Configuration`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SyncResult<HandlerId>
    where
        F: Fn(&MqttEvent) + Send + Sync + 'static,
    {
        if kind == EventKind::Disconnect && self.version() != MqttVersion::V5 {
            return Err(SyncError::Configuration(format!(
                "'disconnect' events are not supported by MQTT {}",
                self.version().as_str()
            )));
        }

        let id = {
            let mut table = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            table.next_id += 1;
            let id = HandlerId(table.next_id);
            table.handlers.entry(kind).or_default().push((id, Arc::new(handler)));
            id
        };
        self.bind(kind);
        Ok(id)
    }

    /// Binds the fan-out listener for `kind` unless it is bound already.
    fn bind(&self, kind: EventKind) {
        let needs_binding = self.handlers.lock().unwrap_or_else(PoisonError::into_inner).bound.insert(kind);
        if needs_binding {
            debug!("Binding transport listener for {:?}", kind);
            self.transport.bind(kind, fan_out(self.handlers.clone(), self.resubscriber.clone()));
        }
    }

    /// Deregisters a handler. The transport listener stays bound.
    pub fn off(&self, id: HandlerId) -> bool {
        let mut table = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in table.handlers.values_mut() {
            let before = list.len();
            list.retain(|(h, _)| *h != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Number of handlers registered for `kind`.
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Subscribes to `topic` with `overrides` merged over `{qos: 0, rh: 2}`.
    ///
    /// On legacy revisions an `rh` other than 2 additionally delivers the
    /// current state of the topic as a retained message. Failures of that
    /// lookup reach the `Error` handlers and do not fail the subscription.
    pub async fn subscribe(&self, topic: &str, overrides: SubscribeOverrides) -> SyncResult<Granted> {
        self.ensure_connected("subscribe")?;
        let options = overrides.resolve();
        let granted = self.transport.subscribe(topic, &options).await?;
        debug!("Subscribed to {} with qos {}", granted.topic, granted.qos);
        self.resubscriber.remember(topic, options);

        if options.rh != RH_NEVER && self.version().is_legacy() {
            self.simulate_retained(topic).await;
        }
        Ok(granted)
    }

    pub async fn unsubscribe(&self, topic: &str) -> SyncResult<()> {
        self.ensure_connected("unsubscribe")?;
        self.transport.unsubscribe(topic).await?;
        self.resubscriber.forget(topic);
        debug!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Topics that are issued again after a reconnect, sorted.
    pub fn granted_topics(&self) -> Vec<String> {
        self.resubscriber.topics()
    }

    /// Closes the connection for every user of this connector.
    pub async fn end(&self, force: bool) -> SyncResult<()> {
        self.ensure_connected("end")?;
        self.transport.end(force).await?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.connected = false;
        state.ended = true;
        info!("Connection to {} ended", self.params.broker_url());
        Ok(())
    }

    async fn simulate_retained(&self, topic: &str) {
        let url = retained_url(&self.params.rh_path, topic);
        debug!("Simulating retained message for {} from {}", topic, url);

        match self.http.get_json(&url).await {
            Ok(body) => match retained_payload(body) {
                Some(payload) => {
                    let message = MqttMessage {
                        topic: topic.to_string(),
                        payload,
                        packet: json!({
                            "cmd": "publish",
                            "retain": true,
                            "qos": 0,
                            "dup": false,
                            "topic": topic,
                        }),
                    };
                    self.dispatch(&MqttEvent::Message(message));
                }
                None => debug!("No retained state for {}", topic),
            },
            Err(e) => {
                warn!("Retained message lookup for {} failed: {}", topic, e);
                self.dispatch(&MqttEvent::Error(e));
            }
        }
    }

    fn dispatch(&self, event: &MqttEvent) {
        let handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner).snapshot(event.kind());
        for handler in handlers {
            handler(event);
        }
    }
}

/// Injects the legacy handshake fields for MQTT 3.1 and clears them
/// otherwise.
pub fn adapt_connect_options(mut options: ConnectOptions, version: MqttVersion) -> ConnectOptions {
    if version == MqttVersion::V3_1 {
        options.protocol_id = Some(LEGACY_PROTOCOL_ID.to_string());
        options.protocol_version = Some(LEGACY_PROTOCOL_LEVEL);
    } else {
        options.protocol_id = None;
        options.protocol_version = None;
    }
    options
}

/// `<rh_path>/<topic>`, ordered newest first and limited to one entry when
/// the topic addresses an Observations collection.
pub fn retained_url(rh_path: &str, topic: &str) -> String {
    let mut url = format!("{}/{}", rh_path.trim_end_matches('/'), topic.trim_start_matches('/'));
    if topic.ends_with("Observations") {
        url.push_str(LATEST_OBSERVATION_QUERY);
    }
    url
}

/// The entity a retained lookup returned: the first element of a `value`
/// collection, or the body itself. Empty responses yield `None`.
pub fn retained_payload(body: Value) -> Option<Value> {
    match body {
        Value::Null => None,
        Value::Object(mut map) => match map.remove("value") {
            Some(Value::Array(list)) => list.into_iter().next(),
            Some(other) => {
                map.insert("value".to_string(), other);
                Some(Value::Object(map))
            }
            None if map.is_empty() => None,
            None => Some(Value::Object(map)),
        },
        other => Some(other),
    }
}

/// JSON if it parses, otherwise the text as a JSON string.
pub fn decode_lenient(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

fn decode(event: RawEvent) -> MqttEvent {
    match event {
        RawEvent::Connect => MqttEvent::Connect,
        RawEvent::Reconnect => MqttEvent::Reconnect,
        RawEvent::Close => MqttEvent::Close,
        RawEvent::Disconnect => MqttEvent::Disconnect,
        RawEvent::Offline => MqttEvent::Offline,
        RawEvent::End => MqttEvent::End,
        RawEvent::Error(e) => MqttEvent::Error(e),
        RawEvent::Message { topic, payload, packet } => MqttEvent::Message(MqttMessage {
            topic,
            payload: decode_lenient(&payload),
            packet: decode_lenient(&packet),
        }),
    }
}

fn fan_out(handlers: Arc<Mutex<HandlerTable>>, resubscriber: Resubscriber) -> RawListener {
    Arc::new(move |raw: RawEvent| {
        if matches!(raw, RawEvent::Reconnect) {
            resubscriber.replay(handlers.clone());
        }
        let event = decode(raw);
        let snapshot = handlers.lock().unwrap_or_else(PoisonError::into_inner).snapshot(event.kind());
        for handler in snapshot {
            handler(&event);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_handshake_only_for_3_1() {
        let opts = adapt_connect_options(ConnectOptions::default(), MqttVersion::V3_1);
        assert_eq!(opts.protocol_id.as_deref(), Some("MQIsdp"));
        assert_eq!(opts.protocol_version, Some(3));

        for version in [MqttVersion::V3_1_1, MqttVersion::V5] {
            let opts = adapt_connect_options(ConnectOptions::default(), version);
            assert_eq!(opts.protocol_id, None);
            assert_eq!(opts.protocol_version, None);
        }
    }

    #[test]
    fn retained_url_orders_observations() {
        assert_eq!(
            retained_url("https://sta/v1.1/", "v1.1/Datastreams(7)/Observations"),
            "https://sta/v1.1/v1.1/Datastreams(7)/Observations?$orderby=phenomenonTime%20desc&$top=1"
        );
        assert_eq!(retained_url("https://sta", "v1.1/Things(3)"), "https://sta/v1.1/Things(3)");
    }

    #[test]
    fn retained_payload_unwraps_collections() {
        assert_eq!(
            retained_payload(json!({"value": [{"result": 1}, {"result": 2}]})),
            Some(json!({"result": 1}))
        );
        assert_eq!(retained_payload(json!({"value": []})), None);
        assert_eq!(retained_payload(json!({"result": 3})), Some(json!({"result": 3})));
        assert_eq!(retained_payload(json!({})), None);
    }

    #[test]
    fn lenient_decoding_passes_text_through() {
        assert_eq!(decode_lenient(br#"{"result": 5}"#), json!({"result": 5}));
        assert_eq!(decode_lenient(b"not json"), json!("not json"));
    }
}
