//! `rumqttc`-backed [`MqttTransport`].
//!
//! MQTT 3.1 and 3.1.1 use the v4 client, 5.0 the v5 client. `rumqttc` only
//! speaks the 3.1.1 framing, so 3.1 brokers are reached with a 3.1.1
//! handshake. Each transport runs its event loop on one spawned task, and
//! SUBACK / UNSUBACK packets resolve the pending requests in FIFO order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::transport::{MqttTransport, RawListener, TransportFactory};
use super::types::{ConnectOptions, ConnectionParams, EventKind, Granted, MqttVersion, RawEvent, SubscribeOptions};
use crate::errors::{SyncError, SyncResult};

const CHANNEL_CAPACITY: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const GRACEFUL_END_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates [`RumqttTransport`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttFactory;

impl TransportFactory for RumqttFactory {
    fn create(&self, params: &ConnectionParams) -> SyncResult<Arc<dyn MqttTransport>> {
        Ok(Arc::new(RumqttTransport::new(params.clone())))
    }
}

enum Client {
    V4(rumqttc::AsyncClient),
    V5(rumqttc::v5::AsyncClient),
}

type SubAckSender = oneshot::Sender<SyncResult<u8>>;

#[derive(Default)]
struct Shared {
    listeners: Mutex<HashMap<EventKind, Vec<RawListener>>>,
    pending_subscribes: Mutex<VecDeque<SubAckSender>>,
    pending_unsubscribes: Mutex<VecDeque<oneshot::Sender<()>>>,
    ended: AtomicBool,
}

impl Shared {
    fn emit(&self, event: RawEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();
        for listener in listeners {
            listener(event.clone());
        }
    }

    fn fail_pending(&self, reason: &str) {
        for tx in self.pending_subscribes.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            let _ = tx.send(Err(SyncError::Transport(reason.to_string())));
        }
        self.pending_unsubscribes.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

/// Library-neutral view of the incoming packets the transport cares about.
enum Incoming {
    ConnAck,
    Publish { topic: String, payload: Vec<u8>, qos: u8, retain: bool, dup: bool },
    SubAck(SyncResult<u8>),
    UnsubAck,
    Disconnect,
    Other,
}

pub struct RumqttTransport {
    params: ConnectionParams,
    shared: Arc<Shared>,
    client: tokio::sync::Mutex<Option<Client>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RumqttTransport {
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            shared: Arc::new(Shared::default()),
            client: tokio::sync::Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Host argument for `MqttOptions`: websockets expect the full URL.
    fn broker_host(&self) -> String {
        if self.params.is_websocket() {
            let port = self.params.port.unwrap_or_else(|| self.params.default_port());
            format!("{}://{}:{}{}", self.params.protocol, self.params.host, port, self.params.path)
        } else {
            self.params.host.clone()
        }
    }

    fn transport(&self) -> rumqttc::Transport {
        match (self.params.is_websocket(), self.params.is_secure()) {
            (true, true) => rumqttc::Transport::wss_with_default_config(),
            (true, false) => rumqttc::Transport::Ws,
            (false, true) => rumqttc::Transport::tls_with_default_config(),
            (false, false) => rumqttc::Transport::Tcp,
        }
    }

    fn build_v4(&self, options: &ConnectOptions) -> (rumqttc::AsyncClient, rumqttc::EventLoop) {
        if options.protocol_id.is_some() {
            warn!("MQTT 3.1 handshake is not supported by rumqttc, connecting with 3.1.1 framing");
        }
        let port = self.params.port.unwrap_or_else(|| self.params.default_port());
        let mut mqtt_options = rumqttc::MqttOptions::new(&options.client_id, self.broker_host(), port);
        mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive_secs));
        mqtt_options.set_clean_session(options.clean);
        if let (Some(user), Some(pass)) = (&options.username, &options.password) {
            mqtt_options.set_credentials(user, pass);
        }
        mqtt_options.set_transport(self.transport());
        rumqttc::AsyncClient::new(mqtt_options, CHANNEL_CAPACITY)
    }

    fn build_v5(&self, options: &ConnectOptions) -> (rumqttc::v5::AsyncClient, rumqttc::v5::EventLoop) {
        let port = self.params.port.unwrap_or_else(|| self.params.default_port());
        let mut mqtt_options = rumqttc::v5::MqttOptions::new(&options.client_id, self.broker_host(), port);
        mqtt_options.set_keep_alive(Duration::from_secs(options.keep_alive_secs));
        mqtt_options.set_clean_start(options.clean);
        if let (Some(user), Some(pass)) = (&options.username, &options.password) {
            mqtt_options.set_credentials(user, pass);
        }
        mqtt_options.set_transport(self.transport());
        rumqttc::v5::AsyncClient::new(mqtt_options, CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl MqttTransport for RumqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> SyncResult<()> {
        let mut client = self.client.lock().await;
        if client.is_some() {
            return Ok(());
        }

        let (connack_tx, connack_rx) = oneshot::channel();
        let shared = self.shared.clone();
        let (new_client, task) = match self.params.mqtt_version {
            MqttVersion::V3_1 | MqttVersion::V3_1_1 => {
                let (c, eventloop) = self.build_v4(options);
                (Client::V4(c), tokio::spawn(run_v4(eventloop, shared, connack_tx)))
            }
            MqttVersion::V5 => {
                let (c, eventloop) = self.build_v5(options);
                (Client::V5(c), tokio::spawn(run_v5(eventloop, shared, connack_tx)))
            }
        };
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);

        match connack_rx.await {
            Ok(Ok(())) => {
                *client = Some(new_client);
                info!("Connected to {}", self.params.broker_url());
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SyncError::Transport("event loop stopped before CONNACK".to_string())),
        }
    }

    fn bind(&self, kind: EventKind, listener: RawListener) {
        self.shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(listener);
    }

    async fn subscribe(&self, topic: &str, options: &SubscribeOptions) -> SyncResult<Granted> {
        let (tx, rx) = oneshot::channel();
        {
            let client = self.client.lock().await;
            let client = client
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("subscribe before connect".to_string()))?;
            self.shared.pending_subscribes.lock().unwrap_or_else(PoisonError::into_inner).push_back(tx);

            let sent = match client {
                Client::V4(c) => c.subscribe(topic, qos_v4(options.qos)).await.map_err(|e| e.to_string()),
                Client::V5(c) => {
                    let mut filter = rumqttc::v5::mqttbytes::v5::Filter::new(topic, qos_v5(options.qos));
                    filter.retain_forward_rule = retain_rule(options.rh);
                    c.subscribe_many(vec![filter]).await.map_err(|e| e.to_string())
                }
            };
            if let Err(e) = sent {
                self.shared.pending_subscribes.lock().unwrap_or_else(PoisonError::into_inner).pop_back();
                return Err(SyncError::Transport(format!("subscribe {}: {}", topic, e)));
            }
        }

        let qos = rx
            .await
            .map_err(|_| SyncError::Transport(format!("connection closed before SUBACK for {}", topic)))??;
        Ok(Granted { topic: topic.to_string(), qos })
    }

    async fn unsubscribe(&self, topic: &str) -> SyncResult<()> {
        let (tx, rx) = oneshot::channel();
        {
            let client = self.client.lock().await;
            let client = client
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("unsubscribe before connect".to_string()))?;
            self.shared.pending_unsubscribes.lock().unwrap_or_else(PoisonError::into_inner).push_back(tx);

            let sent = match client {
                Client::V4(c) => c.unsubscribe(topic).await.map_err(|e| e.to_string()),
                Client::V5(c) => c.unsubscribe(topic).await.map_err(|e| e.to_string()),
            };
            if let Err(e) = sent {
                self.shared.pending_unsubscribes.lock().unwrap_or_else(PoisonError::into_inner).pop_back();
                return Err(SyncError::Transport(format!("unsubscribe {}: {}", topic, e)));
            }
        }
        rx.await
            .map_err(|_| SyncError::Transport(format!("connection closed before UNSUBACK for {}", topic)))
    }

    async fn end(&self, force: bool) -> SyncResult<()> {
        let client = self.client.lock().await.take();
        self.shared.ended.store(true, Ordering::SeqCst);
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();

        if !force {
            let sent = match &client {
                Some(Client::V4(c)) => c.disconnect().await.map_err(|e| e.to_string()),
                Some(Client::V5(c)) => c.disconnect().await.map_err(|e| e.to_string()),
                None => Ok(()),
            };
            if let Err(e) = sent {
                warn!("Graceful disconnect failed: {}", e);
            }
        }

        if let Some(task) = task {
            if force {
                task.abort();
            } else if tokio::time::timeout(GRACEFUL_END_TIMEOUT, task).await.is_err() {
                warn!("Event loop did not stop within {:?}", GRACEFUL_END_TIMEOUT);
            }
        }

        self.shared.fail_pending("connection ended");
        self.shared.emit(RawEvent::End);
        Ok(())
    }
}

async fn run_v4(mut eventloop: rumqttc::EventLoop, shared: Arc<Shared>, connack: oneshot::Sender<SyncResult<()>>) {
    let mut connack = Some(connack);
    let mut online = false;
    loop {
        let polled = eventloop.poll().await.map_err(|e| e.to_string()).map(|event| match event {
            rumqttc::Event::Incoming(packet) => incoming_v4(packet),
            rumqttc::Event::Outgoing(_) => Incoming::Other,
        });
        if !handle(polled, &shared, &mut connack, &mut online).await {
            break;
        }
    }
}

async fn run_v5(mut eventloop: rumqttc::v5::EventLoop, shared: Arc<Shared>, connack: oneshot::Sender<SyncResult<()>>) {
    let mut connack = Some(connack);
    let mut online = false;
    loop {
        let polled = eventloop.poll().await.map_err(|e| e.to_string()).map(|event| match event {
            rumqttc::v5::Event::Incoming(packet) => incoming_v5(packet),
            rumqttc::v5::Event::Outgoing(_) => Incoming::Other,
        });
        if !handle(polled, &shared, &mut connack, &mut online).await {
            break;
        }
    }
}

/// Processes one poll result. Returns `false` when the loop should stop.
async fn handle(
    polled: Result<Incoming, String>,
    shared: &Shared,
    connack: &mut Option<oneshot::Sender<SyncResult<()>>>,
    online: &mut bool,
) -> bool {
    if shared.ended.load(Ordering::SeqCst) {
        shared.emit(RawEvent::Close);
        return false;
    }

    let incoming = match polled {
        Ok(incoming) => incoming,
        Err(e) => {
            let error = SyncError::Transport(format!("MQTT connection: {}", e));
            if let Some(tx) = connack.take() {
                let _ = tx.send(Err(error));
                return false;
            }
            error!("{}", error);
            shared.fail_pending("connection lost");
            if *online {
                *online = false;
                shared.emit(RawEvent::Offline);
            }
            shared.emit(RawEvent::Error(error));
            tokio::time::sleep(RECONNECT_DELAY).await;
            return true;
        }
    };

    match incoming {
        Incoming::ConnAck => {
            if let Some(tx) = connack.take() {
                let _ = tx.send(Ok(()));
            } else {
                shared.emit(RawEvent::Reconnect);
            }
            *online = true;
            shared.emit(RawEvent::Connect);
        }
        Incoming::Publish { topic, payload, qos, retain, dup } => {
            let packet = json!({
                "cmd": "publish",
                "topic": topic,
                "qos": qos,
                "retain": retain,
                "dup": dup,
            });
            shared.emit(RawEvent::Message { topic, payload, packet: packet.to_string().into_bytes() });
        }
        Incoming::SubAck(granted) => {
            match shared.pending_subscribes.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
                Some(tx) => {
                    let _ = tx.send(granted);
                }
                None => debug!("SUBACK without pending subscribe"),
            }
        }
        Incoming::UnsubAck => {
            if let Some(tx) = shared.pending_unsubscribes.lock().unwrap_or_else(PoisonError::into_inner).pop_front() {
                let _ = tx.send(());
            }
        }
        Incoming::Disconnect => {
            *online = false;
            shared.emit(RawEvent::Disconnect);
        }
        Incoming::Other => {}
    }
    true
}

fn incoming_v4(packet: rumqttc::Packet) -> Incoming {
    use rumqttc::{Packet, SubscribeReasonCode};
    match packet {
        Packet::ConnAck(_) => Incoming::ConnAck,
        Packet::Publish(p) => Incoming::Publish {
            topic: p.topic,
            payload: p.payload.to_vec(),
            qos: p.qos as u8,
            retain: p.retain,
            dup: p.dup,
        },
        Packet::SubAck(ack) => Incoming::SubAck(match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => Ok(*qos as u8),
            Some(code) => Err(SyncError::Transport(format!("subscription refused: {:?}", code))),
            None => Err(SyncError::Transport("empty SUBACK".to_string())),
        }),
        Packet::UnsubAck(_) => Incoming::UnsubAck,
        Packet::Disconnect => Incoming::Disconnect,
        _ => Incoming::Other,
    }
}

fn incoming_v5(packet: rumqttc::v5::mqttbytes::v5::Packet) -> Incoming {
    use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
    match packet {
        Packet::ConnAck(_) => Incoming::ConnAck,
        Packet::Publish(p) => Incoming::Publish {
            topic: String::from_utf8_lossy(&p.topic).into_owned(),
            payload: p.payload.to_vec(),
            qos: p.qos as u8,
            retain: p.retain,
            dup: p.dup,
        },
        Packet::SubAck(ack) => Incoming::SubAck(match ack.return_codes.first() {
            Some(SubscribeReasonCode::Success(qos)) => Ok(*qos as u8),
            Some(code) => Err(SyncError::Transport(format!("subscription refused: {:?}", code))),
            None => Err(SyncError::Transport("empty SUBACK".to_string())),
        }),
        Packet::UnsubAck(_) => Incoming::UnsubAck,
        Packet::Disconnect(_) => Incoming::Disconnect,
        _ => Incoming::Other,
    }
}

fn qos_v4(level: u8) -> rumqttc::QoS {
    match level {
        0 => rumqttc::QoS::AtMostOnce,
        1 => rumqttc::QoS::AtLeastOnce,
        _ => rumqttc::QoS::ExactlyOnce,
    }
}

fn qos_v5(level: u8) -> rumqttc::v5::mqttbytes::QoS {
    use rumqttc::v5::mqttbytes::QoS;
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn retain_rule(rh: u8) -> rumqttc::v5::mqttbytes::v5::RetainForwardRule {
    use rumqttc::v5::mqttbytes::v5::RetainForwardRule;
    match rh {
        0 => RetainForwardRule::OnEverySubscribe,
        1 => RetainForwardRule::OnNewSubscribe,
        _ => RetainForwardRule::Never,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(protocol: &str, port: Option<u16>) -> ConnectionParams {
        ConnectionParams {
            host: "broker.example".to_string(),
            port,
            path: "/mqtt".to_string(),
            protocol: protocol.to_string(),
            mqtt_version: MqttVersion::V3_1_1,
            rh_path: String::new(),
        }
    }

    #[test]
    fn websocket_host_is_a_url() {
        let t = RumqttTransport::new(params("wss", None));
        assert_eq!(t.broker_host(), "wss://broker.example:443/mqtt");
        let t = RumqttTransport::new(params("mqtt", Some(1884)));
        assert_eq!(t.broker_host(), "broker.example");
    }

    #[test]
    fn retain_handling_maps_to_forward_rule() {
        use rumqttc::v5::mqttbytes::v5::RetainForwardRule;
        assert!(matches!(retain_rule(0), RetainForwardRule::OnEverySubscribe));
        assert!(matches!(retain_rule(1), RetainForwardRule::OnNewSubscribe));
        assert!(matches!(retain_rule(2), RetainForwardRule::Never));
    }
}
