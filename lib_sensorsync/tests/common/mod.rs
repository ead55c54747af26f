//! In-memory fakes of the HTTP and MQTT seams.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use lib_sensorsync::mqtt::{
    ConnectOptions, ConnectionParams, EventKind, Granted, MqttTransport, RawEvent, RawListener, SubscribeOptions,
    TransportFactory,
};
use lib_sensorsync::retrieve::HttpGet;
use lib_sensorsync::{SyncError, SyncResult};

/// Serves canned JSON per URL and records every request.
#[derive(Default)]
pub struct MockHttp {
    routes: Mutex<HashMap<String, SyncResult<Value>>>,
    requests: Mutex<Vec<String>>,
}

impl MockHttp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, url: &str, body: Value) {
        self.routes.lock().unwrap().insert(url.to_string(), Ok(body));
    }

    pub fn fail(&self, url: &str, error: SyncError) {
        self.routes.lock().unwrap().insert(url.to_string(), Err(error));
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpGet for MockHttp {
    async fn get_json(&self, url: &str) -> SyncResult<Value> {
        self.requests.lock().unwrap().push(url.to_string());
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(SyncError::Transport(format!("no route for {}", url))))
    }
}

/// Records every call and lets tests inject raw events.
#[derive(Default)]
pub struct MockTransport {
    pub connects: Mutex<Vec<ConnectOptions>>,
    pub binds: Mutex<Vec<EventKind>>,
    pub subscribes: Mutex<Vec<(String, SubscribeOptions)>>,
    pub unsubscribes: Mutex<Vec<String>>,
    pub ends: Mutex<Vec<bool>>,
    /// When set, every unsubscribe is recorded and then rejected.
    pub fail_unsubscribes: AtomicBool,
    listeners: Mutex<HashMap<EventKind, Vec<RawListener>>>,
}

impl MockTransport {
    /// Fires `event` at every listener bound for its kind.
    pub fn emit(&self, event: RawEvent) {
        let listeners = self.listeners.lock().unwrap().get(&event.kind()).cloned().unwrap_or_default();
        for listener in listeners {
            listener(event.clone());
        }
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.subscribes.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn unsubscribed_topics(&self) -> Vec<String> {
        self.unsubscribes.lock().unwrap().clone()
    }

    pub fn bind_count(&self, kind: EventKind) -> usize {
        self.binds.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

#[async_trait]
impl MqttTransport for MockTransport {
    async fn connect(&self, options: &ConnectOptions) -> SyncResult<()> {
        self.connects.lock().unwrap().push(options.clone());
        Ok(())
    }

    fn bind(&self, kind: EventKind, listener: RawListener) {
        self.binds.lock().unwrap().push(kind);
        self.listeners.lock().unwrap().entry(kind).or_default().push(listener);
    }

    async fn subscribe(&self, topic: &str, options: &SubscribeOptions) -> SyncResult<Granted> {
        self.subscribes.lock().unwrap().push((topic.to_string(), *options));
        Ok(Granted { topic: topic.to_string(), qos: options.qos })
    }

    async fn unsubscribe(&self, topic: &str) -> SyncResult<()> {
        self.unsubscribes.lock().unwrap().push(topic.to_string());
        if self.fail_unsubscribes.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!("unsubscribe {} rejected", topic)));
        }
        Ok(())
    }

    async fn end(&self, force: bool) -> SyncResult<()> {
        self.ends.lock().unwrap().push(force);
        Ok(())
    }
}

/// Hands out [`MockTransport`]s and keeps them for inspection.
#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn last(&self) -> Arc<MockTransport> {
        self.created.lock().unwrap().last().cloned().expect("no transport created")
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, _params: &ConnectionParams) -> SyncResult<Arc<dyn MqttTransport>> {
        let transport = Arc::new(MockTransport::default());
        self.created.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

pub fn params(version: lib_sensorsync::mqtt::MqttVersion) -> ConnectionParams {
    ConnectionParams {
        host: "broker.example".to_string(),
        port: Some(443),
        path: "/mqtt".to_string(),
        protocol: "wss".to_string(),
        mqtt_version: version,
        rh_path: "https://sta.example".to_string(),
    }
}
