mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{params, MockFactory, MockHttp};
use lib_sensorsync::mqtt::{
    ConnectOptions, ConnectorRegistry, EventKind, MqttEvent, MqttMessage, MqttVersion, RawEvent, SubscribeOverrides,
};
use lib_sensorsync::SyncError;

fn collect(messages: &Arc<Mutex<Vec<MqttMessage>>>) -> impl Fn(&MqttEvent) + Send + Sync + 'static {
    let messages = messages.clone();
    move |event| {
        if let MqttEvent::Message(m) = event {
            messages.lock().unwrap().push(m.clone());
        }
    }
}

#[test]
fn identical_parameters_share_one_connector() {
    let registry = ConnectorRegistry::new();
    let factory = MockFactory::default();
    let http = MockHttp::new();

    let a = registry.get_or_create(params(MqttVersion::V3_1_1), &factory, http.clone()).unwrap();
    let b = registry.get_or_create(params(MqttVersion::V3_1_1), &factory, http.clone()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(factory.count(), 1);

    let c = registry.get_or_create(params(MqttVersion::V5), &factory, http).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(factory.count(), 2);
    assert_eq!(registry.live_count(), 2);
}

#[tokio::test]
async fn ended_connectors_are_replaced() {
    let registry = ConnectorRegistry::new();
    let factory = MockFactory::default();
    let http = MockHttp::new();

    let first = registry.get_or_create(params(MqttVersion::V3_1_1), &factory, http.clone()).unwrap();
    first.connect(ConnectOptions::default()).await.unwrap();
    first.end(false).await.unwrap();
    assert!(!first.is_live());

    let second = registry.get_or_create(params(MqttVersion::V3_1_1), &factory, http).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(factory.count(), 2);
}

#[tokio::test]
async fn legacy_handshake_is_injected_for_3_1_only() {
    let factory = MockFactory::default();
    let http = MockHttp::new();

    let registry = ConnectorRegistry::new();
    let legacy = registry.get_or_create(params(MqttVersion::V3_1), &factory, http.clone()).unwrap();
    legacy.connect(ConnectOptions::default()).await.unwrap();
    let sent = factory.last().connects.lock().unwrap()[0].clone();
    assert_eq!(sent.protocol_id.as_deref(), Some("MQIsdp"));
    assert_eq!(sent.protocol_version, Some(3));

    let modern = registry.get_or_create(params(MqttVersion::V3_1_1), &factory, http).unwrap();
    modern.connect(ConnectOptions::default()).await.unwrap();
    let sent = factory.last().connects.lock().unwrap()[0].clone();
    assert_eq!(sent.protocol_id, None);
    assert_eq!(sent.protocol_version, None);
}

#[test]
fn handlers_share_a_single_transport_binding() {
    let factory = MockFactory::default();
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V3_1_1), &factory, MockHttp::new())
        .unwrap();
    let transport = factory.last();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    connector.on(EventKind::Message, collect(&first)).unwrap();
    let second_id = connector.on(EventKind::Message, collect(&second)).unwrap();
    assert_eq!(transport.bind_count(EventKind::Message), 1);

    transport.emit(RawEvent::Message {
        topic: "v1.1/Datastreams(1)/Observations".to_string(),
        payload: br#"{"result": 21.5}"#.to_vec(),
        packet: br#"{"retain": false}"#.to_vec(),
    });
    assert_eq!(first.lock().unwrap().len(), 1);
    assert_eq!(second.lock().unwrap().len(), 1);
    assert_eq!(first.lock().unwrap()[0].payload, json!({"result": 21.5}));

    assert!(connector.off(second_id));
    transport.emit(RawEvent::Message {
        topic: "v1.1/Datastreams(1)/Observations".to_string(),
        payload: b"{}".to_vec(),
        packet: b"{}".to_vec(),
    });
    assert_eq!(first.lock().unwrap().len(), 2);
    assert_eq!(second.lock().unwrap().len(), 1);
    assert_eq!(transport.bind_count(EventKind::Message), 1);
}

#[test]
fn malformed_payloads_pass_through_as_text() {
    let factory = MockFactory::default();
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V3_1_1), &factory, MockHttp::new())
        .unwrap();
    let messages = Arc::new(Mutex::new(Vec::new()));
    connector.on(EventKind::Message, collect(&messages)).unwrap();

    factory.last().emit(RawEvent::Message {
        topic: "t".to_string(),
        payload: b"22,5 degrees".to_vec(),
        packet: b"\x00not json".to_vec(),
    });

    let messages = messages.lock().unwrap();
    assert_eq!(messages[0].payload, json!("22,5 degrees"));
    assert!(messages[0].packet.is_string());
}

#[test]
fn disconnect_handlers_need_mqtt_5() {
    let factory = MockFactory::default();
    let registry = ConnectorRegistry::new();
    let http = MockHttp::new();

    let legacy = registry.get_or_create(params(MqttVersion::V3_1_1), &factory, http.clone()).unwrap();
    let result = legacy.on(EventKind::Disconnect, |_| {});
    assert!(matches!(result, Err(SyncError::Configuration(_))));
    assert_eq!(factory.last().bind_count(EventKind::Disconnect), 0);

    let modern = registry.get_or_create(params(MqttVersion::V5), &factory, http).unwrap();
    assert!(modern.on(EventKind::Disconnect, |_| {}).is_ok());
}

#[tokio::test]
async fn operations_before_connect_fail() {
    let factory = MockFactory::default();
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V3_1_1), &factory, MockHttp::new())
        .unwrap();

    let subscribed = connector.subscribe("v1.1/Datastreams(1)/Observations", SubscribeOverrides::default()).await;
    assert!(matches!(subscribed, Err(SyncError::Configuration(_))));
    assert!(matches!(connector.unsubscribe("x").await, Err(SyncError::Configuration(_))));
    assert!(matches!(connector.end(true).await, Err(SyncError::Configuration(_))));
    assert!(factory.last().subscribes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn subscribe_merges_overrides_over_defaults() {
    let factory = MockFactory::default();
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V5), &factory, MockHttp::new())
        .unwrap();
    connector.connect(ConnectOptions::default()).await.unwrap();

    let granted = connector.subscribe("a", SubscribeOverrides::default()).await.unwrap();
    assert_eq!(granted.topic, "a");
    assert_eq!(granted.qos, 0);
    connector.subscribe("b", SubscribeOverrides { qos: Some(1), rh: None }).await.unwrap();

    let calls = factory.last().subscribes.lock().unwrap().clone();
    assert_eq!((calls[0].1.qos, calls[0].1.rh), (0, 2));
    assert_eq!((calls[1].1.qos, calls[1].1.rh), (1, 2));
}

const TOPIC: &str = "v1.1/Datastreams(7)/Observations";
const RETAINED_URL: &str =
    "https://sta.example/v1.1/Datastreams(7)/Observations?$orderby=phenomenonTime%20desc&$top=1";

#[tokio::test]
async fn legacy_subscribe_simulates_the_retained_message() {
    let factory = MockFactory::default();
    let http = MockHttp::new();
    http.route(
        RETAINED_URL,
        json!({"value": [{"@iot.id": 99, "result": 4.2, "phenomenonTime": "2024-03-05T08:00:00Z"}]}),
    );
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V3_1_1), &factory, http.clone())
        .unwrap();
    connector.connect(ConnectOptions::default()).await.unwrap();

    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    connector.on(EventKind::Message, collect(&first)).unwrap();
    connector.on(EventKind::Message, collect(&second)).unwrap();

    connector.subscribe(TOPIC, SubscribeOverrides { qos: None, rh: Some(0) }).await.unwrap();

    assert_eq!(http.requests(), vec![RETAINED_URL.to_string()]);
    for received in [&first, &second] {
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(received[0].is_retained());
        assert_eq!(received[0].topic, TOPIC);
        assert_eq!(received[0].payload["result"], json!(4.2));
    }
}

#[tokio::test]
async fn no_simulation_for_mqtt_5_or_rh_2() {
    let factory = MockFactory::default();
    let http = MockHttp::new();
    let registry = ConnectorRegistry::new();

    let modern = registry.get_or_create(params(MqttVersion::V5), &factory, http.clone()).unwrap();
    modern.connect(ConnectOptions::default()).await.unwrap();
    modern.subscribe(TOPIC, SubscribeOverrides { qos: None, rh: Some(0) }).await.unwrap();

    let legacy = registry.get_or_create(params(MqttVersion::V3_1), &factory, http.clone()).unwrap();
    legacy.connect(ConnectOptions::default()).await.unwrap();
    legacy.subscribe(TOPIC, SubscribeOverrides::default()).await.unwrap();

    assert!(http.requests().is_empty());
}

#[tokio::test]
async fn failed_simulation_reports_an_error_but_keeps_the_subscription() {
    let factory = MockFactory::default();
    let http = MockHttp::new();
    http.fail(RETAINED_URL, SyncError::Transport("503".to_string()));
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V3_1_1), &factory, http)
        .unwrap();
    connector.connect(ConnectOptions::default()).await.unwrap();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connector
        .on(EventKind::Error, move |event| {
            if let MqttEvent::Error(e) = event {
                sink.lock().unwrap().push(e.clone());
            }
        })
        .unwrap();

    let granted = connector.subscribe(TOPIC, SubscribeOverrides { qos: None, rh: Some(1) }).await;
    assert!(granted.is_ok());
    assert_eq!(*errors.lock().unwrap(), vec![SyncError::Transport("503".to_string())]);
}

#[tokio::test]
async fn reconnect_restores_granted_subscriptions() {
    let factory = MockFactory::default();
    let connector = ConnectorRegistry::new()
        .get_or_create(params(MqttVersion::V5), &factory, MockHttp::new())
        .unwrap();
    connector.connect(ConnectOptions::default()).await.unwrap();
    let transport = factory.last();
    assert_eq!(transport.bind_count(EventKind::Reconnect), 1);

    let reconnects = Arc::new(Mutex::new(0));
    let counter = reconnects.clone();
    connector.on(EventKind::Reconnect, move |_| *counter.lock().unwrap() += 1).unwrap();
    assert_eq!(transport.bind_count(EventKind::Reconnect), 1);

    connector.subscribe("a", SubscribeOverrides { qos: Some(1), rh: None }).await.unwrap();
    connector.subscribe("b", SubscribeOverrides::default()).await.unwrap();
    connector.unsubscribe("b").await.unwrap();
    assert_eq!(connector.granted_topics(), vec!["a"]);

    transport.emit(RawEvent::Reconnect);
    for _ in 0..50 {
        if transport.subscribes.lock().unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let calls = transport.subscribes.lock().unwrap().clone();
    assert_eq!(calls.len(), 3);
    assert_eq!(calls[2].0, "a");
    assert_eq!(calls[2].1.qos, 1);
    assert_eq!(*reconnects.lock().unwrap(), 1);
}
