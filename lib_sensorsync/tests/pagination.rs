mod common;

use serde_json::json;

use common::MockHttp;
use lib_sensorsync::retrieve::{FetchHooks, PaginationWalker};
use lib_sensorsync::SyncError;

const BASE: &str = "https://sta.example/v1.1/Things";

#[tokio::test]
async fn chained_pages_concatenate_in_order() {
    let http = MockHttp::new();
    http.route(
        BASE,
        json!({"value": [{"@iot.id": 1}, {"@iot.id": 2}], "@iot.nextLink": format!("{}?$skip=2", BASE)}),
    );
    http.route(
        &format!("{}?$skip=2", BASE),
        json!({"value": [{"@iot.id": 3}], "@iot.nextLink": format!("{}?$skip=3", BASE)}),
    );
    http.route(&format!("{}?$skip=3", BASE), json!({"value": [{"@iot.id": 4}, {"@iot.id": 5}]}));

    let walker = PaginationWalker::new(http.clone());
    let entities = walker.fetch_all(BASE).await.unwrap();

    let ids: Vec<i64> = entities.iter().map(|e| e["@iot.id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    assert_eq!(http.requests().len(), 3);
}

#[tokio::test]
async fn exhausted_links_are_never_fetched() {
    let http = MockHttp::new();
    let stale_a = "https://sta.example/v1.1/Datastreams(1)/Observations?$top=1&$skip=1";
    let stale_b = "https://sta.example/v1.1/Datastreams(2)/Observations?$top=1&$skip=2";
    let live = "https://sta.example/v1.1/Datastreams(3)/Observations?$top=2&$skip=1";
    http.route(
        BASE,
        json!({"value": [
            {"@iot.id": 1, "Observations": [], "Observations@iot.nextLink": stale_a},
            {"@iot.id": 2, "Observations": [], "Observations@iot.nextLink": stale_b},
            {"@iot.id": 3, "Observations": [], "Observations@iot.nextLink": live},
        ]}),
    );
    http.route(live, json!({"value": [{"@iot.id": 30, "result": 7}]}));

    let entities = PaginationWalker::new(http.clone()).fetch_all(BASE).await.unwrap();

    assert_eq!(http.requests(), vec![BASE.to_string(), live.to_string()]);
    assert_eq!(entities[2]["Observations"], json!([{"@iot.id": 30, "result": 7}]));
    assert!(entities[0].get("Observations@iot.nextLink").is_none());
}

#[tokio::test]
async fn nested_continuations_fill_their_own_collection() {
    let http = MockHttp::new();
    let more = "https://sta.example/v1.1/Things(1)/Datastreams?$skip=1";
    http.route(
        BASE,
        json!({"value": [{
            "@iot.id": 1,
            "@iot.selfLink": "https://sta.example/v1.1/Things(1)",
            "Datastreams": [{"@iot.id": 10}],
            "Datastreams@iot.nextLink": more,
        }]}),
    );
    http.route(more, json!({"value": [{"@iot.id": 11}, {"@iot.id": 12}]}));

    let entities = PaginationWalker::new(http.clone()).strip_navigation(true).fetch_all(BASE).await.unwrap();

    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0]["Datastreams"], json!([{"@iot.id": 10}, {"@iot.id": 11}, {"@iot.id": 12}]));
    assert!(entities[0].get("@iot.selfLink").is_none());
}

#[tokio::test]
async fn bare_entity_response_is_appended_whole() {
    let http = MockHttp::new();
    let url = "https://sta.example/v1.1/Things(9)";
    http.route(url, json!({"@iot.id": 9, "name": "gauge"}));

    let entities = PaginationWalker::new(http).fetch_all(url).await.unwrap();
    assert_eq!(entities, vec![json!({"@iot.id": 9, "name": "gauge"})]);
}

#[derive(Default)]
struct Recorder {
    started: Option<String>,
    success: Option<Vec<serde_json::Value>>,
    failure: Option<(SyncError, Vec<serde_json::Value>)>,
    completed: bool,
}

impl FetchHooks for Recorder {
    fn on_start(&mut self, url: &str) {
        self.started = Some(url.to_string());
    }

    fn on_success(&mut self, entities: Vec<serde_json::Value>) {
        self.success = Some(entities);
    }

    fn on_error(&mut self, error: SyncError, partial: Vec<serde_json::Value>) {
        self.failure = Some((error, partial));
    }

    fn on_complete(&mut self) {
        self.completed = true;
    }
}

#[tokio::test]
async fn failure_keeps_partial_results() {
    let http = MockHttp::new();
    let next = format!("{}?$skip=1", BASE);
    http.route(BASE, json!({"value": [{"@iot.id": 1}], "@iot.nextLink": next}));
    http.fail(&next, SyncError::Transport("connection reset".to_string()));

    let mut hooks = Recorder::default();
    PaginationWalker::new(http).fetch_all_with(BASE, &mut hooks).await;

    assert_eq!(hooks.started.as_deref(), Some(BASE));
    assert!(hooks.success.is_none());
    let (error, partial) = hooks.failure.unwrap();
    assert_eq!(error, SyncError::Transport("connection reset".to_string()));
    assert_eq!(partial, vec![json!({"@iot.id": 1})]);
    assert!(hooks.completed);
}

#[tokio::test]
async fn array_response_is_a_protocol_error() {
    let http = MockHttp::new();
    http.route(BASE, json!([{"@iot.id": 1}]));

    let result = PaginationWalker::new(http).fetch_all(BASE).await;
    assert!(matches!(result, Err(SyncError::Protocol(_))));
}
