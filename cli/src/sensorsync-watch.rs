//! Watches one SensorThings layer: loads its entities, subscribes their
//! datastreams over MQTT and logs every pushed observation until Ctrl-C.

mod config;
mod logger;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};

use lib_sensorsync::aggregate::AggregatedRecord;
use lib_sensorsync::configs::load_layer_config;
use lib_sensorsync::core::{LayerObserver, SubscriptionManager, Viewport};
use lib_sensorsync::mqtt::{ConnectOptions, ConnectorRegistry, EventKind, MqttEvent, RumqttFactory};
use lib_sensorsync::retrieve::{ApiClient, HttpGet, HttpOptions};
use lib_sensorsync::spatial::{Extent, Projection};
use lib_sensorsync::SyncError;

struct LogObserver;

impl LayerObserver for LogObserver {
    fn feature_updated(&self, layer_id: &str, record: &AggregatedRecord) {
        info!(
            "[{}] Thing {} | ids: {} | values: {} | times: {}",
            layer_id,
            record.id,
            record.summary.data_stream_id,
            record.summary.data_stream_value,
            record.summary.data_stream_phenomenon_time
        );
    }

    fn features_replaced(&self, layer_id: &str, count: usize) {
        info!("[{}] {} features loaded", layer_id, count);
    }

    fn error(&self, layer_id: &str, error: &SyncError) {
        warn!("[{}] {} error: {}", layer_id, error.kind(), error);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();

    let layer_path = config.layer.clone().context("No layer configuration given")?;
    let layer = load_layer_config(&layer_path)
        .with_context(|| format!("Failed to load layer config {}", layer_path.display()))?;

    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let levels = logger::LogLevels::parse(
        config.log_level.as_deref().unwrap_or("info"),
        config.mqtt_log_level.as_deref(),
        config.layer_log_level.as_deref(),
    )?;
    let log_path = logger::setup_logging(&log_dir, &layer.id, levels).context("Failed to set up logging")?;
    info!("Watching layer '{}' at {}, logging to {}", layer.id, layer.versioned_url(), log_path.display());

    let http: Arc<dyn HttpGet> = Arc::new(ApiClient::new(HttpOptions {
        timeout_secs: config.http_timeout_secs.unwrap_or(30),
        auth_token: config.auth_token.clone(),
        max_retries: config.http_retries.unwrap_or(0),
        ..HttpOptions::default()
    })?);

    let connector = ConnectorRegistry::global().get_or_create(layer.connection_params(), &RumqttFactory, http.clone())?;
    connector.on(EventKind::Offline, |_| warn!("MQTT broker went offline"))?;
    connector.on(EventKind::Reconnect, |_| info!("MQTT broker reconnected"))?;
    connector.on(EventKind::Error, |event| {
        if let MqttEvent::Error(e) = event {
            error!("MQTT: {}", e);
        }
    })?;

    let mut options = ConnectOptions::default();
    if let Some(client_id) = &config.client_id {
        options.client_id = client_id.clone();
    }
    options.username = layer.mqtt.username.clone();
    options.password = layer.mqtt.password.clone();
    connector.connect(options).await?;

    let viewport = match config.extent_values()? {
        Some(values) => {
            let projection: Projection = config
                .extent_projection
                .as_deref()
                .unwrap_or("EPSG:25832")
                .parse()?;
            Some(Viewport { extent: Extent::from_slice(&values)?, projection })
        }
        None => None,
    };

    let mut manager = SubscriptionManager::new(layer.clone(), connector.clone(), http, Arc::new(LogObserver))?;
    match viewport {
        Some(viewport) => manager.set_viewport(viewport),
        None if layer.load_things_only_in_current_extent => {
            warn!("Layer loads only the current extent but no --extent was given");
        }
        None => {
            if let Err(e) = manager.load(None).await {
                warn!("Initial load incomplete: {}", e);
            }
        }
    }

    let (handle, task) = manager.spawn()?;
    handle.set_state(false, true)?;
    if let Some(viewport) = viewport {
        handle.viewport_changed(viewport)?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown()?;
    task.await?;
    connector.end(false).await?;
    Ok(())
}
