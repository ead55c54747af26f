//! Per-layer configuration.
//!
//! One `LayerConfig` describes one SensorThings layer: where its entities
//! come from, how they are filtered, which broker pushes their updates and
//! how values are shown. Files are JSON5 so they can carry comments.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::{AggregateOptions, NoDataPolicy, TimeRendering};
use crate::errors::{SyncError, SyncResult};
use crate::mqtt::{ConnectionParams, MqttVersion, SubscribeOverrides};
use crate::spatial::{Projection, RootKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(String),

    #[error("Invalid config: {0}")]
    Invalid(#[from] SyncError),
}

/// OData query options added to every bulk query of the layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UrlParameter {
    pub filter: Option<String>,
    pub expand: Option<String>,
    pub select: Option<String>,
    pub orderby: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttSettings {
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub protocol: String,
    pub mqtt_version: MqttVersion,
    /// Base URL for retained-message simulation. Defaults to the layer url.
    pub rh_path: Option<String>,
    pub qos: Option<u8>,
    pub rh: Option<u8>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: None,
            path: "/mqtt".to_string(),
            protocol: "wss".to_string(),
            mqtt_version: MqttVersion::V3_1_1,
            rh_path: None,
            qos: None,
            rh: None,
            username: None,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerConfig {
    pub id: String,
    /// Service root without version, e.g. `https://iot.example.org`.
    pub url: String,
    /// API version, rendered as `v<version>` in URLs and topics.
    pub version: String,
    pub root: RootKind,
    pub url_parameter: UrlParameter,
    pub load_things_only_in_current_extent: bool,
    /// `st_intersects` when true, `st_within` otherwise.
    pub intersect: bool,
    pub mqtt: MqttSettings,
    pub show_no_data_value: bool,
    pub no_data_value: String,
    /// Fixed UTC offset for timestamps without one, e.g. `+1` or `+01:00`.
    pub utc: String,
    pub timezone: String,
    pub locale: String,
    pub time_format: String,
    pub enlarge_factor: f64,
    pub map_projection: String,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            id: "sensorthings".to_string(),
            url: String::new(),
            version: "1.1".to_string(),
            root: RootKind::Things,
            url_parameter: UrlParameter::default(),
            load_things_only_in_current_extent: false,
            intersect: true,
            mqtt: MqttSettings::default(),
            show_no_data_value: true,
            no_data_value: "no data".to_string(),
            utc: "+1".to_string(),
            timezone: "Europe/Berlin".to_string(),
            locale: "de_DE".to_string(),
            time_format: "%d. %B %Y, %H:%M:%S".to_string(),
            enlarge_factor: 0.05,
            map_projection: "EPSG:25832".to_string(),
        }
    }
}

impl LayerConfig {
    pub fn from_json5_str(text: &str) -> Result<Self, ConfigError> {
        let config: LayerConfig = json5::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks everything the layer needs before it can start.
    pub fn validate(&self) -> SyncResult<()> {
        if self.url.trim().is_empty() {
            return Err(SyncError::Configuration(format!("layer '{}' has no url", self.id)));
        }
        url::Url::parse(&self.url)
            .map_err(|e| SyncError::Configuration(format!("layer '{}' url: {}", self.id, e)))?;
        if self.version.trim().is_empty() {
            return Err(SyncError::Configuration(format!("layer '{}' has no version", self.id)));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(SyncError::Configuration(format!("layer '{}' has no mqtt host", self.id)));
        }
        if !self.enlarge_factor.is_finite() {
            return Err(SyncError::Configuration(format!("layer '{}' enlargeFactor is not finite", self.id)));
        }
        self.projection()?;
        self.time_rendering()?;
        Ok(())
    }

    pub fn projection(&self) -> SyncResult<Projection> {
        Projection::from_str(&self.map_projection)
            .map_err(|e| SyncError::Configuration(format!("mapProjection: {}", e)))
    }

    pub fn time_rendering(&self) -> SyncResult<TimeRendering> {
        TimeRendering::from_settings(&self.utc, &self.timezone, &self.locale, &self.time_format)
    }

    pub fn aggregate_options(&self) -> SyncResult<AggregateOptions> {
        Ok(AggregateOptions {
            no_data: NoDataPolicy { show: self.show_no_data_value, value: self.no_data_value.clone() },
            time: self.time_rendering()?,
        })
    }

    /// `<url>/v<version>`.
    pub fn versioned_url(&self) -> String {
        format!("{}/v{}", self.url.trim_end_matches('/'), self.version)
    }

    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            path: self.mqtt.path.clone(),
            protocol: self.mqtt.protocol.clone(),
            mqtt_version: self.mqtt.mqtt_version,
            rh_path: self
                .mqtt
                .rh_path
                .clone()
                .unwrap_or_else(|| self.url.trim_end_matches('/').to_string()),
        }
    }

    pub fn subscribe_overrides(&self) -> SubscribeOverrides {
        SubscribeOverrides { qos: self.mqtt.qos, rh: self.mqtt.rh }
    }
}

/// Reads and validates a JSON5 layer file.
pub fn load_layer_config(path: impl AsRef<Path>) -> Result<LayerConfig, ConfigError> {
    let text = fs::read_to_string(path.as_ref())?;
    LayerConfig::from_json5_str(&text)
}
