use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Keeps a SensorThings layer live and logs every pushed observation", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SENSORSYNC_CONFIG_PATH", help = "Path to the JSON5 watcher configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SENSORSYNC_LAYER", help = "Path to the JSON5 layer configuration.")]
    pub layer: Option<PathBuf>,

    #[clap(long, env = "SENSORSYNC_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SENSORSYNC_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SENSORSYNC_MQTT_LOG_LEVEL", help = "Level for the MQTT connector and transport; defaults to --log-level.")]
    pub mqtt_log_level: Option<String>,

    #[clap(long, env = "SENSORSYNC_LAYER_LOG_LEVEL", help = "Level for the layer event loop; defaults to --log-level.")]
    pub layer_log_level: Option<String>,

    #[clap(long, env = "SENSORSYNC_EXTENT", help = "Viewport as minX,minY,maxX,maxY.")]
    pub extent: Option<String>,

    #[clap(long, env = "SENSORSYNC_EXTENT_PROJECTION", help = "Projection of the viewport, e.g. EPSG:25832.")]
    pub extent_projection: Option<String>,

    #[clap(long, env = "SENSORSYNC_CLIENT_ID", help = "MQTT client id.")]
    pub client_id: Option<String>,

    #[clap(long, env = "SENSORSYNC_HTTP_TIMEOUT_SECS", help = "Timeout of each HTTP request in seconds.")]
    pub http_timeout_secs: Option<u64>,

    #[clap(long, env = "SENSORSYNC_HTTP_RETRIES", help = "Retries of transient HTTP failures (0 disables).")]
    pub http_retries: Option<u32>,

    #[clap(long, env = "SENSORSYNC_AUTH_TOKEN", help = "Bearer token for the SensorThings service.")]
    pub auth_token: Option<String>,
}

impl Config {
    // 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            layer: other.layer.or(self.layer),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            mqtt_log_level: other.mqtt_log_level.or(self.mqtt_log_level),
            layer_log_level: other.layer_log_level.or(self.layer_log_level),
            extent: other.extent.or(self.extent),
            extent_projection: other.extent_projection.or(self.extent_projection),
            client_id: other.client_id.or(self.client_id),
            http_timeout_secs: other.http_timeout_secs.or(self.http_timeout_secs),
            http_retries: other.http_retries.or(self.http_retries),
            auth_token: other.auth_token.or(self.auth_token),
        }
    }

    /// Parses `extent` into four numbers.
    pub fn extent_values(&self) -> anyhow::Result<Option<Vec<f64>>> {
        let Some(raw) = &self.extent else { return Ok(None) };
        let values = raw
            .split(',')
            .map(|v| v.trim().parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("invalid extent '{}': {}", raw, e))?;
        Ok(Some(values))
    }
}

fn defaults() -> Config {
    Config {
        layer: Some(PathBuf::from("layer.json5")),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        extent_projection: Some("EPSG:25832".to_string()),
        http_timeout_secs: Some(30),
        http_retries: Some(0),
        ..Default::default()
    }
}

/// Reads a watcher config file. Missing or broken files fall back to the
/// other sources.
fn read_file_config(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(text) => match json5::from_str::<Config>(&text) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// defaults < config file < environment < command line
pub fn resolve(cli: Config) -> Config {
    let path = cli.config_path.clone().unwrap_or_else(|| PathBuf::from("sensorsync.json5"));
    let mut config = defaults();
    if let Some(file) = read_file_config(&path) {
        config = config.merge(file);
    }
    config.merge(cli)
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}
