//! Console and file logging for the watcher. Each watched layer writes to
//! its own `sensorsync-<layer>.log`, appended across runs, and the engine's
//! MQTT and layer targets can be tuned apart from the rest.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use log::LevelFilter;

const ENGINE_PREFIX: &str = "lib_sensorsync::";
const MQTT_TARGET: &str = "lib_sensorsync::mqtt";
const LAYER_TARGET: &str = "lib_sensorsync::core";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevels {
    pub base: LevelFilter,
    /// Connector and transport: connects, subscribes, reconnects, retained lookups.
    pub mqtt: LevelFilter,
    /// Layer event loop: loads, subscription diffs, pushed observations.
    pub layer: LevelFilter,
}

impl LogLevels {
    /// Unset target levels follow `base`.
    pub fn parse(base: &str, mqtt: Option<&str>, layer: Option<&str>) -> Result<Self> {
        let base = parse_level(base)?;
        Ok(Self {
            base,
            mqtt: mqtt.map(parse_level).transpose()?.unwrap_or(base),
            layer: layer.map(parse_level).transpose()?.unwrap_or(base),
        })
    }
}

fn parse_level(raw: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(raw.trim()).map_err(|_| anyhow!("unknown log level '{}'", raw))
}

/// `<log_dir>/sensorsync-<layer>.log`, with anything but ASCII letters,
/// digits, `-` and `_` in the layer id replaced by `_`.
pub fn log_file_path(log_dir: &Path, layer_id: &str) -> PathBuf {
    let safe: String = layer_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    log_dir.join(format!("sensorsync-{}.log", safe))
}

fn short_target(target: &str) -> &str {
    target.strip_prefix(ENGINE_PREFIX).unwrap_or(target)
}

pub fn setup_logging(log_dir: &Path, layer_id: &str, levels: LogLevels) -> Result<PathBuf> {
    fs::create_dir_all(log_dir).with_context(|| format!("cannot create log dir {}", log_dir.display()))?;
    let log_path = log_file_path(log_dir, layer_id);

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.level(),
                short_target(record.target()),
                message
            ))
        })
        .level(levels.base)
        .level_for(MQTT_TARGET, levels.mqtt)
        .level_for(LAYER_TARGET, levels.layer)
        // rumqttc logs every ping at debug
        .level_for("rumqttc", levels.mqtt.min(LevelFilter::Info))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    Ok(log_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_levels_default_to_base() {
        let levels = LogLevels::parse("warn", Some("debug"), None).unwrap();
        assert_eq!(levels.base, LevelFilter::Warn);
        assert_eq!(levels.mqtt, LevelFilter::Debug);
        assert_eq!(levels.layer, LevelFilter::Warn);
        assert!(LogLevels::parse("loud", None, None).is_err());
        assert!(LogLevels::parse("info", None, Some("chatty")).is_err());
    }

    #[test]
    fn one_file_per_layer() {
        let path = log_file_path(Path::new("logs"), "air quality/2");
        assert_eq!(path, Path::new("logs").join("sensorsync-air_quality_2.log"));
    }

    #[test]
    fn engine_targets_are_shortened() {
        assert_eq!(short_target("lib_sensorsync::mqtt::connector"), "mqtt::connector");
        assert_eq!(short_target("rumqttc::state"), "rumqttc::state");
    }
}
