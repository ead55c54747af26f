//! # Configuration Modules
//!
//! Layer configuration and its JSON5 loader.

/// Per-layer settings: service, filters, broker and display options.
pub mod layer;

pub use layer::{load_layer_config, ConfigError, LayerConfig, MqttSettings, UrlParameter};
