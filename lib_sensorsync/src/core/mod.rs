//! # Core Engine Module
//!
//! Ties retrieval, aggregation and MQTT together per map layer.
//!
//! ## Core Components:
//!
//! - **`subscription`**: The `SubscriptionManager` state machine, its
//!   typed event channel (`LayerHandle`) and the `LayerObserver` callback
//!   interface used to refresh displays.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

/// Per-layer subscription state machine and event loop.
pub mod subscription;

pub use subscription::{
    LayerEvent, LayerHandle, LayerObserver, MapFeature, SensorFeature, SubscriptionManager, Transition, Viewport,
};
