//! # lib_sensorsync
//!
//! Keeps map layers of OGC SensorThings entities live: viewport-scoped bulk
//! queries, complete pagination of nested collections, per-Thing
//! aggregation for display, and MQTT push updates across protocol
//! revisions.

pub mod aggregate;
pub mod configs;
pub mod core;
pub mod errors;
pub mod mqtt;
pub mod retrieve;
pub mod spatial;

pub use errors::{SyncError, SyncResult};
