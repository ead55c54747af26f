//! # Data Retrieval Module
//!
//! Bulk loading of SensorThings entities over HTTP.
//!
//! ## Contained Modules:
//!
//! - **`ky_http`**: The `HttpGet` seam every HTTP consumer in the crate goes
//!   through, and `ApiClient`, its `reqwest` / `reqwest-middleware`
//!   implementation with opt-in exponential-backoff retries.
//! - **`pagination`**: The `PaginationWalker`, which follows every
//!   `@iot.nextLink` of a deeply nested response tree, strictly one request
//!   at a time, and flattens the pages into one result list.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

/// The HTTP seam and its reqwest-backed client.
pub mod ky_http;
/// Breadth-first continuation-link walker.
pub mod pagination;

pub use ky_http::HttpGet;
#[cfg(feature = "reqwest-client")]
pub use ky_http::{ApiClient, HttpOptions};
pub use pagination::{FetchHooks, PaginationWalker};
