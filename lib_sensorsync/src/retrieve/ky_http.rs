//! # HTTP Retrieval Utilities
//!
//! The engine only ever issues JSON `GET`s against absolute URLs (bulk query
//! pages, continuation links and retained-state lookups). That single
//! capability is the `HttpGet` trait, so the pagination walker and the MQTT
//! connector can run against an in-memory fake in tests and against
//! `ApiClient` in production.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::SyncResult;

/// Fetches one URL and decodes the body as JSON.
///
/// Implementations map network failures and non-2xx statuses to
/// `SyncError::Transport`, and undecodable bodies to `SyncError::Protocol`.
#[async_trait]
pub trait HttpGet: Send + Sync {
    /// Performs a single `GET` against the absolute `url`.
    async fn get_json(&self, url: &str) -> SyncResult<Value>;
}

#[cfg(feature = "reqwest-client")]
pub use client::{ApiClient, HttpOptions};

#[cfg(feature = "reqwest-client")]
mod client {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::header::{ACCEPT, AUTHORIZATION};
    use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
    use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
    use serde::{Deserialize, Serialize};
    use serde_json::Value;

    use super::HttpGet;
    use crate::errors::{SyncError, SyncResult};

    /// Settings for [`ApiClient`].
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase", default)]
    pub struct HttpOptions {
        /// Per-request timeout.
        pub timeout_secs: u64,
        /// Value of the `User-Agent` header.
        pub user_agent: String,
        /// Optional bearer token sent with every request.
        pub auth_token: Option<String>,
        /// Transient-failure retries with exponential backoff. Zero disables
        /// the retry middleware entirely.
        pub max_retries: u32,
    }

    impl Default for HttpOptions {
        fn default() -> Self {
            Self {
                timeout_secs: 30,
                user_agent: format!("sensorsync/{}", env!("CARGO_PKG_VERSION")),
                auth_token: None,
                max_retries: 0,
            }
        }
    }

    /// A JSON `GET` client on top of `reqwest_middleware`.
    pub struct ApiClient {
        /// The underlying middleware-enabled client.
        inner: ClientWithMiddleware,
        /// An optional Bearer token used for authorization.
        auth_token: Option<String>,
    }

    impl ApiClient {
        /// Creates a new `ApiClient`.
        ///
        /// # Errors
        /// Returns `SyncError::Configuration` if the TLS backend or the
        /// client builder cannot be initialised.
        pub fn new(options: HttpOptions) -> SyncResult<Self> {
            let base = reqwest::Client::builder()
                .timeout(Duration::from_secs(options.timeout_secs))
                .user_agent(options.user_agent.clone())
                .build()
                .map_err(|e| SyncError::Configuration(format!("http client: {}", e)))?;

            let mut builder = ClientBuilder::new(base);
            if options.max_retries > 0 {
                let retry_policy = ExponentialBackoff::builder().build_with_max_retries(options.max_retries);
                builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
            }

            Ok(Self {
                inner: builder.build(),
                auth_token: options.auth_token,
            })
        }
    }

    #[async_trait]
    impl HttpGet for ApiClient {
        async fn get_json(&self, url: &str) -> SyncResult<Value> {
            let mut req = self.inner.get(url).header(ACCEPT, "application/json");
            if let Some(token) = &self.auth_token {
                req = req.header(AUTHORIZATION, format!("Bearer {}", token));
            }

            let response = req
                .send()
                .await
                .map_err(|e| SyncError::Transport(format!("GET {} failed: {}", url, e)))?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(SyncError::Transport(format!(
                    "GET {} returned HTTP {}: {}",
                    url,
                    status.as_u16(),
                    body.chars().take(200).collect::<String>()
                )));
            }

            let text = response
                .text()
                .await
                .map_err(|e| SyncError::Transport(format!("reading body of {} failed: {}", url, e)))?;
            serde_json::from_str(&text)
                .map_err(|e| SyncError::Protocol(format!("response of {} is not JSON: {}", url, e)))
        }
    }
}
