//! Process-wide reuse of broker connections.
//!
//! Connectors are keyed by [`ConnectionParams::canonical_key`]. The registry
//! only holds weak references: a connector lives as long as some layer
//! uses it, and an ended connector is replaced on the next request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use log::debug;

use super::connector::MqttConnector;
use super::transport::TransportFactory;
use super::types::ConnectionParams;
use crate::errors::SyncResult;
use crate::retrieve::HttpGet;

static GLOBAL: OnceLock<ConnectorRegistry> = OnceLock::new();

#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: Mutex<HashMap<String, Weak<MqttConnector>>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by the whole process.
    pub fn global() -> &'static ConnectorRegistry {
        GLOBAL.get_or_init(ConnectorRegistry::new)
    }

    /// Returns the live connector built from equal parameters, or builds a
    /// new one with a transport from `factory`.
    pub fn get_or_create(
        &self,
        params: ConnectionParams,
        factory: &dyn TransportFactory,
        http: Arc<dyn HttpGet>,
    ) -> SyncResult<Arc<MqttConnector>> {
        let key = params.canonical_key()?;
        let mut connectors = self.connectors.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = connectors.get(&key).and_then(Weak::upgrade).filter(|c| c.is_live()) {
            debug!("Reusing connector for {}", existing.params().broker_url());
            return Ok(existing);
        }

        connectors.retain(|_, weak| weak.upgrade().is_some_and(|c| c.is_live()));
        let transport = factory.create(&params)?;
        let connector = Arc::new(MqttConnector::new(params, transport, http));
        debug!("Created connector for {}", connector.params().broker_url());
        connectors.insert(key, Arc::downgrade(&connector));
        Ok(connector)
    }

    /// Number of live connectors.
    pub fn live_count(&self) -> usize {
        self.connectors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|weak| weak.upgrade().is_some_and(|c| c.is_live()))
            .count()
    }
}
