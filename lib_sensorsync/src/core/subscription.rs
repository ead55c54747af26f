//! # Subscription Manager
//!
//! Keeps the live MQTT subscriptions of one SensorThings layer in step with
//! what the user can see.
//!
//! ## State Machine
//!
//! Three flags drive the layer: `out_of_range` (the map scale hides it),
//! `visible` (the user toggled it) and `subscribed`. See [`transition`]:
//!
//! - **Start** when the layer is in range, visible and not subscribed: load
//!   entities if the layer only ever holds the current extent and holds
//!   none, then subscribe every datastream of the loaded features.
//! - **Stop** when the layer left range or was hidden while subscribed:
//!   unsubscribe every active topic.
//! - Anything else is ignored, so unrelated state changes never thrash the
//!   broker.
//!
//! While subscribed, every viewport change reconciles the subscriptions with
//! the datastreams of features inside the slightly enlarged viewport.
//!
//! ## Push Messages
//!
//! Incoming observations are routed to the feature owning the datastream
//! (by whole-token match on its pipe-joined `dataStreamId`), written into
//! its aggregated record in place, and reported to the [`LayerObserver`].
//! Messages for datastreams no loaded feature owns are dropped: they race
//! with viewport changes and pagination by nature.
//!
//! ## Event Loop
//!
//! [`SubscriptionManager::spawn`] moves the manager onto one tokio task and
//! returns a [`LayerHandle`]. Host events and MQTT messages all enter
//! through the same channel, so feature and topic state is only ever
//! mutated by that task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

use crate::aggregate::{AggregatedRecord, EntityAggregator, Observation};
use crate::configs::LayerConfig;
use crate::errors::{SyncError, SyncResult};
use crate::mqtt::{EventKind, MqttConnector, MqttEvent, MqttMessage};
use crate::retrieve::{HttpGet, PaginationWalker};
use crate::spatial::{build_extent_filter, enlarge_extent, splice_filter_into_url, Extent, Geometry, Projection, RootKind};

/// Expand used when the layer configures none: locations plus the newest
/// observation of every datastream.
pub fn default_expand(root: RootKind) -> &'static str {
    match root {
        RootKind::Things => "Locations,Datastreams($expand=Observations($top=1;$orderby=phenomenonTime desc))",
        RootKind::Datastreams => "Thing($expand=Locations),Observations($top=1;$orderby=phenomenonTime desc)",
    }
}

/// `v<version>/Datastreams(<id>)/Observations`.
pub fn observation_topic(version: &str, datastream_id: &str) -> String {
    format!("v{}/Datastreams({})/Observations", version, datastream_id)
}

/// The text between `Datastreams(` and the following `)`.
pub fn datastream_id_from_topic(topic: &str) -> Option<&str> {
    let start = topic.find("Datastreams(")? + "Datastreams(".len();
    let len = topic[start..].find(')')?;
    Some(&topic[start..start + len])
}

/// What a change of the layer flags asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Stop,
    Hold,
}

pub fn transition(out_of_range: bool, visible: bool, subscribed: bool) -> Transition {
    if !out_of_range && visible && !subscribed {
        Transition::Start
    } else if (out_of_range || !visible) && subscribed {
        Transition::Stop
    } else {
        Transition::Hold
    }
}

/// Ids to subscribe: every id of `ids` whose topic is not active, in order
/// and without duplicates.
pub fn subscribe_diff(ids: &[String], topics: &HashMap<String, bool>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| !topics.get(id.as_str()).copied().unwrap_or(false))
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

/// Ids to unsubscribe: every active topic not in `keep`, or every active
/// topic when the layer is hidden. Sorted for a stable call order.
pub fn unsubscribe_diff(keep: &[String], topics: &HashMap<String, bool>, visible: bool) -> Vec<String> {
    let keep: HashSet<&str> = keep.iter().map(String::as_str).collect();
    let mut ids: Vec<String> = topics
        .iter()
        .filter(|(id, active)| **active && (!visible || !keep.contains(id.as_str())))
        .map(|(id, _)| id.clone())
        .collect();
    ids.sort();
    ids
}

/// A loaded entity with its location in the map projection.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorFeature {
    pub record: AggregatedRecord,
    pub geometry: Option<Geometry>,
}

impl SensorFeature {
    /// Reads the record's GeoJSON location (EPSG:4326) into `projection`.
    /// Records with a missing or unreadable location keep no geometry.
    pub fn from_record(record: AggregatedRecord, projection: Projection) -> Self {
        let geometry = record.location.as_ref().and_then(|location| {
            match Geometry::from_geojson(location).and_then(|g| g.reproject(Projection::Wgs84, projection)) {
                Ok(geometry) => Some(geometry),
                Err(e) => {
                    warn!("Thing {} has an unusable location: {}", record.id, e);
                    None
                }
            }
        });
        Self { record, geometry }
    }
}

/// A map feature: one entity, or a cluster of entities drawn as one.
#[derive(Debug, Clone, PartialEq)]
pub enum MapFeature {
    Single(SensorFeature),
    Cluster(Vec<SensorFeature>),
}

impl MapFeature {
    /// The entities behind this feature, clusters unwrapped one level.
    pub fn members(&self) -> &[SensorFeature] {
        match self {
            MapFeature::Single(feature) => std::slice::from_ref(feature),
            MapFeature::Cluster(members) => members,
        }
    }

    fn members_mut(&mut self) -> &mut [SensorFeature] {
        match self {
            MapFeature::Single(feature) => std::slice::from_mut(feature),
            MapFeature::Cluster(members) => members,
        }
    }
}

/// The visible map area.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub extent: Extent,
    pub projection: Projection,
}

/// Collaborator notified about changes of a layer.
pub trait LayerObserver: Send + Sync {
    /// A live observation changed `record`. Displays of it should refresh.
    fn feature_updated(&self, layer_id: &str, record: &AggregatedRecord);

    /// The layer's features were reloaded.
    fn features_replaced(&self, _layer_id: &str, _count: usize) {}

    /// A fetch or (un)subscription failed. The layer keeps running.
    fn error(&self, _layer_id: &str, _error: &SyncError) {}
}

/// Events a host feeds into a spawned layer.
#[derive(Debug, Clone)]
pub enum LayerEvent {
    State { out_of_range: bool, visible: bool },
    Viewport(Viewport),
    Features(Vec<MapFeature>),
    Message(MqttMessage),
    Shutdown,
}

/// Sending side of a spawned layer.
#[derive(Debug, Clone)]
pub struct LayerHandle {
    tx: mpsc::UnboundedSender<LayerEvent>,
}

impl LayerHandle {
    fn send(&self, event: LayerEvent) -> SyncResult<()> {
        self.tx
            .send(event)
            .map_err(|_| SyncError::Configuration("layer event loop has stopped".to_string()))
    }

    pub fn set_state(&self, out_of_range: bool, visible: bool) -> SyncResult<()> {
        self.send(LayerEvent::State { out_of_range, visible })
    }

    pub fn viewport_changed(&self, viewport: Viewport) -> SyncResult<()> {
        self.send(LayerEvent::Viewport(viewport))
    }

    pub fn replace_features(&self, features: Vec<MapFeature>) -> SyncResult<()> {
        self.send(LayerEvent::Features(features))
    }

    /// Stops the layer. Its topics are unsubscribed; the shared connection
    /// stays open.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.send(LayerEvent::Shutdown)
    }
}

pub struct SubscriptionManager {
    config: LayerConfig,
    projection: Projection,
    connector: Arc<MqttConnector>,
    walker: PaginationWalker,
    aggregator: EntityAggregator,
    observer: Arc<dyn LayerObserver>,
    features: Vec<MapFeature>,
    topics: HashMap<String, bool>,
    out_of_range: bool,
    visible: bool,
    subscribed: bool,
    viewport: Option<Viewport>,
    following_viewport: bool,
}

impl SubscriptionManager {
    /// Builds the manager of one layer. The layer starts hidden.
    pub fn new(
        config: LayerConfig,
        connector: Arc<MqttConnector>,
        http: Arc<dyn HttpGet>,
        observer: Arc<dyn LayerObserver>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let projection = config.projection()?;
        let aggregator = EntityAggregator::new(config.aggregate_options()?);
        Ok(Self {
            config,
            projection,
            connector,
            walker: PaginationWalker::new(http).strip_navigation(true),
            aggregator,
            observer,
            features: Vec::new(),
            topics: HashMap::new(),
            out_of_range: false,
            visible: false,
            subscribed: false,
            viewport: None,
            following_viewport: false,
        })
    }

    pub fn layer_id(&self) -> &str {
        &self.config.id
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn features(&self) -> &[MapFeature] {
        &self.features
    }

    /// Topic state by datastream id: `true` while subscribed.
    pub fn topics(&self) -> &HashMap<String, bool> {
        &self.topics
    }

    /// Ids of every active topic, sorted.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.topics.iter().filter(|(_, a)| **a).map(|(id, _)| id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn set_features(&mut self, features: Vec<MapFeature>) {
        self.features = features;
        self.observer.features_replaced(&self.config.id, self.features.len());
    }

    /// Records the viewport without reconciling subscriptions.
    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
    }

    /// Bulk query URL: `<url>/v<version>/<root>` with the layer's OData
    /// options, plus a spatial filter for `viewport` when given.
    pub fn request_url(&self, viewport: Option<&Viewport>) -> SyncResult<String> {
        let base = format!("{}/{}", self.config.versioned_url(), self.config.root.as_str());
        let mut url = Url::parse(&base).map_err(|e| SyncError::Validation(format!("invalid url '{}': {}", base, e)))?;
        {
            let params = &self.config.url_parameter;
            let mut query = url.query_pairs_mut();
            if let Some(filter) = params.filter.as_deref().filter(|f| !f.is_empty()) {
                query.append_pair("$filter", filter);
            }
            let expand = params.expand.as_deref().unwrap_or_else(|| default_expand(self.config.root));
            query.append_pair("$expand", expand);
            if let Some(select) = params.select.as_deref().filter(|s| !s.is_empty()) {
                query.append_pair("$select", select);
            }
            if let Some(orderby) = params.orderby.as_deref().filter(|o| !o.is_empty()) {
                query.append_pair("$orderby", orderby);
            }
        }
        let url = url.to_string();

        match viewport {
            Some(viewport) => {
                let filter = build_extent_filter(
                    &viewport.extent.to_array(),
                    &viewport.projection.code(),
                    &Projection::Wgs84.code(),
                    self.config.root,
                    self.config.intersect,
                )?;
                splice_filter_into_url(&url, &filter)
            }
            None => Ok(url),
        }
    }

    /// Loads the layer's entities, scoped to `viewport` when given, and
    /// replaces the features.
    ///
    /// A walk that fails after some pages still replaces the features with
    /// what it loaded and then returns the error. A walk that fails before
    /// delivering any entity leaves the current features untouched.
    pub async fn load(&mut self, viewport: Option<Viewport>) -> SyncResult<usize> {
        let url = self.request_url(viewport.as_ref())?;
        info!("Layer {} loading {}", self.config.id, url);

        let mut values = Vec::new();
        let walked = self.walker.fetch_into(&url, &mut values).await;
        if let Err(e) = &walked {
            if values.is_empty() {
                warn!("Layer {} keeps {} features, load failed: {}", self.config.id, self.features.len(), e);
                return Err(e.clone());
            }
            warn!("Layer {} loaded {} entities before failing: {}", self.config.id, values.len(), e);
        }

        let records = self.aggregator.aggregate_values(values, self.config.root, &url, &self.config.version)?;
        let features: Vec<MapFeature> = records
            .into_iter()
            .map(|r| MapFeature::Single(SensorFeature::from_record(r, self.projection)))
            .collect();
        let count = features.len();
        self.set_features(features);
        walked.map(|_| count)
    }

    /// Updates the layer flags and applies the resulting transition.
    pub async fn set_state(&mut self, out_of_range: bool, visible: bool) -> Transition {
        self.out_of_range = out_of_range;
        self.visible = visible;
        let next = transition(out_of_range, visible, self.subscribed);
        match next {
            Transition::Start => self.start().await,
            Transition::Stop => self.stop().await,
            Transition::Hold => {}
        }
        next
    }

    async fn start(&mut self) {
        self.subscribed = true;
        info!("Layer {} starts live updates", self.config.id);

        if self.config.load_things_only_in_current_extent && self.features.is_empty() {
            match self.viewport {
                Some(viewport) => {
                    if let Err(e) = self.load(Some(viewport)).await {
                        self.report(&e);
                    }
                }
                None => debug!("Layer {} has no viewport to load yet", self.config.id),
            }
        }

        let ids = self.all_datastream_ids();
        self.subscribe_ids(&ids).await;
        self.following_viewport = true;
    }

    async fn stop(&mut self) {
        self.subscribed = false;
        self.following_viewport = false;
        info!("Layer {} stops live updates", self.config.id);
        let ids = self.active_ids();
        self.unsubscribe_ids(&ids).await;
        self.topics.clear();
    }

    /// Reconciles subscriptions with the features inside `viewport`.
    pub async fn viewport_changed(&mut self, viewport: Viewport) {
        self.viewport = Some(viewport);
        if !self.subscribed || !self.following_viewport {
            return;
        }

        if self.config.load_things_only_in_current_extent {
            if let Err(e) = self.load(Some(viewport)).await {
                self.report(&e);
            }
        }

        let keep = match self.keep_ids(&viewport) {
            Ok(keep) => keep,
            Err(e) => {
                self.report(&e);
                return;
            }
        };
        let stale = unsubscribe_diff(&keep, &self.topics, self.visible);
        self.unsubscribe_ids(&stale).await;
        if self.visible {
            self.subscribe_ids(&keep).await;
        }
    }

    /// Datastream ids of features intersecting the enlarged viewport.
    pub fn keep_ids(&self, viewport: &Viewport) -> SyncResult<Vec<String>> {
        let extent =
            enlarge_extent(&viewport.extent, self.config.enlarge_factor).reproject(viewport.projection, self.projection)?;

        let mut ids = Vec::new();
        for member in self.features.iter().flat_map(MapFeature::members) {
            if member.geometry.as_ref().is_some_and(|g| g.intersects_extent(&extent)) {
                ids.extend(member.record.summary.ids().into_iter().map(str::to_string));
            }
        }
        Ok(ids)
    }

    fn all_datastream_ids(&self) -> Vec<String> {
        self.features
            .iter()
            .flat_map(MapFeature::members)
            .flat_map(|m| m.record.summary.ids())
            .map(str::to_string)
            .collect()
    }

    async fn subscribe_ids(&mut self, ids: &[String]) {
        let pending = subscribe_diff(ids, &self.topics);
        if pending.is_empty() {
            return;
        }
        debug!("Layer {} subscribes {:?}", self.config.id, pending);
        let overrides = self.config.subscribe_overrides();
        for id in pending {
            let topic = observation_topic(&self.config.version, &id);
            match self.connector.subscribe(&topic, overrides).await {
                Ok(_) => {
                    self.topics.insert(id, true);
                }
                Err(e) => {
                    self.topics.insert(id, false);
                    self.report(&e);
                }
            }
        }
    }

    async fn unsubscribe_ids(&mut self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }
        debug!("Layer {} unsubscribes {:?}", self.config.id, ids);
        for id in ids {
            let topic = observation_topic(&self.config.version, id);
            match self.connector.unsubscribe(&topic).await {
                Ok(()) => {
                    self.topics.insert(id.clone(), false);
                }
                Err(e) => self.report(&e),
            }
        }
    }

    /// Applies a pushed observation. Returns whether a feature owned it.
    pub fn handle_message(&mut self, message: &MqttMessage) -> SyncResult<bool> {
        let Some(id) = datastream_id_from_topic(&message.topic) else {
            debug!("Layer {} ignores topic {}", self.config.id, message.topic);
            return Ok(false);
        };

        let owned = self
            .features
            .iter()
            .flat_map(MapFeature::members)
            .any(|m| m.record.summary.contains_id(id));
        if !owned {
            debug!("Layer {} has no feature for datastream {}", self.config.id, id);
            return Ok(false);
        }

        let observation: Observation = serde_json::from_value(message.payload.clone())
            .map_err(|e| SyncError::Protocol(format!("observation on {}: {}", message.topic, e)))?;
        let (value, time) =
            self.aggregator.display_observation(&observation.result, observation.phenomenon_time.as_deref());

        let owner = self
            .features
            .iter_mut()
            .flat_map(MapFeature::members_mut)
            .find(|m| m.record.summary.contains_id(id));
        let Some(owner) = owner else {
            return Ok(false);
        };

        owner.record.apply_observation(id, observation, &value, &time)?;
        self.observer.feature_updated(&self.config.id, &owner.record);
        Ok(true)
    }

    fn report(&self, error: &SyncError) {
        warn!("Layer {}: {}", self.config.id, error);
        self.observer.error(&self.config.id, error);
    }

    /// Runs the manager on its own task. MQTT messages of the connector are
    /// forwarded into the same loop as the host's events.
    pub fn spawn(mut self) -> SyncResult<(LayerHandle, JoinHandle<()>)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let forward = tx.clone();
        let handler_id = self.connector.on(EventKind::Message, move |event| {
            if let MqttEvent::Message(message) = event {
                if forward.send(LayerEvent::Message(message.clone())).is_err() {
                    debug!("Layer loop is gone, dropping message on {}", message.topic);
                }
            }
        })?;

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    LayerEvent::State { out_of_range, visible } => {
                        self.set_state(out_of_range, visible).await;
                    }
                    LayerEvent::Viewport(viewport) => self.viewport_changed(viewport).await,
                    LayerEvent::Features(features) => self.set_features(features),
                    LayerEvent::Message(message) => {
                        if let Err(e) = self.handle_message(&message) {
                            self.report(&e);
                        }
                    }
                    LayerEvent::Shutdown => break,
                }
            }
            if self.subscribed {
                self.stop().await;
            }
            self.connector.off(handler_id);
            info!("Layer {} event loop stopped", self.config.id);
        });

        Ok((LayerHandle { tx }, task))
    }
}
