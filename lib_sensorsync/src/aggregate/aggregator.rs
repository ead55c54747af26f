//! # Entity Aggregator
//!
//! Turns flattened bulk-query results into one [`AggregatedRecord`] per
//! Thing. Fragments of the same Thing (duplicate ids across pages, or
//! time-sliced copies) are united first: datastream lists are concatenated
//! and scalar properties are pipe-joined in fragment order. Datastream-rooted
//! results are re-rooted into Thing shape before any of this happens.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Map, Value};

use super::model::{
    datastream_key, datastream_time_key, display_value, id_string, AggregatedRecord, DatastreamSummary, Observation,
    Thing,
};
use super::pipe;
use super::time::TimeRendering;
use crate::errors::{SyncError, SyncResult};
use crate::spatial::RootKind;

/// Property key carrying the URL the records were loaded from.
pub const REQUEST_URL_KEY: &str = "requestUrl";
/// Property key carrying the SensorThings API version of the request.
pub const REQUEST_VERSION_KEY: &str = "requestVersion";

/// Placeholder shown for datastreams without a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoDataPolicy {
    pub show: bool,
    pub value: String,
}

impl Default for NoDataPolicy {
    fn default() -> Self {
        Self { show: true, value: "no data".to_string() }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateOptions {
    pub no_data: NoDataPolicy,
    pub time: TimeRendering,
}

/// A raw Thing, or several fragments describing the same logical Thing.
#[derive(Debug, Clone, PartialEq)]
pub enum RawEntity {
    Single(Thing),
    Fragments(Vec<Thing>),
}

pub struct EntityAggregator {
    options: AggregateOptions,
}

impl EntityAggregator {
    pub fn new(options: AggregateOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &AggregateOptions {
        &self.options
    }

    /// Display strings `(value, phenomenonTime)` for an observation.
    pub fn display_observation(&self, result: &Value, phenomenon_time: Option<&str>) -> (String, String) {
        let value = display_value(result);
        if value.is_empty() && self.options.no_data.show {
            let sentinel = self.options.no_data.value.clone();
            return (sentinel.clone(), sentinel);
        }
        let time = phenomenon_time.map(|t| self.options.time.render(t)).unwrap_or_default();
        (value, time)
    }

    /// Aggregates bulk-query results of the given root collection.
    pub fn aggregate_values(
        &self,
        values: Vec<Value>,
        root: RootKind,
        request_url: &str,
        request_version: &str,
    ) -> SyncResult<Vec<AggregatedRecord>> {
        let values = match root {
            RootKind::Things => values,
            RootKind::Datastreams => reroot_datastreams(values)?,
        };
        let things = values
            .into_iter()
            .map(|v| serde_json::from_value::<Thing>(v).map_err(|e| SyncError::Protocol(format!("malformed Thing: {}", e))))
            .collect::<SyncResult<Vec<_>>>()?;
        Ok(self.aggregate(group_fragments(things), request_url, request_version))
    }

    /// One record per raw entity, in input order.
    pub fn aggregate(&self, raw: Vec<RawEntity>, request_url: &str, request_version: &str) -> Vec<AggregatedRecord> {
        raw.into_iter()
            .filter_map(|entity| match entity {
                RawEntity::Single(thing) => Some(thing),
                RawEntity::Fragments(fragments) => unite_fragments(fragments),
            })
            .map(|thing| self.aggregate_thing(thing, request_url, request_version))
            .collect()
    }

    fn aggregate_thing(&self, thing: Thing, request_url: &str, request_version: &str) -> AggregatedRecord {
        let mut rows: Vec<[String; 4]> = Vec::with_capacity(thing.datastreams.len());
        let mut datastream_fields = BTreeMap::new();

        for ds in &thing.datastreams {
            let id = ds.id_key();
            let name = ds.name.clone().unwrap_or_default();
            let (value, time) = match ds.latest() {
                Some(Observation { result, phenomenon_time, .. }) => {
                    self.display_observation(result, phenomenon_time.as_deref())
                }
                None => self.display_observation(&Value::Null, None),
            };
            datastream_fields.insert(datastream_key(&id, &name), value.clone());
            datastream_fields.insert(datastream_time_key(&id, &name), time.clone());
            rows.push([id, name, value, time]);
        }

        let mut properties = BTreeMap::new();
        if let Some(name) = &thing.name {
            properties.insert("name".to_string(), name.clone());
        }
        if let Some(description) = &thing.description {
            properties.insert("description".to_string(), description.clone());
        }
        for (key, value) in &thing.properties {
            properties.insert(key.clone(), display_value(value));
        }
        properties.insert(REQUEST_URL_KEY.to_string(), request_url.to_string());
        properties.insert(REQUEST_VERSION_KEY.to_string(), request_version.to_string());

        AggregatedRecord {
            id: thing.id_key(),
            location: thing.location().cloned(),
            summary: DatastreamSummary::from_rows(&rows),
            datastream_fields,
            properties,
            thing,
        }
    }
}

/// Groups Things by `@iot.id`, keeping first-appearance order. Ids seen
/// more than once become [`RawEntity::Fragments`].
pub fn group_fragments(things: Vec<Thing>) -> Vec<RawEntity> {
    let mut order: Vec<Vec<Thing>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for thing in things {
        let key = thing.id_key();
        match index.get(&key) {
            Some(&i) => order[i].push(thing),
            None => {
                index.insert(key, order.len());
                order.push(vec![thing]);
            }
        }
    }
    order
        .into_iter()
        .map(|mut group| {
            if group.len() == 1 {
                RawEntity::Single(group.remove(0))
            } else {
                RawEntity::Fragments(group)
            }
        })
        .collect()
}

/// Unites fragments of one logical Thing. Locations come from the first
/// fragment; datastreams are concatenated; scalar properties are joined.
pub fn unite_fragments(fragments: Vec<Thing>) -> Option<Thing> {
    let mut fragments = fragments.into_iter();
    let mut united = fragments.next()?;

    for fragment in fragments {
        united.name = join_optional(united.name.take(), fragment.name);
        united.description = join_optional(united.description.take(), fragment.description);
        for (key, value) in fragment.properties {
            let joined = match united.properties.get(&key) {
                Some(existing) => pipe::append(Some(&display_value(existing)), &display_value(&value)),
                None => display_value(&value),
            };
            united.properties.insert(key, Value::String(joined));
        }
        united.datastreams.extend(fragment.datastreams);
    }
    Some(united)
}

fn join_optional(left: Option<String>, right: Option<String>) -> Option<String> {
    match (left, right) {
        (Some(l), Some(r)) => Some(pipe::append(Some(&l), &r)),
        (l, r) => l.or(r),
    }
}

/// Re-roots Datastream records (each with a nested `Thing`) into Thing
/// records with a `Datastreams` array, merging records of the same Thing.
pub fn reroot_datastreams(records: Vec<Value>) -> SyncResult<Vec<Value>> {
    let (thing_scope, datastream_scope) = association_sets(&records)?;

    let mut things: Vec<Map<String, Value>> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records {
        let Value::Object(mut record) = record else {
            return Err(SyncError::Protocol("datastream record is not an object".to_string()));
        };
        let Some(Value::Object(thing_attrs)) = record.remove("Thing") else {
            return Err(SyncError::Protocol("datastream record without expanded Thing".to_string()));
        };

        let datastream: Map<String, Value> =
            record.into_iter().filter(|(k, _)| datastream_scope.contains(k)).collect();
        let thing_id = id_string(thing_attrs.get("@iot.id").unwrap_or(&Value::Null));

        match index.get(&thing_id) {
            Some(&i) => {
                if let Some(Value::Array(list)) = things[i].get_mut("Datastreams") {
                    list.push(Value::Object(datastream));
                }
            }
            None => {
                let mut thing: Map<String, Value> =
                    thing_attrs.into_iter().filter(|(k, _)| thing_scope.contains(k)).collect();
                thing.insert("Datastreams".to_string(), Value::Array(vec![Value::Object(datastream)]));
                index.insert(thing_id, things.len());
                things.push(thing);
            }
        }
    }

    Ok(things.into_iter().map(Value::Object).collect())
}

/// Which attribute names belong to the Thing and which to the Datastream.
fn association_sets(records: &[Value]) -> SyncResult<(BTreeSet<String>, BTreeSet<String>)> {
    let mut thing_scope = BTreeSet::new();
    let mut datastream_scope = BTreeSet::new();
    for record in records {
        let obj = record
            .as_object()
            .ok_or_else(|| SyncError::Protocol("datastream record is not an object".to_string()))?;
        for (key, value) in obj {
            if key == "Thing" {
                if let Some(thing) = value.as_object() {
                    thing_scope.extend(thing.keys().filter(|k| k.as_str() != "Datastreams").cloned());
                }
            } else {
                datastream_scope.insert(key.clone());
            }
        }
    }
    Ok((thing_scope, datastream_scope))
}
