//! SensorThings entities as delivered by the bulk query, and the aggregated
//! per-Thing record derived from them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::pipe;
use crate::errors::{SyncError, SyncResult};

/// Renders an opaque `@iot.id` (string or number) as a string key.
pub fn id_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Renders a scalar JSON value for display. `null` becomes the empty string.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "@iot.id", default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    #[serde(default)]
    pub result: Value,
    #[serde(rename = "phenomenonTime", default, skip_serializing_if = "Option::is_none")]
    pub phenomenon_time: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Datastream {
    #[serde(rename = "@iot.id", default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "Observations", default)]
    pub observations: Vec<Observation>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Datastream {
    pub fn id_key(&self) -> String {
        id_string(&self.id)
    }

    /// The observation the bulk query ordered first (newest by phenomenonTime).
    pub fn latest(&self) -> Option<&Observation> {
        self.observations.first()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    #[serde(rename = "@iot.id", default, skip_serializing_if = "Value::is_null")]
    pub id: Value,
    #[serde(default)]
    pub location: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thing {
    #[serde(rename = "@iot.id", default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(rename = "Locations", default)]
    pub locations: Vec<Location>,
    #[serde(rename = "Datastreams", default)]
    pub datastreams: Vec<Datastream>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Thing {
    pub fn id_key(&self) -> String {
        id_string(&self.id)
    }

    /// GeoJSON of the first location, if any.
    pub fn location(&self) -> Option<&Value> {
        self.locations.first().map(|l| &l.location).filter(|v| !v.is_null())
    }
}

/// The four positionally aligned pipe-joined datastream columns.
///
/// Splitting any column on `" | "` yields `data_stream_count` entries, and
/// index *i* of each list describes the same datastream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastreamSummary {
    pub data_stream_id: String,
    pub data_stream_name: String,
    pub data_stream_value: String,
    pub data_stream_phenomenon_time: String,
    #[serde(default)]
    pub data_stream_count: usize,
}

impl DatastreamSummary {
    /// Builds the columns from per-datastream rows, in row order.
    pub fn from_rows<S: AsRef<str>>(rows: &[[S; 4]]) -> Self {
        let column = |i: usize| pipe::join(&rows.iter().map(|r| r[i].as_ref()).collect::<Vec<_>>());
        if rows.is_empty() {
            return Self::default();
        }
        Self {
            data_stream_id: column(0),
            data_stream_name: column(1),
            data_stream_value: column(2),
            data_stream_phenomenon_time: column(3),
            data_stream_count: rows.len(),
        }
    }

    /// No datastreams. A single datastream with an empty id is not empty.
    pub fn is_empty(&self) -> bool {
        self.data_stream_count == 0
    }

    pub fn ids(&self) -> Vec<&str> {
        if self.is_empty() {
            return Vec::new();
        }
        pipe::split(&self.data_stream_id)
    }

    pub fn contains_id(&self, id: &str) -> bool {
        !self.is_empty() && pipe::contains_token(&self.data_stream_id, id)
    }

    /// Number of datastreams, after checking that all four columns agree.
    pub fn checked_len(&self) -> SyncResult<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let lens = [
            pipe::split(&self.data_stream_id).len(),
            pipe::split(&self.data_stream_name).len(),
            pipe::split(&self.data_stream_value).len(),
            pipe::split(&self.data_stream_phenomenon_time).len(),
        ];
        if lens.iter().any(|l| *l != self.data_stream_count) {
            return Err(SyncError::Validation(format!("datastream columns are misaligned: {:?}", lens)));
        }
        Ok(self.data_stream_count)
    }

    /// Replaces value and phenomenonTime of datastream `id` at its position.
    /// Returns the position, or `None` if `id` is not part of the summary.
    pub fn replace_observation(&mut self, id: &str, value: &str, phenomenon_time: &str) -> SyncResult<Option<usize>> {
        self.checked_len()?;
        let Some(index) = pipe::position(&self.data_stream_id, id).filter(|_| !self.is_empty()) else {
            return Ok(None);
        };
        let misaligned = || SyncError::Validation(format!("datastream {} has no slot {}", id, index));
        let id_col = pipe::replace_at(&self.data_stream_id, index, id).ok_or_else(misaligned)?;
        let name = pipe::split(&self.data_stream_name)[index].to_string();
        let name_col = pipe::replace_at(&self.data_stream_name, index, &name).ok_or_else(misaligned)?;
        let value_col = pipe::replace_at(&self.data_stream_value, index, value).ok_or_else(misaligned)?;
        let time_col =
            pipe::replace_at(&self.data_stream_phenomenon_time, index, phenomenon_time).ok_or_else(misaligned)?;

        self.data_stream_id = id_col;
        self.data_stream_name = name_col;
        self.data_stream_value = value_col;
        self.data_stream_phenomenon_time = time_col;
        Ok(Some(index))
    }
}

/// Flattened per-datastream field name: `dataStream_<id>_<name>`.
pub fn datastream_key(id: &str, name: &str) -> String {
    format!("dataStream_{}_{}", id, name)
}

/// The `_phenomenonTime` sibling of [`datastream_key`].
pub fn datastream_time_key(id: &str, name: &str) -> String {
    format!("{}_phenomenonTime", datastream_key(id, name))
}

/// One logical Thing with its display-ready datastream columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedRecord {
    pub id: String,
    /// GeoJSON of the Thing's first location (from the first fragment).
    pub location: Option<Value>,
    pub summary: DatastreamSummary,
    /// `dataStream_<id>_<name>` and `dataStream_<id>_<name>_phenomenonTime`.
    pub datastream_fields: BTreeMap<String, String>,
    /// Scalar Thing properties plus `requestUrl` / `requestVersion`.
    pub properties: BTreeMap<String, String>,
    /// The unified raw Thing, updated in place by live observations.
    pub thing: Thing,
}

impl AggregatedRecord {
    /// Applies a live observation of datastream `id`: replaces the raw
    /// latest observation, the summary slot and the flattened fields.
    ///
    /// Returns `false` if the record does not own datastream `id`.
    pub fn apply_observation(
        &mut self,
        id: &str,
        observation: Observation,
        display_value: &str,
        display_time: &str,
    ) -> SyncResult<bool> {
        let Some(index) = self.summary.replace_observation(id, display_value, display_time)? else {
            return Ok(false);
        };

        let mut name = pipe::split(&self.summary.data_stream_name)
            .get(index)
            .map(|s| s.to_string())
            .unwrap_or_default();
        if let Some(ds) = self.thing.datastreams.iter_mut().find(|ds| ds.id_key() == id) {
            if let Some(raw_name) = &ds.name {
                name = raw_name.clone();
            }
            match ds.observations.first_mut() {
                Some(latest) => *latest = observation,
                None => ds.observations.push(observation),
            }
        }

        self.datastream_fields.insert(datastream_key(id, &name), display_value.to_string());
        self.datastream_fields.insert(datastream_time_key(id, &name), display_time.to_string());
        Ok(true)
    }
}
