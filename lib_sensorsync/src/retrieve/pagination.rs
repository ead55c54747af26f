//! # Pagination Walker
//!
//! SensorThings servers truncate large collections and hand out a
//! continuation link (`@iot.nextLink`) for the rest. Expanded collections
//! nested inside an entity carry their own marker
//! (`Datastreams@iot.nextLink`, `Observations@iot.nextLink`, ...) at any
//! depth. The walker follows all of them:
//!
//! 1. Fetch a page and append it to its destination container: the elements
//!    of `value` for envelopes, the whole object otherwise.
//! 2. Scan the appended data for continuation markers in one recursive pass.
//!    Each marker is queued together with the container it continues, then
//!    removed from the data. Navigation metadata is stripped in the same pass
//!    when requested.
//! 3. Pop the next queued link that passes the depth/size barrier and repeat.
//!
//! Destinations are addressed by paths into the result tree. The tree only
//! ever grows by appending, so a path recorded early stays valid for the
//! whole walk. Only one request is in flight at any time, which makes the
//! result order equal to the link-following order.

use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::ky_http::HttpGet;
use crate::errors::{SyncError, SyncResult};

const NEXT_LINK_SUFFIX: &str = "@iot.nextLink";
const SELF_LINK_KEY: &str = "@iot.selfLink";
const NAVIGATION_LINK_SUFFIX: &str = "@iot.navigationLink";

/// One step of a path from the root result list into a nested container.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Index(usize),
    Key(String),
}

/// A continuation link waiting to be followed, and the container its page
/// must be appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Continuation {
    link: String,
    destination: Vec<Segment>,
}

/// Life-cycle callbacks of a bulk fetch.
///
/// `on_start` fires before the first request. Exactly one of `on_success`
/// and `on_error` follows, then always `on_complete`.
pub trait FetchHooks {
    /// Called once before the first request is issued.
    fn on_start(&mut self, _url: &str) {}

    /// Receives the complete, flattened result list.
    fn on_success(&mut self, entities: Vec<Value>);

    /// Receives the failure and every entity appended before it. The partial
    /// list is valid but known to be incomplete.
    fn on_error(&mut self, error: SyncError, partial: Vec<Value>) {
        log::warn!("bulk fetch failed after {} entities: {}", partial.len(), error);
    }

    /// Called last, on success and on failure.
    fn on_complete(&mut self) {}
}

/// Follows every continuation link of a SensorThings bulk query.
#[derive(Clone)]
pub struct PaginationWalker {
    client: Arc<dyn HttpGet>,
    strip_navigation: bool,
}

impl PaginationWalker {
    /// Creates a walker that keeps navigation metadata in the results.
    pub fn new(client: Arc<dyn HttpGet>) -> Self {
        Self { client, strip_navigation: false }
    }

    /// Also delete `@iot.selfLink` and `*@iot.navigationLink` keys at every depth.
    pub fn strip_navigation(mut self, strip: bool) -> Self {
        self.strip_navigation = strip;
        self
    }

    /// Walks `url` and returns all entities, or the first error.
    pub async fn fetch_all(&self, url: &str) -> SyncResult<Vec<Value>> {
        let mut entities = Vec::new();
        self.fetch_into(url, &mut entities).await?;
        Ok(entities)
    }

    /// Walks `url` and reports through `hooks`.
    pub async fn fetch_all_with<H: FetchHooks + ?Sized>(&self, url: &str, hooks: &mut H) {
        hooks.on_start(url);
        let mut entities = Vec::new();
        match self.fetch_into(url, &mut entities).await {
            Ok(()) => hooks.on_success(entities),
            Err(e) => hooks.on_error(e, entities),
        }
        hooks.on_complete();
    }

    /// Walks `url` appending into `destination`. On error, everything
    /// appended so far stays in `destination`.
    pub async fn fetch_into(&self, url: &str, destination: &mut Vec<Value>) -> SyncResult<()> {
        let mut queue: VecDeque<Continuation> = VecDeque::new();
        let mut current = Continuation { link: url.to_string(), destination: Vec::new() };
        let mut pages = 0usize;

        loop {
            log::debug!("fetching page {}: {}", pages + 1, current.link);
            let response = self.client.get_json(&current.link).await?;
            pages += 1;
            self.append_page(destination, &current.destination, response, &mut queue)?;

            match next_followable(&mut queue) {
                Some(next) => current = next,
                None => {
                    log::debug!("walk of {} finished after {} pages", url, pages);
                    return Ok(());
                }
            }
        }
    }

    fn append_page(
        &self,
        root: &mut Vec<Value>,
        path: &[Segment],
        response: Value,
        queue: &mut VecDeque<Continuation>,
    ) -> SyncResult<()> {
        let mut envelope = match response {
            Value::Object(map) => map,
            Value::Array(_) => {
                return Err(SyncError::Protocol("response is an array, expected an object".to_string()));
            }
            other => {
                return Err(SyncError::Protocol(format!("response is not a JSON object: {}", other)));
            }
        };

        let items = if matches!(envelope.get("value"), Some(Value::Array(_))) {
            if let Some(Value::String(link)) = envelope.remove(NEXT_LINK_SUFFIX) {
                queue.push_back(Continuation { link, destination: path.to_vec() });
            }
            match envelope.remove("value") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            }
        } else {
            vec![Value::Object(envelope)]
        };

        let container = resolve_mut(root, path).ok_or_else(|| {
            SyncError::Protocol(format!("continuation destination {:?} is not a collection", path))
        })?;
        let base = container.len();
        container.extend(items);

        let appended = container.len() - base;
        for offset in 0..appended {
            let mut item_path = path.to_vec();
            item_path.push(Segment::Index(base + offset));
            let container = resolve_mut(root, path).ok_or_else(|| {
                SyncError::Protocol(format!("continuation destination {:?} vanished", path))
            })?;
            scan(&mut container[base + offset], &item_path, queue, self.strip_navigation);
        }
        Ok(())
    }
}

/// Pops queued links until one passes the depth/size barrier.
fn next_followable(queue: &mut VecDeque<Continuation>) -> Option<Continuation> {
    while let Some(candidate) = queue.pop_front() {
        if is_exhausted(&candidate.link) {
            log::debug!("discarding exhausted continuation link {}", candidate.link);
            continue;
        }
        return Some(candidate);
    }
    None
}

/// A link whose page size (`top`) does not exceed its offset (`skip`) would
/// only re-read data the server already delivered.
fn is_exhausted(link: &str) -> bool {
    match (query_number(link, "top"), query_number(link, "skip")) {
        (Some(top), skip) => top <= skip.unwrap_or(0),
        (None, _) => false,
    }
}

/// Reads `name` (with or without the OData `$` prefix) from the query of `link`.
fn query_number(link: &str, name: &str) -> Option<u64> {
    let query = link.split_once('?')?.1;
    let query = query.split('#').next().unwrap_or(query);
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k.trim_start_matches('$') == name)
        .and_then(|(_, v)| v.trim().parse::<u64>().ok())
}

/// Records and removes continuation markers below `value`, whose own path is `path`.
fn scan(value: &mut Value, path: &[Segment], queue: &mut VecDeque<Continuation>, strip: bool) {
    match value {
        Value::Object(map) => {
            take_markers(map, path, queue);
            if strip {
                map.retain(|k, _| k != SELF_LINK_KEY && !k.ends_with(NAVIGATION_LINK_SUFFIX));
            }
            for (key, child) in map.iter_mut() {
                let mut child_path = path.to_vec();
                child_path.push(Segment::Key(key.clone()));
                scan(child, &child_path, queue, strip);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                let mut child_path = path.to_vec();
                child_path.push(Segment::Index(i));
                scan(child, &child_path, queue, strip);
            }
        }
        _ => {}
    }
}

fn take_markers(map: &mut Map<String, Value>, path: &[Segment], queue: &mut VecDeque<Continuation>) {
    let markers: Vec<String> = map.keys().filter(|k| k.ends_with(NEXT_LINK_SUFFIX)).cloned().collect();

    for marker in markers {
        let Some(link) = map.remove(&marker) else { continue };
        let Value::String(link) = link else {
            log::warn!("ignoring non-string continuation marker {}", marker);
            continue;
        };
        let property = &marker[..marker.len() - NEXT_LINK_SUFFIX.len()];

        let destination = if property.is_empty() {
            // A bare marker continues the collection holding this object.
            match path.split_last() {
                Some((Segment::Index(_), parent)) => parent.to_vec(),
                _ => path.to_vec(),
            }
        } else {
            map.entry(property.to_string()).or_insert_with(|| Value::Array(Vec::new()));
            let mut dest = path.to_vec();
            dest.push(Segment::Key(property.to_string()));
            dest
        };
        queue.push_back(Continuation { link, destination });
    }
}

/// Resolves `path` to the array it addresses inside the result tree.
fn resolve_mut<'a>(root: &'a mut Vec<Value>, path: &[Segment]) -> Option<&'a mut Vec<Value>> {
    let Some((first, rest)) = path.split_first() else {
        return Some(root);
    };
    let Segment::Index(i) = first else { return None };
    let mut node = root.get_mut(*i)?;
    for segment in rest {
        node = match segment {
            Segment::Index(i) => node.as_array_mut()?.get_mut(*i)?,
            Segment::Key(k) => node.as_object_mut()?.get_mut(k)?,
        };
    }
    node.as_array_mut()
}
