//! Path and document id codec.
//!
//! Every logical key (`<prefix><type>/<id>`) travels as a single path
//! segment, so the slashes inside it are percent-encoded. Store names are
//! encoded the same way.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{Map, Value};

use couchsync_common::{RemoteObject, Revisions};

/// Characters left untouched by `encodeURIComponent`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Document members managed by the codec rather than stored as attributes.
const RESERVED: &[&str] = &["_id", "_rev", "_revisions", "_deleted", "type", "id"];

/// Percent-encode a single path component.
pub fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Logical document key: `<prefix><type>/<id>`.
pub fn wire_id(prefix: &str, object_type: &str, id: &str) -> String {
    format!("{}{}/{}", prefix, object_type, id)
}

/// Build a request path.
///
/// The logical key is `prefix + type + "/" + id`, with type and id segments
/// present only when given. The key is encoded as one component and placed
/// after the store root, followed by `extra` verbatim. The root is
/// `/<encoded store name>`, or `base_url` when set.
pub fn build_path(
    store_name: &str,
    base_url: Option<&str>,
    prefix: &str,
    object_type: Option<&str>,
    id: Option<&str>,
    extra: &str,
) -> String {
    let mut key = prefix.to_string();
    if let Some(object_type) = object_type {
        key.push_str(object_type);
    }
    if let Some(id) = id {
        key.push('/');
        key.push_str(id);
    }

    let mut path = match base_url {
        Some(base) => base.to_string(),
        None => format!("/{}", encode_component(store_name)),
    };
    if !key.is_empty() {
        path.push('/');
        path.push_str(&encode_component(&key));
    }
    path.push_str(extra);
    path
}

/// Relative `_all_docs` query, optionally restricted to a prefix and type.
///
/// The upper bound replaces the trailing `/` of the key range by `0`, its
/// ASCII successor, which makes it exclusive under default collation.
pub fn all_docs_query(prefix: &str, object_type: Option<&str>) -> String {
    let base = match object_type {
        Some(object_type) => format!("{}{}", prefix, object_type),
        None if prefix.is_empty() => return "_all_docs?include_docs=true".to_string(),
        None => prefix.strip_suffix('/').unwrap_or(prefix).to_string(),
    };
    let lower = format!("{}/", base);
    let upper = format!("{}0", base);
    format!(
        "_all_docs?include_docs=true&startkey=\"{}\"&endkey=\"{}\"",
        encode_component(&lower),
        encode_component(&upper)
    )
}

/// Relative `_changes` query since the given checkpoint.
///
/// With a heartbeat the request becomes a long-poll.
pub fn changes_query(since: u64, heartbeat_ms: Option<u64>) -> String {
    let mut query = format!("_changes?include_docs=true&since={}", since);
    if let Some(heartbeat) = heartbeat_ms {
        query.push_str(&format!("&heartbeat={}&feed=longpoll", heartbeat));
    }
    query
}

/// Split a wire id into `(type, id)`.
///
/// Returns `None` unless the id starts with `prefix` and the remainder
/// contains a `/`.
pub fn decode_id(wire_id: &str, prefix: &str) -> Option<(String, String)> {
    let rest = wire_id.strip_prefix(prefix)?;
    let (object_type, id) = rest.split_once('/')?;
    Some((object_type.to_string(), id.to_string()))
}

/// Local bookkeeping members that never reach the server.
fn is_local_bookkeeping(key: &str) -> bool {
    key == "_localInfo" || key.starts_with("_$")
}

/// Encode an object as a CouchDB document.
pub fn to_document(object: &RemoteObject, prefix: &str) -> Map<String, Value> {
    let mut doc = Map::new();
    for (key, value) in &object.attributes {
        if RESERVED.contains(&key.as_str()) || is_local_bookkeeping(key) {
            continue;
        }
        doc.insert(key.clone(), value.clone());
    }

    doc.insert(
        "_id".to_string(),
        Value::String(wire_id(prefix, &object.object_type, &object.id)),
    );
    doc.insert(
        "type".to_string(),
        Value::String(object.object_type.clone()),
    );
    if let Some(rev) = &object.rev {
        doc.insert("_rev".to_string(), Value::String(rev.clone()));
    }
    if let Some(revisions) = &object.revisions {
        doc.insert(
            "_revisions".to_string(),
            serde_json::json!({ "start": revisions.start, "ids": revisions.ids }),
        );
    }
    if object.deleted {
        doc.insert("_deleted".to_string(), Value::Bool(true));
    }
    doc
}

/// Decode a CouchDB document into an object.
///
/// Returns `None` for documents outside `prefix` or without a typed id.
pub fn from_document(doc: &Map<String, Value>, prefix: &str) -> Option<RemoteObject> {
    let wire = doc.get("_id")?.as_str()?;
    let (object_type, id) = decode_id(wire, prefix)?;

    let rev = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
    let revisions = doc
        .get("_revisions")
        .and_then(|value| serde_json::from_value::<Revisions>(value.clone()).ok());
    let deleted = doc
        .get("_deleted")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let local_only = rev.as_deref().is_some_and(|r| r.ends_with("-local"));

    let attributes = doc
        .iter()
        .filter(|(key, _)| !RESERVED.contains(&key.as_str()) && !is_local_bookkeeping(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Some(RemoteObject {
        object_type,
        id,
        rev,
        revisions,
        deleted,
        local_only,
        attributes,
    })
}
