//! The canonical schema JSON writer.
//!
//! Schema blobs are serialized pretty-printed with two-space indent and a
//! stable textual prefix: the output always begins with the literal
//! `{"camliVersion": <n>,\n` followed by the remaining keys in sorted
//! order. The prefix is part of the wire contract and is tested
//! bit-exactly.

use serde_json::Map;
use serde_json::Value;

use larch_core::Error;
use larch_core::Result;

use crate::model::Schema;

/// Serialize an arbitrary schema map to canonical camli JSON.
///
/// Fails with `Malformed` if the map has no `camliVersion` key.
pub fn map_to_camli_json(map: &Map<String, Value>) -> Result<String> {
    let version = map
        .get("camliVersion")
        .ok_or_else(|| Error::malformed("no camliVersion key in map"))?;
    let version = serde_json::to_string(version)?;

    let mut rest = map.clone();
    rest.remove("camliVersion");
    if rest.is_empty() {
        return Ok(format!("{{\"camliVersion\": {version}\n}}"));
    }

    // Pretty-print the remainder, then splice our fixed first line in
    // front of its body (dropping the opening "{\n").
    let body = serde_json::to_string_pretty(&Value::Object(rest))?;
    Ok(format!("{{\"camliVersion\": {version},\n{}", &body[2..]))
}

/// Serialize a typed schema to canonical camli JSON.
pub fn to_camli_json(schema: &Schema) -> Result<String> {
    match serde_json::to_value(schema)? {
        Value::Object(map) => map_to_camli_json(&map),
        _ => Err(Error::malformed("schema did not serialize to a JSON object")),
    }
}
