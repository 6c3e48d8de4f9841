use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::types::{Checkpoint, Entity, Properties, TemporalEdge, Timestamp, Version};

pub(crate) mod cypher;
pub mod neo4j;

pub use neo4j::Neo4jStore;

/// One parameterized query against the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub text: String,
    pub params: serde_json::Map<String, Value>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: serde_json::Map::new(),
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// A single result row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// The narrow capability this engine requires from the underlying graph
/// store: run one query, run a list of queries atomically, close.
///
/// Implementations must make `run_batch` all-or-nothing; every multi-statement
/// group issued by the engine (close-then-open edge transitions, checkpoint
/// creation, imports) relies on that.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn run(&self, statement: Statement) -> Result<Vec<Row>>;

    async fn run_batch(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>>;

    async fn close(&self) -> Result<()>;
}

fn missing(column: &str) -> Error {
    Error::store_msg("decode row", format!("missing column `{}`", column))
}

fn mistyped(column: &str, value: &Value) -> Error {
    Error::store_msg(
        "decode row",
        format!("unexpected value for column `{}`: {}", column, value),
    )
}

pub(crate) fn row_str(row: &Row, column: &str) -> Result<String> {
    match row.get(column) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(mistyped(column, other)),
        None => Err(missing(column)),
    }
}

pub(crate) fn row_opt_str(row: &Row, column: &str) -> Result<Option<String>> {
    match row.get(column) {
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(mistyped(column, other)),
    }
}

pub(crate) fn row_i64(row: &Row, column: &str) -> Result<i64> {
    match row.get(column) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| mistyped(column, &Value::Number(n.clone()))),
        Some(other) => Err(mistyped(column, other)),
        None => Err(missing(column)),
    }
}

pub(crate) fn row_u64(row: &Row, column: &str) -> Result<u64> {
    let n = row_i64(row, column)?;
    u64::try_from(n)
        .map_err(|_| Error::store_msg("decode row", format!("negative count in column `{}`", column)))
}

/// Aggregates such as `avg` come back null over an empty match.
pub(crate) fn row_opt_f64(row: &Row, column: &str) -> Result<Option<f64>> {
    match row.get(column) {
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(mistyped(column, other)),
    }
}

pub(crate) fn row_opt_millis(row: &Row, column: &str) -> Result<Option<Timestamp>> {
    match row.get(column) {
        Some(Value::Number(n)) => match n.as_i64() {
            Some(ms) => Ok(Some(Timestamp::from_millis(ms))),
            None => Err(mistyped(column, &Value::Number(n.clone()))),
        },
        Some(Value::Null) | None => Ok(None),
        Some(other) => Err(mistyped(column, other)),
    }
}

pub(crate) fn row_value<'a>(row: &'a Row, column: &str) -> Result<&'a Value> {
    row.get(column).ok_or_else(|| missing(column))
}

pub(crate) fn row_array<'a>(row: &'a Row, column: &str) -> Result<&'a Vec<Value>> {
    match row.get(column) {
        Some(Value::Array(items)) => Ok(items),
        Some(other) => Err(mistyped(column, other)),
        None => Err(missing(column)),
    }
}

fn take_opt_str(map: &mut serde_json::Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

fn take_opt_millis(map: &mut serde_json::Map<String, Value>, key: &str) -> Option<Timestamp> {
    match map.remove(key) {
        Some(Value::Number(n)) => n.as_i64().map(Timestamp::from_millis),
        _ => None,
    }
}

/// Decode an `e {.*}` entity projection: `id` and `entity_type` are lifted
/// out, everything else is the property bag.
pub(crate) fn entity_from_value(value: &Value) -> Result<Entity> {
    let mut map = match value {
        Value::Object(map) => map.clone(),
        other => return Err(mistyped("entity", other)),
    };
    let id = take_opt_str(&mut map, "id")
        .ok_or_else(|| Error::store_msg("decode row", "entity projection without `id`"))?;
    let entity_type = take_opt_str(&mut map, "entity_type").unwrap_or_default();
    Ok(Entity {
        id,
        entity_type,
        properties: Properties(map),
    })
}

/// Decode a relationship projection carrying `relationship`, `from_id`,
/// `to_id` and the temporal fields alongside the caller's property bag.
pub(crate) fn edge_from_value(value: &Value) -> Result<TemporalEdge> {
    let mut map = match value {
        Value::Object(map) => map.clone(),
        other => return Err(mistyped("relationship", other)),
    };
    let relationship = take_opt_str(&mut map, "relationship")
        .ok_or_else(|| Error::store_msg("decode row", "relationship projection without type"))?;
    let from_id = take_opt_str(&mut map, "from_id")
        .ok_or_else(|| Error::store_msg("decode row", "relationship projection without `from_id`"))?;
    let to_id = take_opt_str(&mut map, "to_id")
        .ok_or_else(|| Error::store_msg("decode row", "relationship projection without `to_id`"))?;
    let valid_from = take_opt_millis(&mut map, "valid_from");
    let valid_to = take_opt_millis(&mut map, "valid_to");
    let change_set_id = take_opt_str(&mut map, "change_set_id");
    Ok(TemporalEdge {
        relationship,
        from_id,
        to_id,
        valid_from,
        valid_to,
        change_set_id,
        properties: Properties(map),
    })
}

/// Decode a `v {.*}` version projection.
pub(crate) fn version_from_value(value: &Value) -> Result<Version> {
    let mut map = match value {
        Value::Object(map) => map.clone(),
        other => return Err(mistyped("version", other)),
    };
    let id = take_opt_str(&mut map, "id")
        .ok_or_else(|| Error::store_msg("decode row", "version projection without `id`"))?;
    let entity_id = take_opt_str(&mut map, "entity_id")
        .ok_or_else(|| Error::store_msg("decode row", "version projection without `entity_id`"))?;
    let hash = take_opt_str(&mut map, "hash").unwrap_or_default();
    let timestamp = take_opt_millis(&mut map, "timestamp")
        .ok_or_else(|| Error::store_msg("decode row", "version projection without `timestamp`"))?;
    Ok(Version {
        id,
        entity_id,
        hash,
        timestamp,
        change_set_id: take_opt_str(&mut map, "change_set_id"),
        path: take_opt_str(&mut map, "path"),
        language: take_opt_str(&mut map, "language"),
    })
}

/// Decode a `c {.*}` checkpoint projection. Metadata travels as a JSON
/// string property and is parsed back here.
pub(crate) fn checkpoint_from_value(value: &Value) -> Result<Checkpoint> {
    let mut map = match value {
        Value::Object(map) => map.clone(),
        other => return Err(mistyped("checkpoint", other)),
    };
    let id = take_opt_str(&mut map, "id")
        .ok_or_else(|| Error::store_msg("decode row", "checkpoint projection without `id`"))?;
    let timestamp = take_opt_millis(&mut map, "timestamp")
        .ok_or_else(|| Error::store_msg("decode row", "checkpoint projection without `timestamp`"))?;
    let reason = take_opt_str(&mut map, "reason").unwrap_or_default();
    let seed_entities = match map.remove("seed_entities") {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    let metadata = match take_opt_str(&mut map, "metadata") {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    let imported = matches!(map.remove("imported"), Some(Value::Bool(true)));
    Ok(Checkpoint {
        id,
        timestamp,
        reason,
        seed_entities,
        metadata,
        imported,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_statement_params() {
        let stmt = Statement::new("MATCH (n) RETURN n")
            .param("id", "a")
            .param("limit", 10);
        assert_eq!(stmt.params["id"], json!("a"));
        assert_eq!(stmt.params["limit"], json!(10));
    }

    #[test]
    fn test_row_accessors() {
        let row = row(json!({"id": "a", "n": 3, "maybe": null}));
        assert_eq!(row_str(&row, "id").unwrap(), "a");
        assert_eq!(row_i64(&row, "n").unwrap(), 3);
        assert_eq!(row_opt_str(&row, "maybe").unwrap(), None);
        assert_eq!(row_opt_str(&row, "absent").unwrap(), None);
        assert!(row_str(&row, "absent").is_err());
        assert!(row_i64(&row, "id").is_err());
    }

    #[test]
    fn test_row_opt_f64_null_aggregate() {
        let row = row(json!({"avg": null}));
        assert_eq!(row_opt_f64(&row, "avg").unwrap(), None);
    }

    #[test]
    fn test_entity_from_value_splits_property_bag() {
        let entity = entity_from_value(&json!({
            "id": "mod-core",
            "entity_type": "Module",
            "name": "core",
            "loc": 1200,
        }))
        .unwrap();
        assert_eq!(entity.id, "mod-core");
        assert_eq!(entity.entity_type, "Module");
        assert_eq!(entity.properties.get("name"), Some(&json!("core")));
        assert!(entity.properties.get("id").is_none());
    }

    #[test]
    fn test_edge_from_value() {
        let edge = edge_from_value(&json!({
            "relationship": "DEPENDS_ON",
            "from_id": "a",
            "to_id": "b",
            "valid_from": 1000,
            "valid_to": null,
            "change_set_id": "cs-1",
            "weight": 0.5,
        }))
        .unwrap();
        assert_eq!(edge.relationship, "DEPENDS_ON");
        assert!(edge.is_open());
        assert_eq!(edge.valid_from.unwrap().to_millis(), 1000);
        assert_eq!(edge.change_set_id.as_deref(), Some("cs-1"));
        assert_eq!(edge.properties.get("weight"), Some(&json!(0.5)));
    }

    #[test]
    fn test_checkpoint_from_value_parses_metadata() {
        let checkpoint = checkpoint_from_value(&json!({
            "id": "cp-1",
            "timestamp": 5000,
            "reason": "release",
            "seed_entities": ["a", "b"],
            "metadata": "{\"release\":\"1.0\"}",
            "imported": true,
        }))
        .unwrap();
        assert_eq!(checkpoint.seed_entities, vec!["a", "b"]);
        assert_eq!(checkpoint.metadata, Some(json!({"release": "1.0"})));
        assert!(checkpoint.imported);
    }

    #[test]
    fn test_version_from_value_requires_timestamp() {
        let err = version_from_value(&json!({"id": "v1", "entity_id": "e1"}));
        assert!(err.is_err());
    }
}
