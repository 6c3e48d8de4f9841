use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::store::{cypher, row_value, version_from_value, GraphStore};
use crate::types::{Entity, TemporalRange, Timestamp, Version, VersionOptions};

/// Appends immutable version facts for entity mutations.
///
/// Version recording is deliberately decoupled from entity existence: the
/// entity stub is merged alongside the version node, so history survives
/// out-of-order writes from the services that own entities.
pub struct VersionManager {
    store: Arc<dyn GraphStore>,
}

impl VersionManager {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self { store }
    }

    /// Record one content fact for `entity`, returning the version id.
    pub async fn append_version(
        &self,
        entity: &Entity,
        options: VersionOptions,
    ) -> Result<String> {
        let version = Version {
            id: Uuid::new_v4().to_string(),
            entity_id: entity.id.clone(),
            hash: content_hash(entity)?,
            timestamp: options.timestamp.unwrap_or_else(Timestamp::now),
            change_set_id: options.change_set_id,
            path: options.path,
            language: options.language,
        };

        self.store
            .run_batch(cypher::append_version(&version))
            .await?;

        debug!(version_id = %version.id, entity_id = %entity.id, "appended version");
        Ok(version.id)
    }

    /// Version facts for one entity, oldest first, bounded by the window.
    pub async fn entity_timeline(
        &self,
        entity_id: &str,
        window: &TemporalRange,
        limit: usize,
    ) -> Result<Vec<Version>> {
        let rows = self
            .store
            .run(cypher::entity_timeline(entity_id, window, limit))
            .await?;
        rows.iter()
            .map(|row| version_from_value(row_value(row, "version")?))
            .collect()
    }
}

/// Content fingerprint over the entity's identity and property bag. Keys are
/// canonicalized so hash equality means content equality.
fn content_hash(entity: &Entity) -> Result<String> {
    let properties: BTreeMap<&String, &Value> = entity.properties.0.iter().collect();
    let canonical = serde_json::to_string(&(&entity.id, &entity.entity_type, properties))?;
    Ok(format!("{:x}", md5::compute(canonical.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockGraphStore;
    use serde_json::json;

    fn entity() -> Entity {
        let mut e = Entity::new("mod-core", "Module");
        e.properties.insert("name", json!("core"));
        e.properties.insert("loc", json!(1200));
        e
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash(&entity()).unwrap();
        let b = content_hash(&entity()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_content_hash_ignores_property_order() {
        let mut reordered = Entity::new("mod-core", "Module");
        reordered.properties.insert("loc", json!(1200));
        reordered.properties.insert("name", json!("core"));
        assert_eq!(
            content_hash(&entity()).unwrap(),
            content_hash(&reordered).unwrap()
        );
    }

    #[test]
    fn test_content_hash_tracks_content() {
        let mut changed = entity();
        changed.properties.insert("loc", json!(1300));
        assert_ne!(
            content_hash(&entity()).unwrap(),
            content_hash(&changed).unwrap()
        );
    }

    #[tokio::test]
    async fn test_append_version_runs_one_batch() {
        let mut store = MockGraphStore::new();
        store
            .expect_run_batch()
            .withf(|statements| {
                statements.len() == 2
                    && statements[0].text.contains("MERGE (e:Entity")
                    && statements[1].text.contains("CREATE (v:Version")
            })
            .times(1)
            .returning(|statements| Ok(vec![Vec::new(); statements.len()]));

        let manager = VersionManager::new(Arc::new(store));
        let id = manager
            .append_version(&entity(), VersionOptions::default())
            .await
            .unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[tokio::test]
    async fn test_entity_timeline_decodes_rows() {
        let mut store = MockGraphStore::new();
        store.expect_run().times(1).returning(|_| {
            let row = match json!({"version": {
                "id": "v-1",
                "entity_id": "mod-core",
                "hash": "abc",
                "timestamp": 1_000,
            }}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            };
            Ok(vec![row])
        });

        let manager = VersionManager::new(Arc::new(store));
        let versions = manager
            .entity_timeline("mod-core", &TemporalRange::unbounded(), 100)
            .await
            .unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].entity_id, "mod-core");
        assert_eq!(versions[0].timestamp.to_millis(), 1_000);
    }
}
