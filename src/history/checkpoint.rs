use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::{
    checkpoint_from_value, cypher, edge_from_value, entity_from_value, row_str, row_u64,
    row_value, GraphStore, Row, Statement,
};
use crate::types::{
    validate_relationship_type, Checkpoint, CheckpointCreated, CheckpointExport,
    CheckpointFilter, CheckpointOptions, CheckpointPage, CheckpointSummary, Entity,
    ImportOptions, SubgraphStats, TemporalEdge, Timestamp,
};

/// Creates, reads, exports, imports and deletes checkpoints: named immutable
/// snapshots of the subgraph reachable from a set of seed entities.
pub struct CheckpointService {
    store: Arc<dyn GraphStore>,
    default_hops: u32,
    default_page_limit: usize,
}

impl CheckpointService {
    pub fn new(store: Arc<dyn GraphStore>, default_hops: u32, default_page_limit: usize) -> Self {
        Self {
            store,
            default_hops,
            default_page_limit,
        }
    }

    /// Expand from the seeds and persist the snapshot. Membership is the
    /// discovered neighborhood including the seeds themselves; seed ids with
    /// no entity behind them simply contribute nothing.
    pub async fn create_checkpoint(
        &self,
        seed_entities: &[String],
        options: CheckpointOptions,
    ) -> Result<CheckpointCreated> {
        let hops = options.hops.unwrap_or(self.default_hops).max(1);
        let rows = self
            .store
            .run(cypher::checkpoint_members_expansion(
                seed_entities,
                hops,
                &options.window,
            ))
            .await?;
        let member_ids = rows
            .iter()
            .map(|row| row_str(row, "id"))
            .collect::<Result<Vec<_>>>()?;

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            timestamp: Timestamp::now(),
            reason: options.reason,
            seed_entities: seed_entities.to_vec(),
            metadata: options.metadata,
            imported: false,
        };

        self.store
            .run_batch(cypher::create_checkpoint(&checkpoint, &member_ids))
            .await?;

        info!(
            checkpoint_id = %checkpoint.id,
            members = member_ids.len(),
            "created checkpoint"
        );
        Ok(CheckpointCreated {
            checkpoint_id: checkpoint.id,
            member_count: member_ids.len(),
        })
    }

    /// One page of checkpoints, newest first. `total` is the filtered count
    /// before pagination, computed in the same transaction as the page.
    pub async fn list_checkpoints(&self, filter: CheckpointFilter) -> Result<CheckpointPage> {
        let limit = filter.limit.unwrap_or(self.default_page_limit);
        let groups = self
            .store
            .run_batch(vec![
                cypher::count_checkpoints(&filter),
                cypher::list_checkpoints(&filter, limit),
            ])
            .await?;

        let total = match groups.first().and_then(|rows| rows.first()) {
            Some(row) => row_u64(row, "total")?,
            None => 0,
        };
        let items = groups
            .get(1)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|row| checkpoint_from_value(row_value(row, "checkpoint")?))
            .collect::<Result<Vec<_>>>()?;

        Ok(CheckpointPage { items, total })
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        let rows = self.store.run(cypher::get_checkpoint(id)).await?;
        match rows.first() {
            Some(row) => Ok(Some(checkpoint_from_value(row_value(row, "checkpoint")?)?)),
            None => Ok(None),
        }
    }

    pub async fn get_members(&self, id: &str) -> Result<Vec<Entity>> {
        let rows = self.store.run(cypher::checkpoint_members(id)).await?;
        rows.iter()
            .map(|row| entity_from_value(row_value(row, "entity")?))
            .collect()
    }

    /// Checkpoint, members, and aggregate composition of the membership
    /// subgraph. `None` when the checkpoint does not exist.
    pub async fn get_summary(&self, id: &str) -> Result<Option<CheckpointSummary>> {
        let checkpoint = match self.get_checkpoint(id).await? {
            Some(checkpoint) => checkpoint,
            None => return Ok(None),
        };
        let (members, rel_rows) = futures::try_join!(
            self.get_members(id),
            self.store.run(cypher::checkpoint_relationship_stats(id)),
        )?;
        let stats = subgraph_stats(&members, &rel_rows)?;
        Ok(Some(CheckpointSummary {
            checkpoint,
            members,
            stats,
        }))
    }

    /// Closed-subgraph export: the full membership plus every relationship
    /// whose endpoints are both members.
    pub async fn export_checkpoint(&self, id: &str) -> Result<Option<CheckpointExport>> {
        let checkpoint = match self.get_checkpoint(id).await? {
            Some(checkpoint) => checkpoint,
            None => return Ok(None),
        };
        let (entities, rows) = futures::try_join!(
            self.get_members(id),
            self.store.run(cypher::checkpoint_internal_edges(id)),
        )?;
        let relationships = rows
            .iter()
            .map(|row| edge_from_value(row_value(row, "relationship")?))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(CheckpointExport {
            checkpoint,
            entities,
            relationships,
        }))
    }

    /// Merge an exported subgraph back in. Entities and relationships are
    /// upserted (repeated identical imports converge), the checkpoint node is
    /// created fresh unless the caller asks to keep the original id, and it
    /// is always marked imported.
    pub async fn import_checkpoint(
        &self,
        export: &CheckpointExport,
        options: ImportOptions,
    ) -> Result<String> {
        let known: HashSet<&str> = export.entities.iter().map(|e| e.id.as_str()).collect();
        let mut open_identities = HashSet::new();
        for edge in &export.relationships {
            validate_relationship_type(&edge.relationship)?;
            if !known.contains(edge.from_id.as_str()) || !known.contains(edge.to_id.as_str()) {
                return Err(Error::NotFound(format!(
                    "import relationship endpoint missing from entities: {}",
                    edge.identity()
                )));
            }
            if edge.is_open() && !open_identities.insert(edge.identity()) {
                return Err(Error::ConsistencyViolation(format!(
                    "import payload carries more than one open interval for {}",
                    edge.identity()
                )));
            }
        }

        let checkpoint = Checkpoint {
            id: if options.use_original_id {
                export.checkpoint.id.clone()
            } else {
                Uuid::new_v4().to_string()
            },
            timestamp: export.checkpoint.timestamp,
            reason: export.checkpoint.reason.clone(),
            seed_entities: export.checkpoint.seed_entities.clone(),
            metadata: export.checkpoint.metadata.clone(),
            imported: true,
        };

        let entities: Vec<Value> = export.entities.iter().map(entity_to_value).collect();
        let member_ids: Vec<String> = export.entities.iter().map(|e| e.id.clone()).collect();

        let mut by_type: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
        for edge in &export.relationships {
            by_type
                .entry(edge.relationship.as_str())
                .or_default()
                .push(edge_to_value(edge));
        }

        let mut statements: Vec<Statement> = Vec::with_capacity(3 + by_type.len());
        statements.push(cypher::upsert_entities(&entities));
        for (relationship, edges) in &by_type {
            statements.push(cypher::upsert_edges(relationship, edges));
        }
        statements.push(cypher::upsert_checkpoint(&checkpoint));
        statements.push(cypher::merge_membership(&checkpoint.id, &member_ids));

        self.store.run_batch(statements).await?;

        info!(
            checkpoint_id = %checkpoint.id,
            entities = member_ids.len(),
            relationships = export.relationships.len(),
            "imported checkpoint"
        );
        Ok(checkpoint.id)
    }

    /// Remove the checkpoint node and its membership edges; member entities
    /// are untouched. Unknown ids are a no-op.
    pub async fn delete_checkpoint(&self, id: &str) -> Result<()> {
        self.store.run(cypher::delete_checkpoint(id)).await?;
        debug!(checkpoint_id = %id, "deleted checkpoint");
        Ok(())
    }
}

fn entity_to_value(entity: &Entity) -> Value {
    json!({
        "id": entity.id,
        "entity_type": entity.entity_type,
        "properties": Value::Object(entity.properties.0.clone()),
    })
}

fn edge_to_value(edge: &TemporalEdge) -> Value {
    json!({
        "from_id": edge.from_id,
        "to_id": edge.to_id,
        "valid_from": edge.valid_from.map(|ts| ts.to_millis()),
        "valid_to": edge.valid_to.map(|ts| ts.to_millis()),
        "change_set_id": edge.change_set_id,
        "properties": Value::Object(edge.properties.0.clone()),
    })
}

/// Entity-type counts come from the member list; relationship-type counts
/// from the aggregated rows over edges strictly between members.
fn subgraph_stats(members: &[Entity], rel_rows: &[Row]) -> Result<SubgraphStats> {
    let mut stats = SubgraphStats::default();
    for member in members {
        *stats
            .entity_types
            .entry(member.entity_type.clone())
            .or_default() += 1;
    }
    for row in rel_rows {
        stats
            .relationship_types
            .insert(row_str(row, "relationship")?, row_u64(row, "total")?);
    }
    Ok(stats)
}
