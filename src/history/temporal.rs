use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::store::{
    cypher, edge_from_value, entity_from_value, row_array, row_str, row_u64, row_value,
    GraphStore, Row,
};
use crate::types::{
    EdgeIdentity, Entity, InvariantReport, OpenEdgeViolation, Properties, TemporalEdge,
    Timestamp, TraversalOptions, TraversalResult,
};

/// Owns the bitemporal relationship lifecycle and time-filtered traversal.
///
/// Edge transitions run as close-then-open inside one store transaction, and
/// same-process writers to one identity are additionally serialized through
/// an identity-keyed mutex, so at most one open interval per identity
/// survives any interleaving.
pub struct TemporalQueryService {
    store: Arc<dyn GraphStore>,
    default_depth: u32,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl TemporalQueryService {
    pub fn new(store: Arc<dyn GraphStore>, default_depth: u32) -> Self {
        Self {
            store,
            default_depth,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, identity: &EdgeIdentity) -> Arc<Mutex<()>> {
        self.locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Open a fresh validity interval for the identity, closing any interval
    /// still open at the same instant first.
    pub async fn open_edge(
        &self,
        from_id: &str,
        to_id: &str,
        relationship: &str,
        at: Option<Timestamp>,
        change_set_id: Option<String>,
        properties: Properties,
    ) -> Result<()> {
        let identity = EdgeIdentity::new(from_id, to_id, relationship);
        identity.validate()?;
        let at = at.unwrap_or_else(Timestamp::now);

        let lock = self.lock_for(&identity);
        let _guard = lock.lock().await;

        self.store
            .run_batch(vec![
                cypher::close_open_edge(&identity, at),
                cypher::create_open_edge(&identity, at, &change_set_id, &properties.0),
            ])
            .await?;

        debug!(identity = %identity, at = %at, "opened edge");
        Ok(())
    }

    /// Close the open interval for the identity. Closing an identity with no
    /// open interval is a no-op so maintenance can repeat safely.
    pub async fn close_edge(
        &self,
        from_id: &str,
        to_id: &str,
        relationship: &str,
        at: Option<Timestamp>,
    ) -> Result<()> {
        let identity = EdgeIdentity::new(from_id, to_id, relationship);
        identity.validate()?;
        let at = at.unwrap_or_else(Timestamp::now);

        let lock = self.lock_for(&identity);
        let _guard = lock.lock().await;

        let rows = self.store.run(cypher::close_open_edge(&identity, at)).await?;
        let closed = match rows.first() {
            Some(row) => row_u64(row, "closed")?,
            None => 0,
        };
        if closed == 0 {
            debug!(identity = %identity, "close_edge: no open interval");
        } else {
            debug!(identity = %identity, at = %at, "closed edge");
        }
        Ok(())
    }

    /// Bounded expansion from a start entity keeping only edges whose
    /// validity interval contains `until` (default: now). Returns the
    /// de-duplicated node set and the surviving edges; an unknown start id
    /// yields an empty result.
    pub async fn traverse_at(&self, options: TraversalOptions) -> Result<TraversalResult> {
        let until = options.until.unwrap_or_else(Timestamp::now);
        let depth = options.max_depth.unwrap_or(self.default_depth);

        let start_rows = self
            .store
            .run(cypher::fetch_entity(&options.start_id))
            .await?;
        let start = match start_rows.first() {
            Some(row) => entity_from_value(row_value(row, "entity")?)?,
            None => return Ok(TraversalResult::default()),
        };
        if depth == 0 {
            return collect_traversal(start, &[]);
        }

        let rows = self
            .store
            .run(cypher::traverse_at(
                &options.start_id,
                until,
                depth,
                &options.relationship_types,
                &options.node_labels,
            ))
            .await?;

        collect_traversal(start, &rows)
    }

    /// Scan for identities violating the single-open-interval invariant.
    pub async fn check_open_edge_invariant(&self) -> Result<InvariantReport> {
        let rows = self.store.run(cypher::open_edge_violations()).await?;
        let violations = rows
            .iter()
            .map(|row| {
                Ok(OpenEdgeViolation {
                    identity: EdgeIdentity::new(
                        row_str(row, "from_id")?,
                        row_str(row, "to_id")?,
                        row_str(row, "relationship")?,
                    ),
                    open_count: row_u64(row, "open_count")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(InvariantReport {
            passed: violations.is_empty(),
            violations,
        })
    }
}

/// Merge traversal rows into set-semantics results: nodes keyed by id, edges
/// keyed by identity plus interval start.
fn collect_traversal(start: Entity, rows: &[Row]) -> Result<TraversalResult> {
    let mut nodes: BTreeMap<String, Entity> = BTreeMap::new();
    nodes.insert(start.id.clone(), start);
    let mut edges: BTreeMap<(String, String, String, i64), TemporalEdge> = BTreeMap::new();

    for row in rows {
        for value in row_array(row, "nodes")? {
            let entity = entity_from_value(value)?;
            nodes.entry(entity.id.clone()).or_insert(entity);
        }
        for value in row_array(row, "relationships")? {
            let edge = edge_from_value(value)?;
            let key = (
                edge.from_id.clone(),
                edge.to_id.clone(),
                edge.relationship.clone(),
                edge.valid_from.map(|ts| ts.to_millis()).unwrap_or(i64::MIN),
            );
            edges.entry(key).or_insert(edge);
        }
    }

    Ok(TraversalResult {
        nodes: nodes.into_values().collect(),
        edges: edges.into_values().collect(),
    })
}
