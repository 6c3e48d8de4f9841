use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::error::Result;
use crate::store::{
    cypher, edge_from_value, row_opt_millis, row_str, row_u64, row_value, version_from_value,
    GraphStore, Row,
};
use crate::types::{
    SessionChanges, SessionEvent, SessionImpacts, SessionSummary, TemporalEdge, TemporalRange,
    TimeSpan, Timestamp,
};

/// Session-scoped analytics: pure read and aggregation over the facts stamped
/// with a change-set id. Nothing here mutates the graph.
pub struct SessionAnalytics {
    store: Arc<dyn GraphStore>,
    default_page_limit: usize,
}

impl SessionAnalytics {
    pub fn new(store: Arc<dyn GraphStore>, default_page_limit: usize) -> Self {
        Self {
            store,
            default_page_limit,
        }
    }

    fn limit_or_default(&self, limit: Option<usize>) -> usize {
        limit.unwrap_or(self.default_page_limit)
    }

    /// Interval history between two entities, oldest interval first.
    pub async fn relationship_timeline(
        &self,
        from_id: &str,
        to_id: &str,
        relationship: Option<String>,
        window: &TemporalRange,
        limit: Option<usize>,
    ) -> Result<Vec<TemporalEdge>> {
        let rows = self
            .store
            .run(cypher::relationship_timeline(
                from_id,
                to_id,
                &relationship,
                window,
                self.limit_or_default(limit),
            ))
            .await?;
        rows.iter()
            .map(|row| edge_from_value(row_value(row, "relationship")?))
            .collect()
    }

    /// Every version and edge recorded under one change-set id, read in one
    /// snapshot.
    pub async fn changes_for_session(
        &self,
        change_set_id: &str,
        window: &TemporalRange,
        limit: Option<usize>,
    ) -> Result<SessionChanges> {
        let limit = self.limit_or_default(limit);
        let groups = self
            .store
            .run_batch(vec![
                cypher::session_versions(change_set_id, window, limit),
                cypher::session_edges(change_set_id, window, limit),
            ])
            .await?;

        let versions = groups
            .first()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|row| version_from_value(row_value(row, "version")?))
            .collect::<Result<Vec<_>>>()?;
        let edges = groups
            .get(1)
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|row| edge_from_value(row_value(row, "relationship")?))
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionChanges {
            change_set_id: change_set_id.to_string(),
            versions,
            edges,
        })
    }

    /// The session's facts merged into one chronological stream.
    pub async fn session_timeline(
        &self,
        change_set_id: &str,
        window: &TemporalRange,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEvent>> {
        let changes = self
            .changes_for_session(change_set_id, window, limit)
            .await?;
        Ok(merge_events(changes))
    }

    /// What the session touched, how much, and over which span.
    pub async fn session_impacts(&self, change_set_id: &str) -> Result<SessionImpacts> {
        let changes = self
            .changes_for_session(change_set_id, &TemporalRange::unbounded(), None)
            .await?;
        Ok(summarize_impacts(changes))
    }

    /// Sessions that recorded versions for or wired edges around one entity,
    /// most recently active first.
    pub async fn sessions_affecting_entity(
        &self,
        entity_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SessionSummary>> {
        let groups = self
            .store
            .run_batch(vec![
                cypher::sessions_from_versions(entity_id),
                cypher::sessions_from_edges(entity_id),
            ])
            .await?;

        let version_rows = groups.first().map(Vec::as_slice).unwrap_or_default();
        let edge_rows = groups.get(1).map(Vec::as_slice).unwrap_or_default();
        merge_sessions(version_rows, edge_rows, self.limit_or_default(limit))
    }
}

/// Interleave versions and edges chronologically. Facts without an instant
/// (edges whose interval opens at the beginning of time) sort first.
fn merge_events(changes: SessionChanges) -> Vec<SessionEvent> {
    let mut events: Vec<SessionEvent> = changes
        .versions
        .into_iter()
        .map(SessionEvent::Version)
        .chain(changes.edges.into_iter().map(SessionEvent::Relationship))
        .collect();
    events.sort_by_key(|event| {
        event
            .timestamp()
            .map(|ts| ts.to_millis())
            .unwrap_or(i64::MIN)
    });
    events
}

/// Collapse a session's changes into counts, the set of entities touched and
/// the recorded timespan. `timespan` stays absent unless at least one fact
/// carries an instant.
fn summarize_impacts(changes: SessionChanges) -> SessionImpacts {
    let mut entities: BTreeSet<String> = BTreeSet::new();
    let mut instants: Vec<Timestamp> = Vec::new();

    for version in &changes.versions {
        entities.insert(version.entity_id.clone());
        instants.push(version.timestamp);
    }
    for edge in &changes.edges {
        entities.insert(edge.from_id.clone());
        entities.insert(edge.to_id.clone());
        if let Some(from) = edge.valid_from {
            instants.push(from);
        }
    }

    let timespan = match (instants.iter().min(), instants.iter().max()) {
        (Some(&earliest), Some(&latest)) => Some(TimeSpan { earliest, latest }),
        _ => None,
    };

    SessionImpacts {
        change_set_id: changes.change_set_id,
        entities_touched: entities.into_iter().collect(),
        version_count: changes.versions.len() as u64,
        edge_count: changes.edges.len() as u64,
        timespan,
    }
}

fn min_opt(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.min(y)),
        (some, None) | (None, some) => some,
    }
}

fn max_opt(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (some, None) | (None, some) => some,
    }
}

/// Fold the per-source aggregates (versions, edges) into one summary per
/// session, most recently active first.
fn merge_sessions(
    version_rows: &[Row],
    edge_rows: &[Row],
    limit: usize,
) -> Result<Vec<SessionSummary>> {
    let mut sessions: BTreeMap<String, SessionSummary> = BTreeMap::new();

    for row in version_rows.iter().chain(edge_rows.iter()) {
        let change_set_id = row_str(row, "change_set_id")?;
        let changes = row_u64(row, "changes")?;
        let first_seen = row_opt_millis(row, "first_seen")?;
        let last_seen = row_opt_millis(row, "last_seen")?;

        let entry = sessions
            .entry(change_set_id.clone())
            .or_insert_with(|| SessionSummary {
                change_set_id,
                changes: 0,
                first_seen: None,
                last_seen: None,
            });
        entry.changes += changes;
        entry.first_seen = min_opt(entry.first_seen, first_seen);
        entry.last_seen = max_opt(entry.last_seen, last_seen);
    }

    let mut merged: Vec<SessionSummary> = sessions.into_values().collect();
    merged.sort_by_key(|summary| {
        std::cmp::Reverse(
            summary
                .last_seen
                .map(|ts| ts.to_millis())
                .unwrap_or(i64::MIN),
        )
    });
    merged.truncate(limit);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockGraphStore;
    use crate::types::{Properties, Version};
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn version(entity_id: &str, millis: i64) -> Version {
        Version {
            id: format!("v-{entity_id}-{millis}"),
            entity_id: entity_id.to_string(),
            hash: "abc".to_string(),
            timestamp: Timestamp::from_millis(millis),
            change_set_id: Some("cs-1".to_string()),
            path: None,
            language: None,
        }
    }

    fn edge(from: &str, to: &str, millis: i64) -> TemporalEdge {
        TemporalEdge {
            relationship: "DEPENDS_ON".to_string(),
            from_id: from.to_string(),
            to_id: to.to_string(),
            valid_from: Some(Timestamp::from_millis(millis)),
            valid_to: None,
            change_set_id: Some("cs-1".to_string()),
            properties: Properties::new(),
        }
    }

    #[test]
    fn test_merge_events_orders_chronologically() {
        let changes = SessionChanges {
            change_set_id: "cs-1".to_string(),
            versions: vec![version("a", 300), version("b", 100)],
            edges: vec![edge("a", "b", 200)],
        };

        let events = merge_events(changes);
        let instants: Vec<i64> = events
            .iter()
            .map(|e| e.timestamp().unwrap().to_millis())
            .collect();
        assert_eq!(instants, vec![100, 200, 300]);
        assert!(matches!(events[1], SessionEvent::Relationship(_)));
    }

    #[test]
    fn test_summarize_impacts_spans_all_instants() {
        let changes = SessionChanges {
            change_set_id: "cs-1".to_string(),
            versions: vec![version("a", 300)],
            edges: vec![edge("b", "c", 100)],
        };

        let impacts = summarize_impacts(changes);
        assert_eq!(impacts.entities_touched, vec!["a", "b", "c"]);
        assert_eq!(impacts.version_count, 1);
        assert_eq!(impacts.edge_count, 1);
        let timespan = impacts.timespan.unwrap();
        assert_eq!(timespan.earliest.to_millis(), 100);
        assert_eq!(timespan.latest.to_millis(), 300);
    }

    #[test]
    fn test_summarize_impacts_without_instants_has_no_timespan() {
        let mut bare = edge("a", "b", 0);
        bare.valid_from = None;
        let changes = SessionChanges {
            change_set_id: "cs-1".to_string(),
            versions: Vec::new(),
            edges: vec![bare],
        };

        let impacts = summarize_impacts(changes);
        assert_eq!(impacts.edge_count, 1);
        assert!(impacts.timespan.is_none());
    }

    #[test]
    fn test_merge_sessions_folds_sources() {
        let version_rows = vec![row(json!({
            "change_set_id": "cs-1",
            "changes": 2,
            "first_seen": 100,
            "last_seen": 300,
        }))];
        let edge_rows = vec![
            row(json!({
                "change_set_id": "cs-1",
                "changes": 1,
                "first_seen": 50,
                "last_seen": 200,
            })),
            row(json!({
                "change_set_id": "cs-2",
                "changes": 1,
                "first_seen": 500,
                "last_seen": 500,
            })),
        ];

        let merged = merge_sessions(&version_rows, &edge_rows, 10).unwrap();
        assert_eq!(merged.len(), 2);
        // most recently active first
        assert_eq!(merged[0].change_set_id, "cs-2");
        assert_eq!(merged[1].changes, 3);
        assert_eq!(merged[1].first_seen.unwrap().to_millis(), 50);
        assert_eq!(merged[1].last_seen.unwrap().to_millis(), 300);
    }

    #[tokio::test]
    async fn test_changes_for_session_decodes_both_groups() {
        let mut store = MockGraphStore::new();
        store.expect_run_batch().times(1).returning(|_| {
            Ok(vec![
                vec![row(json!({"version": {
                    "id": "v-1",
                    "entity_id": "a",
                    "hash": "abc",
                    "timestamp": 100,
                    "change_set_id": "cs-1",
                }}))],
                vec![row(json!({"relationship": {
                    "relationship": "DEPENDS_ON",
                    "from_id": "a",
                    "to_id": "b",
                    "valid_from": 200,
                    "change_set_id": "cs-1",
                }}))],
            ])
        });

        let analytics = SessionAnalytics::new(Arc::new(store), 20);
        let changes = analytics
            .changes_for_session("cs-1", &TemporalRange::unbounded(), None)
            .await
            .unwrap();
        assert_eq!(changes.versions.len(), 1);
        assert_eq!(changes.edges.len(), 1);
        assert_eq!(changes.edges[0].to_id, "b");
    }
}
