use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Result;
use crate::store::{cypher, row_opt_f64, row_u64, GraphStore, Statement};
use crate::types::{
    Checkpoint, CheckpointCreated, CheckpointExport, CheckpointFilter, CheckpointOptions,
    CheckpointPage, CheckpointSummary, EdgeCounts, EdgeIdentity, Entity, HistoryMetrics,
    ImportOptions, InvariantReport, MemberDistribution, Properties, PruneOptions, PruneReport,
    SessionChanges, SessionEvent, SessionImpacts, SessionSummary, TemporalEdge, TemporalRange,
    Timestamp, TraversalOptions, TraversalResult, Version, VersionOptions,
};

pub mod analytics;
pub mod checkpoint;
pub mod temporal;
pub mod version;

pub use analytics::SessionAnalytics;
pub use checkpoint::CheckpointService;
pub use temporal::TemporalQueryService;
pub use version::VersionManager;

/// Observability hook invoked after state-changing operations commit.
///
/// Injected at construction; the default implementation does nothing. This is
/// the whole eventing surface — results otherwise flow only through typed
/// return values.
pub trait HistoryObserver: Send + Sync {
    fn on_version_appended(&self, _version_id: &str, _entity_id: &str) {}
    fn on_edge_opened(&self, _identity: &EdgeIdentity) {}
    fn on_edge_closed(&self, _identity: &EdgeIdentity) {}
    fn on_checkpoint_created(&self, _checkpoint_id: &str, _member_count: usize) {}
    fn on_checkpoint_deleted(&self, _checkpoint_id: &str) {}
    fn on_history_pruned(&self, _report: &PruneReport) {}
}

struct NoopObserver;

impl HistoryObserver for NoopObserver {}

/// The single contract consumed by API and administration layers: composes
/// version recording, the bitemporal edge lifecycle, and checkpoints, and
/// adds retention pruning, metrics, and session analytics on top.
///
/// Holds no mutable in-process state; one instance is safe to share across
/// concurrent callers.
pub struct HistoryService {
    store: Arc<dyn GraphStore>,
    versions: VersionManager,
    temporal: TemporalQueryService,
    checkpoints: CheckpointService,
    analytics: SessionAnalytics,
    observer: Arc<dyn HistoryObserver>,
}

impl HistoryService {
    pub fn new(store: Arc<dyn GraphStore>, config: &Config) -> Self {
        Self::with_observer(store, config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        store: Arc<dyn GraphStore>,
        config: &Config,
        observer: Arc<dyn HistoryObserver>,
    ) -> Self {
        Self {
            versions: VersionManager::new(store.clone()),
            temporal: TemporalQueryService::new(store.clone(), config.default_traversal_depth),
            checkpoints: CheckpointService::new(
                store.clone(),
                config.default_checkpoint_hops,
                config.default_page_limit,
            ),
            analytics: SessionAnalytics::new(store.clone(), config.default_page_limit),
            store,
            observer,
        }
    }

    /// Connect the bundled store adapter and build the service on top of it.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = Arc::new(crate::store::Neo4jStore::connect(config).await?);
        Ok(Self::new(store, config))
    }

    // --- versions -----------------------------------------------------------

    pub async fn append_version(
        &self,
        entity: &Entity,
        options: VersionOptions,
    ) -> Result<String> {
        let version_id = self.versions.append_version(entity, options).await?;
        self.observer.on_version_appended(&version_id, &entity.id);
        Ok(version_id)
    }

    // --- edge lifecycle -----------------------------------------------------

    pub async fn open_edge(
        &self,
        from_id: &str,
        to_id: &str,
        relationship: &str,
        at: Option<Timestamp>,
        change_set_id: Option<String>,
    ) -> Result<()> {
        self.temporal
            .open_edge(from_id, to_id, relationship, at, change_set_id, Properties::new())
            .await?;
        self.observer
            .on_edge_opened(&EdgeIdentity::new(from_id, to_id, relationship));
        Ok(())
    }

    pub async fn close_edge(
        &self,
        from_id: &str,
        to_id: &str,
        relationship: &str,
        at: Option<Timestamp>,
    ) -> Result<()> {
        self.temporal
            .close_edge(from_id, to_id, relationship, at)
            .await?;
        self.observer
            .on_edge_closed(&EdgeIdentity::new(from_id, to_id, relationship));
        Ok(())
    }

    pub async fn time_travel_traversal(
        &self,
        options: TraversalOptions,
    ) -> Result<TraversalResult> {
        self.temporal.traverse_at(options).await
    }

    pub async fn check_open_edge_invariant(&self) -> Result<InvariantReport> {
        self.temporal.check_open_edge_invariant().await
    }

    // --- checkpoints --------------------------------------------------------

    pub async fn create_checkpoint(
        &self,
        seed_entities: &[String],
        options: CheckpointOptions,
    ) -> Result<CheckpointCreated> {
        let created = self
            .checkpoints
            .create_checkpoint(seed_entities, options)
            .await?;
        self.observer
            .on_checkpoint_created(&created.checkpoint_id, created.member_count);
        Ok(created)
    }

    pub async fn list_checkpoints(&self, filter: CheckpointFilter) -> Result<CheckpointPage> {
        self.checkpoints.list_checkpoints(filter).await
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.get_checkpoint(id).await
    }

    pub async fn get_checkpoint_members(&self, id: &str) -> Result<Vec<Entity>> {
        self.checkpoints.get_members(id).await
    }

    pub async fn get_checkpoint_summary(&self, id: &str) -> Result<Option<CheckpointSummary>> {
        self.checkpoints.get_summary(id).await
    }

    pub async fn export_checkpoint(&self, id: &str) -> Result<Option<CheckpointExport>> {
        self.checkpoints.export_checkpoint(id).await
    }

    pub async fn import_checkpoint(
        &self,
        export: &CheckpointExport,
        options: ImportOptions,
    ) -> Result<String> {
        let checkpoint_id = self.checkpoints.import_checkpoint(export, options).await?;
        self.observer
            .on_checkpoint_created(&checkpoint_id, export.entities.len());
        Ok(checkpoint_id)
    }

    pub async fn delete_checkpoint(&self, id: &str) -> Result<()> {
        self.checkpoints.delete_checkpoint(id).await?;
        self.observer.on_checkpoint_deleted(id);
        Ok(())
    }

    // --- retention ----------------------------------------------------------

    /// Sweep history older than the retention window in three ordered passes:
    /// checkpoints, closed edges, then versions not pinned by any remaining
    /// checkpoint. A dry run issues the selection counts only and performs
    /// zero mutation.
    pub async fn prune_history(
        &self,
        retention_days: u32,
        options: PruneOptions,
    ) -> Result<PruneReport> {
        let cutoff = Timestamp(Utc::now() - Duration::days(i64::from(retention_days)));

        let checkpoints_deleted = self
            .prune_pass(if options.dry_run {
                cypher::count_prunable_checkpoints(cutoff)
            } else {
                cypher::delete_prunable_checkpoints(cutoff)
            })
            .await?;
        let edges_closed = self
            .prune_pass(if options.dry_run {
                cypher::count_prunable_edges(cutoff)
            } else {
                cypher::delete_prunable_edges(cutoff)
            })
            .await?;
        let versions_deleted = self
            .prune_pass(if options.dry_run {
                cypher::count_prunable_versions(cutoff)
            } else {
                cypher::delete_prunable_versions(cutoff)
            })
            .await?;

        let report = PruneReport {
            versions_deleted,
            edges_closed,
            checkpoints_deleted,
        };
        if options.dry_run {
            debug!(?report, cutoff = %cutoff, "prune dry run");
        } else {
            info!(?report, cutoff = %cutoff, "pruned history");
            self.observer.on_history_pruned(&report);
        }
        Ok(report)
    }

    async fn prune_pass(&self, statement: Statement) -> Result<u64> {
        let rows = self.store.run(statement).await?;
        match rows.first() {
            Some(row) => row_u64(row, "total"),
            None => Ok(0),
        }
    }

    // --- metrics ------------------------------------------------------------

    /// Aggregate counts over versions, checkpoints, membership distribution
    /// and the open/closed edge split, read in one snapshot. Zero-member
    /// checkpoints count as 0 in the distribution.
    pub async fn get_history_metrics(&self) -> Result<HistoryMetrics> {
        let groups = self.store.run_batch(cypher::metrics_batch()).await?;

        let single = |index: usize| groups.get(index).and_then(|rows| rows.first());

        let versions = match single(0) {
            Some(row) => row_u64(row, "total")?,
            None => 0,
        };
        let checkpoints = match single(1) {
            Some(row) => row_u64(row, "total")?,
            None => 0,
        };
        let checkpoint_members = match single(2) {
            Some(row) => MemberDistribution {
                avg: row_opt_f64(row, "avg")?.unwrap_or(0.0),
                min: row_opt_f64(row, "min")?.unwrap_or(0.0) as u64,
                max: row_opt_f64(row, "max")?.unwrap_or(0.0) as u64,
            },
            None => MemberDistribution::default(),
        };
        let temporal_edges = match single(3) {
            Some(row) => EdgeCounts {
                open: row_u64(row, "open")?,
                closed: row_u64(row, "closed")?,
            },
            None => EdgeCounts::default(),
        };

        Ok(HistoryMetrics {
            versions,
            checkpoints,
            checkpoint_members,
            temporal_edges,
        })
    }

    // --- session analytics --------------------------------------------------

    pub async fn get_entity_timeline(
        &self,
        entity_id: &str,
        window: &TemporalRange,
        limit: Option<usize>,
    ) -> Result<Vec<Version>> {
        self.versions
            .entity_timeline(entity_id, window, limit.unwrap_or(100))
            .await
    }

    pub async fn get_relationship_timeline(
        &self,
        from_id: &str,
        to_id: &str,
        relationship: Option<String>,
        window: &TemporalRange,
        limit: Option<usize>,
    ) -> Result<Vec<TemporalEdge>> {
        self.analytics
            .relationship_timeline(from_id, to_id, relationship, window, limit)
            .await
    }

    pub async fn get_session_timeline(
        &self,
        change_set_id: &str,
        window: &TemporalRange,
        limit: Option<usize>,
    ) -> Result<Vec<SessionEvent>> {
        self.analytics
            .session_timeline(change_set_id, window, limit)
            .await
    }

    pub async fn get_session_impacts(&self, change_set_id: &str) -> Result<SessionImpacts> {
        self.analytics.session_impacts(change_set_id).await
    }

    pub async fn get_sessions_affecting_entity(
        &self,
        entity_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<SessionSummary>> {
        self.analytics
            .sessions_affecting_entity(entity_id, limit)
            .await
    }

    pub async fn get_changes_for_session(&self, change_set_id: &str) -> Result<SessionChanges> {
        self.analytics
            .changes_for_session(change_set_id, &TemporalRange::unbounded(), None)
            .await
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockGraphStore;
    use mockall::Sequence;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn row(value: Value) -> crate::store::Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn service(store: MockGraphStore) -> HistoryService {
        HistoryService::new(Arc::new(store), &Config::for_testing())
    }

    #[tokio::test]
    async fn test_prune_dry_run_issues_no_mutation() {
        let mut store = MockGraphStore::new();
        store
            .expect_run()
            .withf(|statement| {
                !statement.text.contains("DELETE") && statement.text.contains("count(")
            })
            .times(3)
            .returning(|_| Ok(vec![row(json!({"total": 4}))]));

        let report = service(store)
            .prune_history(30, PruneOptions { dry_run: true })
            .await
            .unwrap();
        assert_eq!(report.checkpoints_deleted, 4);
        assert_eq!(report.edges_closed, 4);
        assert_eq!(report.versions_deleted, 4);
    }

    #[tokio::test]
    async fn test_prune_runs_passes_in_order() {
        let mut store = MockGraphStore::new();
        let mut seq = Sequence::new();
        store
            .expect_run()
            .withf(|s| s.text.contains("(c:Checkpoint)") && s.text.contains("DETACH DELETE"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![row(json!({"total": 1}))]));
        store
            .expect_run()
            .withf(|s| s.text.contains("r.valid_to IS NOT NULL") && s.text.contains("DELETE"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![row(json!({"total": 2}))]));
        store
            .expect_run()
            .withf(|s| s.text.contains("(v:Version)") && s.text.contains("DETACH DELETE"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(vec![row(json!({"total": 3}))]));

        let report = service(store)
            .prune_history(30, PruneOptions { dry_run: false })
            .await
            .unwrap();
        assert_eq!(
            report,
            PruneReport {
                versions_deleted: 3,
                edges_closed: 2,
                checkpoints_deleted: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_metrics_handle_empty_graph() {
        let mut store = MockGraphStore::new();
        store.expect_run_batch().times(1).returning(|_| {
            Ok(vec![
                vec![row(json!({"total": 0}))],
                vec![row(json!({"total": 0}))],
                vec![row(json!({"avg": null, "min": null, "max": null}))],
                vec![row(json!({"open": 0, "closed": 0}))],
            ])
        });

        let metrics = service(store).get_history_metrics().await.unwrap();
        assert_eq!(metrics.versions, 0);
        assert_eq!(metrics.checkpoint_members, MemberDistribution::default());
        assert_eq!(metrics.temporal_edges, EdgeCounts::default());
    }

    #[tokio::test]
    async fn test_metrics_decode() {
        let mut store = MockGraphStore::new();
        store.expect_run_batch().times(1).returning(|_| {
            Ok(vec![
                vec![row(json!({"total": 12}))],
                vec![row(json!({"total": 3}))],
                vec![row(json!({"avg": 2.5, "min": 0, "max": 4}))],
                vec![row(json!({"open": 5, "closed": 7}))],
            ])
        });

        let metrics = service(store).get_history_metrics().await.unwrap();
        assert_eq!(metrics.versions, 12);
        assert_eq!(metrics.checkpoints, 3);
        assert_eq!(metrics.checkpoint_members.avg, 2.5);
        assert_eq!(metrics.checkpoint_members.min, 0);
        assert_eq!(metrics.checkpoint_members.max, 4);
        assert_eq!(metrics.temporal_edges.open, 5);
        assert_eq!(metrics.temporal_edges.closed, 7);
    }

    #[derive(Default)]
    struct CountingObserver {
        versions: AtomicUsize,
        prunes: AtomicUsize,
    }

    impl HistoryObserver for CountingObserver {
        fn on_version_appended(&self, _version_id: &str, _entity_id: &str) {
            self.versions.fetch_add(1, Ordering::SeqCst);
        }

        fn on_history_pruned(&self, _report: &PruneReport) {
            self.prunes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_observer_sees_commits_but_not_dry_runs() {
        let mut store = MockGraphStore::new();
        store
            .expect_run_batch()
            .returning(|statements| Ok(vec![Vec::new(); statements.len()]));
        store
            .expect_run()
            .returning(|_| Ok(vec![row(json!({"total": 0}))]));

        let observer = Arc::new(CountingObserver::default());
        let service = HistoryService::with_observer(
            Arc::new(store),
            &Config::for_testing(),
            observer.clone(),
        );

        service
            .append_version(&Entity::new("a", "Module"), VersionOptions::default())
            .await
            .unwrap();
        service
            .prune_history(30, PruneOptions { dry_run: true })
            .await
            .unwrap();
        service
            .prune_history(30, PruneOptions { dry_run: false })
            .await
            .unwrap();

        assert_eq!(observer.versions.load(Ordering::SeqCst), 1);
        assert_eq!(observer.prunes.load(Ordering::SeqCst), 1);
    }
}
