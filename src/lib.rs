//! Chronograph
//!
//! A temporal history and checkpoint engine for versioned, bitemporal
//! knowledge graphs: immutable version facts, relationship validity
//! intervals, named subgraph checkpoints, time-travel traversal, retention
//! pruning and session-scoped change analytics, orchestrated on top of a
//! narrow graph-store capability.

pub mod config;
pub mod error;
pub mod history;
pub mod store;
pub mod types;

pub use crate::{
    config::Config,
    error::{Error, Result},
};

pub use history::{
    CheckpointService, HistoryObserver, HistoryService, SessionAnalytics, TemporalQueryService,
    VersionManager,
};
pub use store::{GraphStore, Neo4jStore, Row, Statement};
pub use types::{
    Checkpoint, CheckpointCreated, CheckpointExport, CheckpointFilter, CheckpointOptions,
    CheckpointPage, CheckpointSummary, EdgeCounts, EdgeIdentity, Entity, HistoryMetrics,
    ImportOptions, InvariantReport, MemberDistribution, OpenEdgeViolation, Properties,
    PruneOptions, PruneReport, SessionChanges, SessionEvent, SessionImpacts, SessionSummary,
    SubgraphStats, TemporalEdge, TemporalRange, TimeSpan, Timestamp, TraversalOptions,
    TraversalResult, Version, VersionOptions,
};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
