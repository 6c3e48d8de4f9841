use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Relationship type used for checkpoint membership edges.
pub(crate) const MEMBERSHIP_REL: &str = "INCLUDES";

/// Relationship type linking a version fact to its entity.
pub(crate) const VERSION_REL: &str = "VERSION_OF";

/// Timestamp wrapper
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// Create a new timestamp with the current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create a timestamp from a DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Epoch milliseconds, the encoding used across the store boundary.
    pub fn to_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Rebuild a timestamp from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self(Utc.timestamp_millis_opt(millis).single().unwrap_or_default())
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self(Utc::now())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Temporal range for validity-window queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemporalRange {
    /// Start time (inclusive)
    pub start: Option<Timestamp>,
    /// End time (inclusive)
    pub end: Option<Timestamp>,
}

impl TemporalRange {
    /// Create a new temporal range
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        Self { start, end }
    }

    /// Create an unbounded temporal range (infinite in both directions)
    pub fn unbounded() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Check if a timestamp is within this range
    pub fn contains(&self, timestamp: &DateTime<Utc>) -> bool {
        let after_start = match &self.start {
            Some(start) => timestamp >= &start.0,
            None => true,
        };

        let before_end = match &self.end {
            Some(end) => timestamp <= &end.0,
            None => true,
        };

        after_start && before_end
    }

    /// Check if this range overlaps with another range
    pub fn overlaps(&self, other: &TemporalRange) -> bool {
        let start_before = match (&self.start, &other.end) {
            (Some(start), Some(end)) => start.0 <= end.0,
            _ => true,
        };

        let end_after = match (&self.end, &other.start) {
            (Some(end), Some(start)) => end.0 >= start.0,
            _ => true,
        };

        start_before && end_after
    }
}

/// Properties associated with entities and relationships
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties(pub serde_json::Map<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self(serde_json::Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<serde_json::Map<String, Value>> for Properties {
    fn from(map: serde_json::Map<String, Value>) -> Self {
        Self(map)
    }
}

/// An entity as this engine sees it: an opaque node owned by collaborators,
/// referenced by id and type with an arbitrary property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: String,
    #[serde(default)]
    pub properties: Properties,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            properties: Properties::new(),
        }
    }
}

/// Immutable point-in-time fact about an entity's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub id: String,
    pub entity_id: String,
    pub hash: String,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_set_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Options for recording a version fact
#[derive(Debug, Clone, Default)]
pub struct VersionOptions {
    pub change_set_id: Option<String>,
    pub timestamp: Option<Timestamp>,
    pub path: Option<String>,
    pub language: Option<String>,
}

/// Identity of a bitemporal relationship: one open interval at most may exist
/// for each `(from, to, relationship)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeIdentity {
    pub from_id: String,
    pub to_id: String,
    pub relationship: String,
}

impl EdgeIdentity {
    pub fn new(
        from_id: impl Into<String>,
        to_id: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            from_id: from_id.into(),
            to_id: to_id.into(),
            relationship: relationship.into(),
        }
    }

    /// Reject relationship types that cannot be interpolated into a query
    /// safely or that collide with the engine's structural edges.
    pub fn validate(&self) -> Result<()> {
        validate_relationship_type(&self.relationship)
    }
}

impl fmt::Display for EdgeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({})-[{}]->({})", self.from_id, self.relationship, self.to_id)
    }
}

/// Validate a caller-supplied relationship type name.
///
/// Types are interpolated (backtick-quoted) into query text because the query
/// language cannot parameterize them, so the shape is restricted to
/// identifier characters. `INCLUDES` and `VERSION_OF` are reserved.
pub fn validate_relationship_type(relationship: &str) -> Result<()> {
    let mut chars = relationship.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        return Err(Error::Validation(format!(
            "invalid relationship type `{}`",
            relationship
        )));
    }
    if relationship == MEMBERSHIP_REL || relationship == VERSION_REL {
        return Err(Error::Validation(format!(
            "relationship type `{}` is reserved",
            relationship
        )));
    }
    Ok(())
}

/// A bitemporal relationship instance. `valid_to` unset means the edge is
/// still open; a closed edge is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalEdge {
    pub relationship: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_set_id: Option<String>,
    #[serde(default)]
    pub properties: Properties,
}

impl TemporalEdge {
    pub fn identity(&self) -> EdgeIdentity {
        EdgeIdentity::new(&self.from_id, &self.to_id, &self.relationship)
    }

    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Whether the validity interval contains `at`. An absent `valid_from` is
    /// the beginning of time; an absent `valid_to` is the end of time.
    pub fn valid_at(&self, at: Timestamp) -> bool {
        let from_ok = match self.valid_from {
            Some(from) => from <= at,
            None => true,
        };
        let to_ok = match self.valid_to {
            Some(to) => at <= to,
            None => true,
        };
        from_ok && to_ok
    }
}

/// Named, immutable snapshot of a subgraph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub timestamp: Timestamp,
    pub reason: String,
    pub seed_entities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub imported: bool,
}

/// Options for creating a checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointOptions {
    pub reason: String,
    pub hops: Option<u32>,
    pub window: Option<TemporalRange>,
    pub metadata: Option<Value>,
}

impl CheckpointOptions {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            hops: None,
            window: None,
            metadata: None,
        }
    }
}

/// Result of creating a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointCreated {
    pub checkpoint_id: String,
    pub member_count: usize,
}

/// Filter for paginated checkpoint listing
#[derive(Debug, Clone, Default)]
pub struct CheckpointFilter {
    pub reason: Option<String>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// One page of checkpoints; `total` is the filtered count before pagination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPage {
    pub items: Vec<Checkpoint>,
    pub total: u64,
}

/// Aggregated composition of a checkpoint's membership subgraph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubgraphStats {
    pub entity_types: BTreeMap<String, u64>,
    pub relationship_types: BTreeMap<String, u64>,
}

/// Checkpoint with members and aggregate stats
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint: Checkpoint,
    pub members: Vec<Entity>,
    pub stats: SubgraphStats,
}

/// Exported closed subgraph: full membership plus every relationship whose
/// endpoints are both members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointExport {
    pub checkpoint: Checkpoint,
    pub entities: Vec<Entity>,
    pub relationships: Vec<TemporalEdge>,
}

/// Options for importing an exported checkpoint
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub use_original_id: bool,
}

/// Options for time-travel traversal
#[derive(Debug, Clone)]
pub struct TraversalOptions {
    pub start_id: String,
    pub until: Option<Timestamp>,
    pub max_depth: Option<u32>,
    pub relationship_types: Vec<String>,
    pub node_labels: Vec<String>,
}

impl TraversalOptions {
    pub fn new(start_id: impl Into<String>) -> Self {
        Self {
            start_id: start_id.into(),
            until: None,
            max_depth: None,
            relationship_types: Vec::new(),
            node_labels: Vec::new(),
        }
    }
}

/// De-duplicated node set and surviving edges of a time-travel traversal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraversalResult {
    pub nodes: Vec<Entity>,
    pub edges: Vec<TemporalEdge>,
}

/// Options for retention pruning
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOptions {
    pub dry_run: bool,
}

/// Counts from the three pruning passes, populated for dry runs as well.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub versions_deleted: u64,
    pub edges_closed: u64,
    pub checkpoints_deleted: u64,
}

/// Membership-count distribution over checkpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberDistribution {
    pub avg: f64,
    pub min: u64,
    pub max: u64,
}

/// Open/closed split of temporal relationship instances
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeCounts {
    pub open: u64,
    pub closed: u64,
}

/// Aggregate counts over the history graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryMetrics {
    pub versions: u64,
    pub checkpoints: u64,
    pub checkpoint_members: MemberDistribution,
    pub temporal_edges: EdgeCounts,
}

/// One fact in a session timeline. The discriminant is explicit so consumers
/// never have to sniff shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionEvent {
    Version(Version),
    Relationship(TemporalEdge),
}

impl SessionEvent {
    /// The instant this fact was recorded at, when one exists.
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            SessionEvent::Version(v) => Some(v.timestamp),
            SessionEvent::Relationship(e) => e.valid_from,
        }
    }
}

/// Everything stamped with one change-set id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionChanges {
    pub change_set_id: String,
    pub versions: Vec<Version>,
    pub edges: Vec<TemporalEdge>,
}

/// Earliest and latest instants touched by a session
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub earliest: Timestamp,
    pub latest: Timestamp,
}

/// Impact summary for one session. `timespan` is present only when at least
/// one timestamped fact exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionImpacts {
    pub change_set_id: String,
    pub entities_touched: Vec<String>,
    pub version_count: u64,
    pub edge_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timespan: Option<TimeSpan>,
}

/// A session seen from one entity's perspective
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub change_set_id: String,
    pub changes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<Timestamp>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

/// Result of scanning for edge-identity invariant violations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantReport {
    pub passed: bool,
    pub violations: Vec<OpenEdgeViolation>,
}

/// An identity holding more than one open interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenEdgeViolation {
    pub identity: EdgeIdentity,
    pub open_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ts(offset_secs: i64) -> Timestamp {
        Timestamp(Utc::now() + Duration::seconds(offset_secs))
    }

    #[test]
    fn test_timestamp_millis_round_trip() {
        let now = Timestamp::now();
        let back = Timestamp::from_millis(now.to_millis());
        assert_eq!(back.to_millis(), now.to_millis());
    }

    #[test]
    fn test_temporal_range() {
        let now = Utc::now();
        let later = now + Duration::hours(1);

        let range = TemporalRange::new(Some(Timestamp(now)), Some(Timestamp(later)));

        assert!(range.contains(&now));
        assert!(range.contains(&later));
        assert!(!range.contains(&(later + Duration::hours(1))));
        assert!(TemporalRange::unbounded().contains(&now));
    }

    #[test]
    fn test_temporal_range_overlaps() {
        let a = TemporalRange::new(Some(ts(0)), Some(ts(100)));
        let b = TemporalRange::new(Some(ts(50)), Some(ts(150)));
        let c = TemporalRange::new(Some(ts(200)), None);

        assert!(a.overlaps(&b));
        assert!(b.overlaps(&c));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn test_edge_valid_at_boundaries() {
        let t1 = ts(10);
        let t3 = ts(30);
        let edge = TemporalEdge {
            relationship: "DEPENDS_ON".to_string(),
            from_id: "a".to_string(),
            to_id: "b".to_string(),
            valid_from: Some(t1),
            valid_to: Some(t3),
            change_set_id: None,
            properties: Properties::new(),
        };

        assert!(!edge.valid_at(ts(0)));
        assert!(edge.valid_at(t1));
        assert!(edge.valid_at(ts(20)));
        assert!(edge.valid_at(t3));
        assert!(!edge.valid_at(ts(40)));
    }

    #[test]
    fn test_open_edge_valid_into_the_future() {
        let edge = TemporalEdge {
            relationship: "DEPENDS_ON".to_string(),
            from_id: "a".to_string(),
            to_id: "b".to_string(),
            valid_from: Some(ts(0)),
            valid_to: None,
            change_set_id: None,
            properties: Properties::new(),
        };

        assert!(edge.is_open());
        assert!(edge.valid_at(ts(1_000_000)));
        assert!(!edge.valid_at(ts(-10)));
    }

    #[test]
    fn test_relationship_type_validation() {
        assert!(validate_relationship_type("DEPENDS_ON").is_ok());
        assert!(validate_relationship_type("_private").is_ok());
        assert!(validate_relationship_type("rel2").is_ok());

        assert!(validate_relationship_type("").is_err());
        assert!(validate_relationship_type("9lives").is_err());
        assert!(validate_relationship_type("BAD-TYPE").is_err());
        assert!(validate_relationship_type("a b").is_err());
        assert!(validate_relationship_type("INCLUDES").is_err());
        assert!(validate_relationship_type("VERSION_OF").is_err());
    }

    #[test]
    fn test_session_event_tagging() {
        let event = SessionEvent::Version(Version {
            id: "v1".to_string(),
            entity_id: "e1".to_string(),
            hash: "abc".to_string(),
            timestamp: Timestamp::now(),
            change_set_id: Some("cs1".to_string()),
            path: None,
            language: None,
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "version");
        assert_eq!(json["entity_id"], "e1");

        let back: SessionEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_checkpoint_serialization() {
        let checkpoint = Checkpoint {
            id: "cp-1".to_string(),
            timestamp: Timestamp::now(),
            reason: "pre-release".to_string(),
            seed_entities: vec!["a".to_string(), "b".to_string()],
            metadata: Some(serde_json::json!({"release": "1.2.0"})),
            imported: false,
        };

        let json = serde_json::to_string(&checkpoint).unwrap();
        let back: Checkpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, checkpoint);
    }
}
