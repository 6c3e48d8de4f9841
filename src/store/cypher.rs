//! Query builders for every engine operation.
//!
//! Relationship types and depth bounds are interpolated into query text
//! because the query language cannot parameterize them; both are validated
//! before they reach this module. Every other value travels as a parameter,
//! and every RETURN clause projects plain values or maps, never raw graph
//! entities.

use serde_json::Value;

use crate::store::Statement;
use crate::types::{
    Checkpoint, CheckpointFilter, EdgeIdentity, TemporalRange, Timestamp, Version,
    MEMBERSHIP_REL, VERSION_REL,
};

/// Stand-ins for the open ends of a validity interval, chosen to stay inside
/// the store's integer range.
const MIN_MILLIS: i64 = -9_223_372_036_854_775_807;
const MAX_MILLIS: i64 = 9_223_372_036_854_775_807;

fn opt_str(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::String(s.clone()),
        None => Value::Null,
    }
}

fn opt_millis(value: &Option<Timestamp>) -> Value {
    match value {
        Some(ts) => Value::from(ts.to_millis()),
        None => Value::Null,
    }
}

/// Edge predicate excluding the engine's structural relationships from
/// traversals over caller edges.
fn structural_filter(var: &str) -> String {
    format!("NOT type({var}) IN ['{MEMBERSHIP_REL}', '{VERSION_REL}']")
}

/// Predicate: the validity interval of `var` contains `$until`.
fn contains_instant(var: &str) -> String {
    format!(
        "coalesce({var}.valid_from, {MIN_MILLIS}) <= $until \
         AND $until <= coalesce({var}.valid_to, {MAX_MILLIS})"
    )
}

// --- versions ---------------------------------------------------------------

/// Statements recording one version fact: the entity stub survives
/// out-of-order writes, the version node is immutable once created.
pub(crate) fn append_version(version: &Version) -> Vec<Statement> {
    let stub = Statement::new("MERGE (e:Entity {id: $entity_id})")
        .param("entity_id", version.entity_id.as_str());
    let create = Statement::new(format!(
        "MATCH (e:Entity {{id: $entity_id}}) \
         CREATE (v:Version {{id: $id, entity_id: $entity_id, hash: $hash, timestamp: $timestamp}}) \
         SET v.change_set_id = $change_set_id, v.path = $path, v.language = $language \
         CREATE (v)-[:{VERSION_REL}]->(e)"
    ))
    .param("entity_id", version.entity_id.as_str())
    .param("id", version.id.as_str())
    .param("hash", version.hash.as_str())
    .param("timestamp", version.timestamp.to_millis())
    .param("change_set_id", opt_str(&version.change_set_id))
    .param("path", opt_str(&version.path))
    .param("language", opt_str(&version.language));
    vec![stub, create]
}

pub(crate) fn entity_timeline(
    entity_id: &str,
    window: &TemporalRange,
    limit: usize,
) -> Statement {
    Statement::new(
        "MATCH (v:Version {entity_id: $entity_id}) \
         WHERE ($since IS NULL OR v.timestamp >= $since) \
         AND ($until IS NULL OR v.timestamp <= $until) \
         RETURN v {.*} AS version \
         ORDER BY v.timestamp ASC \
         LIMIT $limit",
    )
    .param("entity_id", entity_id)
    .param("since", opt_millis(&window.start))
    .param("until", opt_millis(&window.end))
    .param("limit", limit as i64)
}

// --- edge lifecycle ---------------------------------------------------------

/// Close whatever open interval exists for the identity, reporting how many
/// edges were touched.
pub(crate) fn close_open_edge(identity: &EdgeIdentity, at: Timestamp) -> Statement {
    Statement::new(format!(
        "MATCH (a:Entity {{id: $from_id}})-[r:`{}`]->(b:Entity {{id: $to_id}}) \
         WHERE r.valid_to IS NULL \
         SET r.valid_to = $at \
         RETURN count(r) AS closed",
        identity.relationship
    ))
    .param("from_id", identity.from_id.as_str())
    .param("to_id", identity.to_id.as_str())
    .param("at", at.to_millis())
}

/// Create a fresh open interval for the identity. Endpoint stubs are merged
/// so edge history also survives out-of-order writes; the caller's property
/// bag is applied before the temporal fields so reserved keys win.
pub(crate) fn create_open_edge(
    identity: &EdgeIdentity,
    at: Timestamp,
    change_set_id: &Option<String>,
    properties: &serde_json::Map<String, Value>,
) -> Statement {
    Statement::new(format!(
        "MERGE (a:Entity {{id: $from_id}}) \
         MERGE (b:Entity {{id: $to_id}}) \
         CREATE (a)-[r:`{}`]->(b) \
         SET r += $properties \
         SET r.valid_from = $at, r.change_set_id = $change_set_id",
        identity.relationship
    ))
    .param("from_id", identity.from_id.as_str())
    .param("to_id", identity.to_id.as_str())
    .param("at", at.to_millis())
    .param("change_set_id", opt_str(change_set_id))
    .param("properties", Value::Object(properties.clone()))
}

// --- time travel ------------------------------------------------------------

pub(crate) fn fetch_entity(id: &str) -> Statement {
    Statement::new("MATCH (e:Entity {id: $id}) RETURN e {.*} AS entity").param("id", id)
}

/// Bounded undirected expansion keeping only paths whose every edge was valid
/// at `$until`.
pub(crate) fn traverse_at(
    start_id: &str,
    until: Timestamp,
    max_depth: u32,
    relationship_types: &[String],
    node_labels: &[String],
) -> Statement {
    let types: Vec<Value> = relationship_types.iter().map(|t| Value::from(t.as_str())).collect();
    let labels: Vec<Value> = node_labels.iter().map(|l| Value::from(l.as_str())).collect();
    Statement::new(format!(
        "MATCH p = (s:Entity {{id: $start_id}})-[*1..{depth}]-(m:Entity) \
         WHERE all(r IN relationships(p) WHERE {interval} \
         AND {structural} \
         AND (size($relationship_types) = 0 OR type(r) IN $relationship_types)) \
         AND all(n IN nodes(p) WHERE size($node_labels) = 0 OR n.entity_type IN $node_labels) \
         RETURN [n IN nodes(p) | n {{.*}}] AS nodes, \
         [r IN relationships(p) | r {{ .*, relationship: type(r), \
         from_id: startNode(r).id, to_id: endNode(r).id }}] AS relationships",
        depth = max_depth,
        interval = contains_instant("r"),
        structural = structural_filter("r"),
    ))
    .param("start_id", start_id)
    .param("until", until.to_millis())
    .param("relationship_types", Value::Array(types))
    .param("node_labels", Value::Array(labels))
}

// --- checkpoints ------------------------------------------------------------

/// Membership expansion: the seeds that exist, plus everything reachable
/// within `hops` over caller edges (optionally constrained to a validity
/// window). Zero hops collapses to the seeds alone.
pub(crate) fn checkpoint_members_expansion(
    seed_ids: &[String],
    hops: u32,
    window: &Option<TemporalRange>,
) -> Statement {
    let (since, until) = match window {
        Some(range) => (opt_millis(&range.start), opt_millis(&range.end)),
        None => (Value::Null, Value::Null),
    };
    let seeds: Vec<Value> = seed_ids.iter().map(|s| Value::from(s.as_str())).collect();
    if hops == 0 {
        return Statement::new(
            "MATCH (seed:Entity) WHERE seed.id IN $seed_ids RETURN DISTINCT seed.id AS id",
        )
        .param("seed_ids", Value::Array(seeds));
    }
    Statement::new(format!(
        "MATCH (seed:Entity) WHERE seed.id IN $seed_ids \
         RETURN DISTINCT seed.id AS id \
         UNION \
         MATCH p = (seed:Entity)-[*1..{hops}]-(m:Entity) \
         WHERE seed.id IN $seed_ids \
         AND all(r IN relationships(p) WHERE {structural} \
         AND ($window_since IS NULL OR coalesce(r.valid_to, {MAX_MILLIS}) >= $window_since) \
         AND ($window_until IS NULL OR coalesce(r.valid_from, {MIN_MILLIS}) <= $window_until)) \
         RETURN DISTINCT m.id AS id",
        hops = hops,
        structural = structural_filter("r"),
    ))
    .param("seed_ids", Value::Array(seeds))
    .param("window_since", since)
    .param("window_until", until)
}

/// Statements persisting a checkpoint node and one membership edge per
/// member, executed as one transaction.
pub(crate) fn create_checkpoint(checkpoint: &Checkpoint, member_ids: &[String]) -> Vec<Statement> {
    let metadata = match &checkpoint.metadata {
        Some(value) => Value::String(value.to_string()),
        None => Value::Null,
    };
    let seeds: Vec<Value> = checkpoint
        .seed_entities
        .iter()
        .map(|s| Value::from(s.as_str()))
        .collect();
    let members: Vec<Value> = member_ids.iter().map(|s| Value::from(s.as_str())).collect();
    let node = Statement::new(
        "CREATE (c:Checkpoint {id: $id, timestamp: $timestamp, reason: $reason, \
         seed_entities: $seed_entities, imported: false}) \
         SET c.metadata = $metadata",
    )
    .param("id", checkpoint.id.as_str())
    .param("timestamp", checkpoint.timestamp.to_millis())
    .param("reason", checkpoint.reason.as_str())
    .param("seed_entities", Value::Array(seeds))
    .param("metadata", metadata);
    let membership = Statement::new(format!(
        "MATCH (c:Checkpoint {{id: $id}}) \
         MATCH (e:Entity) WHERE e.id IN $member_ids \
         CREATE (c)-[:{MEMBERSHIP_REL}]->(e)"
    ))
    .param("id", checkpoint.id.as_str())
    .param("member_ids", Value::Array(members));
    vec![node, membership]
}

fn checkpoint_filter_clause() -> &'static str {
    "WHERE ($reason IS NULL OR c.reason = $reason) \
     AND ($since IS NULL OR c.timestamp >= $since) \
     AND ($until IS NULL OR c.timestamp <= $until)"
}

/// Filtered count, computed before pagination so `total` never collapses to
/// the page size.
pub(crate) fn count_checkpoints(filter: &CheckpointFilter) -> Statement {
    Statement::new(format!(
        "MATCH (c:Checkpoint) {} RETURN count(c) AS total",
        checkpoint_filter_clause()
    ))
    .param("reason", opt_str(&filter.reason))
    .param("since", opt_millis(&filter.since))
    .param("until", opt_millis(&filter.until))
}

pub(crate) fn list_checkpoints(filter: &CheckpointFilter, limit: usize) -> Statement {
    Statement::new(format!(
        "MATCH (c:Checkpoint) {} \
         RETURN c {{.*}} AS checkpoint \
         ORDER BY c.timestamp DESC \
         SKIP $offset LIMIT $limit",
        checkpoint_filter_clause()
    ))
    .param("reason", opt_str(&filter.reason))
    .param("since", opt_millis(&filter.since))
    .param("until", opt_millis(&filter.until))
    .param("offset", filter.offset as i64)
    .param("limit", limit as i64)
}

pub(crate) fn get_checkpoint(id: &str) -> Statement {
    Statement::new("MATCH (c:Checkpoint {id: $id}) RETURN c {.*} AS checkpoint").param("id", id)
}

pub(crate) fn checkpoint_members(id: &str) -> Statement {
    Statement::new(format!(
        "MATCH (c:Checkpoint {{id: $id}})-[:{MEMBERSHIP_REL}]->(e:Entity) \
         RETURN e {{.*}} AS entity ORDER BY e.id"
    ))
    .param("id", id)
}

/// Per-type counts over edges strictly between members.
pub(crate) fn checkpoint_relationship_stats(id: &str) -> Statement {
    Statement::new(format!(
        "MATCH (c:Checkpoint {{id: $id}})-[:{MEMBERSHIP_REL}]->(a:Entity) \
         MATCH (c)-[:{MEMBERSHIP_REL}]->(b:Entity) \
         MATCH (a)-[r]->(b) \
         RETURN type(r) AS relationship, count(r) AS total"
    ))
    .param("id", id)
}

/// Every edge whose endpoints are both members: the export is a closed
/// subgraph.
pub(crate) fn checkpoint_internal_edges(id: &str) -> Statement {
    Statement::new(format!(
        "MATCH (c:Checkpoint {{id: $id}})-[:{MEMBERSHIP_REL}]->(a:Entity) \
         MATCH (c)-[:{MEMBERSHIP_REL}]->(b:Entity) \
         MATCH (a)-[r]->(b) \
         RETURN DISTINCT r {{ .*, relationship: type(r), from_id: a.id, to_id: b.id }} AS relationship"
    ))
    .param("id", id)
}

pub(crate) fn upsert_entities(entities: &[Value]) -> Statement {
    Statement::new(
        "UNWIND $entities AS ent \
         MERGE (e:Entity {id: ent.id}) \
         SET e.entity_type = ent.entity_type \
         SET e += ent.properties",
    )
    .param("entities", Value::Array(entities.to_vec()))
}

/// Upsert one relationship type's worth of imported edges, keyed on
/// endpoints and type.
pub(crate) fn upsert_edges(relationship: &str, edges: &[Value]) -> Statement {
    Statement::new(format!(
        "UNWIND $edges AS edge \
         MATCH (a:Entity {{id: edge.from_id}}) \
         MATCH (b:Entity {{id: edge.to_id}}) \
         MERGE (a)-[r:`{relationship}`]->(b) \
         SET r += edge.properties \
         SET r.valid_from = edge.valid_from, r.valid_to = edge.valid_to, \
         r.change_set_id = edge.change_set_id"
    ))
    .param("edges", Value::Array(edges.to_vec()))
}

/// Upsert the imported checkpoint node so repeated identical imports
/// converge instead of piling up.
pub(crate) fn upsert_checkpoint(checkpoint: &Checkpoint) -> Statement {
    let metadata = match &checkpoint.metadata {
        Some(value) => Value::String(value.to_string()),
        None => Value::Null,
    };
    let seeds: Vec<Value> = checkpoint
        .seed_entities
        .iter()
        .map(|s| Value::from(s.as_str()))
        .collect();
    Statement::new(
        "MERGE (c:Checkpoint {id: $id}) \
         SET c.timestamp = $timestamp, c.reason = $reason, \
         c.seed_entities = $seed_entities, c.metadata = $metadata, c.imported = true",
    )
    .param("id", checkpoint.id.as_str())
    .param("timestamp", checkpoint.timestamp.to_millis())
    .param("reason", checkpoint.reason.as_str())
    .param("seed_entities", Value::Array(seeds))
    .param("metadata", metadata)
}

pub(crate) fn merge_membership(id: &str, member_ids: &[String]) -> Statement {
    let members: Vec<Value> = member_ids.iter().map(|s| Value::from(s.as_str())).collect();
    Statement::new(format!(
        "MATCH (c:Checkpoint {{id: $id}}) \
         MATCH (e:Entity) WHERE e.id IN $member_ids \
         MERGE (c)-[:{MEMBERSHIP_REL}]->(e)"
    ))
    .param("id", id)
    .param("member_ids", Value::Array(members))
}

pub(crate) fn delete_checkpoint(id: &str) -> Statement {
    Statement::new("MATCH (c:Checkpoint {id: $id}) DETACH DELETE c").param("id", id)
}

// --- pruning ----------------------------------------------------------------

pub(crate) fn count_prunable_checkpoints(cutoff: Timestamp) -> Statement {
    Statement::new("MATCH (c:Checkpoint) WHERE c.timestamp < $cutoff RETURN count(c) AS total")
        .param("cutoff", cutoff.to_millis())
}

pub(crate) fn delete_prunable_checkpoints(cutoff: Timestamp) -> Statement {
    Statement::new(
        "MATCH (c:Checkpoint) WHERE c.timestamp < $cutoff \
         WITH collect(c) AS doomed \
         FOREACH (x IN doomed | DETACH DELETE x) \
         RETURN size(doomed) AS total",
    )
    .param("cutoff", cutoff.to_millis())
}

pub(crate) fn count_prunable_edges(cutoff: Timestamp) -> Statement {
    Statement::new(
        "MATCH (:Entity)-[r]->(:Entity) \
         WHERE r.valid_to IS NOT NULL AND r.valid_to < $cutoff \
         RETURN count(r) AS total",
    )
    .param("cutoff", cutoff.to_millis())
}

pub(crate) fn delete_prunable_edges(cutoff: Timestamp) -> Statement {
    Statement::new(
        "MATCH (:Entity)-[r]->(:Entity) \
         WHERE r.valid_to IS NOT NULL AND r.valid_to < $cutoff \
         WITH collect(r) AS doomed \
         FOREACH (x IN doomed | DELETE x) \
         RETURN size(doomed) AS total",
    )
    .param("cutoff", cutoff.to_millis())
}

/// Versions older than the cutoff are deletable unless some remaining
/// checkpoint includes their entity; the pin is a query predicate, not a
/// constraint.
fn prunable_versions_clause() -> String {
    format!(
        "MATCH (v:Version)-[:{VERSION_REL}]->(e:Entity) \
         WHERE v.timestamp < $cutoff \
         AND NOT ((:Checkpoint)-[:{MEMBERSHIP_REL}]->(e))"
    )
}

pub(crate) fn count_prunable_versions(cutoff: Timestamp) -> Statement {
    Statement::new(format!(
        "{} RETURN count(v) AS total",
        prunable_versions_clause()
    ))
    .param("cutoff", cutoff.to_millis())
}

pub(crate) fn delete_prunable_versions(cutoff: Timestamp) -> Statement {
    Statement::new(format!(
        "{} WITH collect(v) AS doomed \
         FOREACH (x IN doomed | DETACH DELETE x) \
         RETURN size(doomed) AS total",
        prunable_versions_clause()
    ))
    .param("cutoff", cutoff.to_millis())
}

// --- metrics ----------------------------------------------------------------

pub(crate) fn metrics_batch() -> Vec<Statement> {
    vec![
        Statement::new("MATCH (v:Version) RETURN count(v) AS total"),
        Statement::new("MATCH (c:Checkpoint) RETURN count(c) AS total"),
        Statement::new(format!(
            "MATCH (c:Checkpoint) \
             OPTIONAL MATCH (c)-[m:{MEMBERSHIP_REL}]->(:Entity) \
             WITH c, count(m) AS members \
             RETURN avg(members) AS avg, min(members) AS min, max(members) AS max"
        )),
        Statement::new(
            "MATCH (:Entity)-[r]->(:Entity) \
             RETURN sum(CASE WHEN r.valid_to IS NULL THEN 1 ELSE 0 END) AS open, \
             sum(CASE WHEN r.valid_to IS NULL THEN 0 ELSE 1 END) AS closed",
        ),
    ]
}

// --- session analytics ------------------------------------------------------

pub(crate) fn relationship_timeline(
    from_id: &str,
    to_id: &str,
    relationship: &Option<String>,
    window: &TemporalRange,
    limit: usize,
) -> Statement {
    Statement::new(format!(
        "MATCH (a:Entity {{id: $from_id}})-[r]->(b:Entity {{id: $to_id}}) \
         WHERE ($relationship IS NULL OR type(r) = $relationship) \
         AND {structural} \
         AND ($since IS NULL OR coalesce(r.valid_from, {MIN_MILLIS}) >= $since) \
         AND ($until IS NULL OR coalesce(r.valid_from, {MIN_MILLIS}) <= $until) \
         RETURN r {{ .*, relationship: type(r), from_id: a.id, to_id: b.id }} AS relationship \
         ORDER BY coalesce(r.valid_from, {MIN_MILLIS}) ASC \
         LIMIT $limit",
        structural = structural_filter("r"),
    ))
    .param("from_id", from_id)
    .param("to_id", to_id)
    .param("relationship", opt_str(relationship))
    .param("since", opt_millis(&window.start))
    .param("until", opt_millis(&window.end))
    .param("limit", limit as i64)
}

pub(crate) fn session_versions(
    change_set_id: &str,
    window: &TemporalRange,
    limit: usize,
) -> Statement {
    Statement::new(
        "MATCH (v:Version {change_set_id: $change_set_id}) \
         WHERE ($since IS NULL OR v.timestamp >= $since) \
         AND ($until IS NULL OR v.timestamp <= $until) \
         RETURN v {.*} AS version \
         ORDER BY v.timestamp ASC \
         LIMIT $limit",
    )
    .param("change_set_id", change_set_id)
    .param("since", opt_millis(&window.start))
    .param("until", opt_millis(&window.end))
    .param("limit", limit as i64)
}

pub(crate) fn session_edges(
    change_set_id: &str,
    window: &TemporalRange,
    limit: usize,
) -> Statement {
    Statement::new(format!(
        "MATCH (a:Entity)-[r]->(b:Entity) \
         WHERE r.change_set_id = $change_set_id \
         AND ($since IS NULL OR coalesce(r.valid_from, {MIN_MILLIS}) >= $since) \
         AND ($until IS NULL OR coalesce(r.valid_from, {MIN_MILLIS}) <= $until) \
         RETURN r {{ .*, relationship: type(r), from_id: a.id, to_id: b.id }} AS relationship \
         ORDER BY coalesce(r.valid_from, {MIN_MILLIS}) ASC \
         LIMIT $limit"
    ))
    .param("change_set_id", change_set_id)
    .param("since", opt_millis(&window.start))
    .param("until", opt_millis(&window.end))
    .param("limit", limit as i64)
}

/// Sessions that recorded versions for an entity, aggregated per change-set.
pub(crate) fn sessions_from_versions(entity_id: &str) -> Statement {
    Statement::new(
        "MATCH (v:Version {entity_id: $entity_id}) \
         WHERE v.change_set_id IS NOT NULL \
         RETURN v.change_set_id AS change_set_id, count(v) AS changes, \
         min(v.timestamp) AS first_seen, max(v.timestamp) AS last_seen",
    )
    .param("entity_id", entity_id)
}

/// Sessions that opened or closed edges touching an entity.
pub(crate) fn sessions_from_edges(entity_id: &str) -> Statement {
    Statement::new(
        "MATCH (e:Entity {id: $entity_id})-[r]-(:Entity) \
         WHERE r.change_set_id IS NOT NULL \
         RETURN r.change_set_id AS change_set_id, count(r) AS changes, \
         min(r.valid_from) AS first_seen, max(r.valid_from) AS last_seen",
    )
    .param("entity_id", entity_id)
}

/// Identities carrying more than one open interval; a healthy graph returns
/// no rows.
pub(crate) fn open_edge_violations() -> Statement {
    Statement::new(
        "MATCH (a:Entity)-[r]->(b:Entity) \
         WHERE r.valid_to IS NULL \
         WITH a.id AS from_id, b.id AS to_id, type(r) AS relationship, count(r) AS open_count \
         WHERE open_count > 1 \
         RETURN from_id, to_id, relationship, open_count",
    )
}
