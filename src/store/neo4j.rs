use async_trait::async_trait;
use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    Graph, Query,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};

use super::{GraphStore, Row, Statement};

/// Neo4j-protocol implementation of the graph store capability.
///
/// The engine never touches this type outside construction; everything else
/// goes through the `GraphStore` trait. Failures are wrapped with the calling
/// operation and surfaced unchanged — retry policy belongs to callers.
pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    /// Connect a pooled client using the engine configuration.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store_config = neo4rs::ConfigBuilder::default()
            .uri(&config.store_uri)
            .user(&config.store_username)
            .password(&config.store_password)
            .db(config.database.as_str())
            .fetch_size(config.fetch_size)
            .max_connections(config.max_connections)
            .build()
            .map_err(|e| Error::store("configure store", e))?;

        let graph = Graph::connect(store_config)
            .await
            .map_err(|e| Error::store("connect", e))?;

        info!("connected to graph store at {}", config.store_uri);

        Ok(Self { graph })
    }

    fn build_query(statement: &Statement) -> Query {
        let mut q = query(&statement.text);
        for (key, value) in &statement.params {
            q = q.param(key, json_to_bolt(value));
        }
        q
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn run(&self, statement: Statement) -> Result<Vec<Row>> {
        debug!(query = %statement.text, "run");
        let mut stream = self
            .graph
            .execute(Self::build_query(&statement))
            .await
            .map_err(|e| Error::store("run", e))?;

        let mut rows = Vec::new();
        while let Some(row) = stream.next().await.map_err(|e| Error::store("run", e))? {
            rows.push(row_to_map(&row, "run")?);
        }
        Ok(rows)
    }

    async fn run_batch(&self, statements: Vec<Statement>) -> Result<Vec<Vec<Row>>> {
        debug!(statements = statements.len(), "run_batch");
        let mut txn = self
            .graph
            .start_txn()
            .await
            .map_err(|e| Error::store("run_batch", e))?;

        let mut groups = Vec::with_capacity(statements.len());
        for statement in &statements {
            let mut stream = txn
                .execute(Self::build_query(statement))
                .await
                .map_err(|e| Error::store("run_batch", e))?;
            let mut rows = Vec::new();
            while let Some(row) = stream
                .next(txn.handle())
                .await
                .map_err(|e| Error::store("run_batch", e))?
            {
                rows.push(row_to_map(&row, "run_batch")?);
            }
            groups.push(rows);
        }

        txn.commit()
            .await
            .map_err(|e| Error::store("run_batch", e))?;
        Ok(groups)
    }

    async fn close(&self) -> Result<()> {
        // The pooled client releases connections on drop; nothing to flush.
        debug!("close");
        Ok(())
    }
}

fn row_to_map(row: &neo4rs::Row, context: &str) -> Result<Row> {
    let value: Value = row
        .to::<Value>()
        .map_err(|e| Error::store(context.to_string(), e))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::store_msg(
            context,
            format!("expected object row, got {}", other),
        )),
    }
}

fn json_to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(BoltInteger::new(i)),
            None => BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or(0.0))),
        },
        Value::String(s) => BoltType::String(BoltString::new(s)),
        Value::Array(items) => {
            BoltType::List(BoltList::from(
                items.iter().map(json_to_bolt).collect::<Vec<_>>(),
            ))
        }
        Value::Object(map) => {
            let mut bolt = BoltMap::default();
            for (key, item) in map {
                bolt.put(BoltString::new(key), json_to_bolt(item));
            }
            BoltType::Map(bolt)
        }
    }
}
