use std::future::Future;
use std::time::Duration;

use neo4rs::{query, ConfigBuilder, Graph, Query, Row, Txn};
use tracing::warn;

use storygraph_common::{Config, StoreResult, StoryGraphError};

/// Thin wrapper around neo4rs::Graph providing connection setup,
/// bounded operations and transaction helpers.
#[derive(Clone)]
pub struct GraphClient {
    pub(crate) graph: Graph,
    op_timeout: Duration,
}

impl GraphClient {
    /// Connect to Neo4j with the given credentials and default store settings.
    pub async fn connect(uri: &str, user: &str, password: &str) -> StoreResult<Self> {
        Self::connect_with(&Config::new(uri, user, password)).await
    }

    pub async fn connect_with(config: &Config) -> StoreResult<Self> {
        let mut builder = ConfigBuilder::default()
            .uri(config.neo4j_uri.as_str())
            .user(config.neo4j_user.as_str())
            .password(config.neo4j_password.as_str())
            .fetch_size(config.fetch_size)
            .max_connections(config.max_connections);
        if let Some(db) = &config.neo4j_database {
            builder = builder.db(db.as_str());
        }
        let neo_config = builder
            .build()
            .map_err(|e| StoryGraphError::Config(e.to_string()))?;

        let graph = tokio::time::timeout(config.op_timeout, Graph::connect(neo_config))
            .await
            .map_err(|_| {
                StoryGraphError::StoreUnavailable(format!(
                    "connecting to {} timed out after {:?}",
                    config.neo4j_uri, config.op_timeout
                ))
            })?
            .map_err(db_err)?;

        Ok(Self {
            graph,
            op_timeout: config.op_timeout,
        })
    }

    /// Get a reference to the underlying neo4rs Graph.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// Round-trip a trivial query to prove the store is reachable.
    pub async fn ping(&self) -> StoreResult<()> {
        self.bounded("ping", async {
            let mut stream = self
                .graph
                .execute(query("RETURN 1 AS ok"))
                .await
                .map_err(db_err)?;
            match stream.next().await.map_err(db_err)? {
                Some(_) => Ok(()),
                None => Err(StoryGraphError::StoreUnavailable(
                    "connection test returned no rows".to_string(),
                )),
            }
        })
        .await
    }

    /// Run `fut` under the operation timeout. Expiry drops the future,
    /// which discards any transaction it holds.
    pub(crate) async fn bounded<T, F>(&self, op: &'static str, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.op_timeout.as_millis() as u64, "Store operation timed out");
                Err(StoryGraphError::StoreUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.op_timeout
                )))
            }
        }
    }

    pub(crate) async fn begin(&self) -> StoreResult<Txn> {
        self.graph.start_txn().await.map_err(db_err)
    }

    /// Commit on success, roll back on failure. The operation's own error wins
    /// over a rollback failure.
    pub(crate) async fn finish<T>(&self, txn: Txn, result: StoreResult<T>) -> StoreResult<T> {
        match result {
            Ok(value) => {
                txn.commit().await.map_err(db_err)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = txn.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed after aborted operation");
                }
                Err(e)
            }
        }
    }
}

/// Execute `q` inside `txn` and collect every row.
pub(crate) async fn fetch_all(txn: &mut Txn, q: Query) -> StoreResult<Vec<Row>> {
    let mut stream = txn.execute(q).await.map_err(db_err)?;
    let mut rows = Vec::new();
    while let Some(row) = stream.next(txn.handle()).await.map_err(db_err)? {
        rows.push(row);
    }
    Ok(rows)
}

pub(crate) async fn fetch_one(txn: &mut Txn, q: Query) -> StoreResult<Option<Row>> {
    Ok(fetch_all(txn, q).await?.into_iter().next())
}

pub(crate) async fn run(txn: &mut Txn, q: Query) -> StoreResult<()> {
    txn.run(q).await.map_err(db_err)
}

/// Classify a driver error into the store's error taxonomy.
pub(crate) fn db_err(e: neo4rs::Error) -> StoryGraphError {
    match &e {
        neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError => {
            StoryGraphError::StoreUnavailable(e.to_string())
        }
        neo4rs::Error::Neo4j(inner) => classify_code(inner.code(), e.to_string()),
        _ => StoryGraphError::Database(e.to_string()),
    }
}

fn classify_code(code: &str, message: String) -> StoryGraphError {
    match code {
        "Neo.ClientError.Schema.ConstraintValidationFailed"
        | "Neo.ClientError.Transaction.LockClientStopped"
        | "Neo.ClientError.Transaction.Terminated" => StoryGraphError::ConcurrentModification(message),
        "Neo.ClientError.Database.DatabaseNotFound" => StoryGraphError::StoreUnavailable(message),
        c if c.starts_with("Neo.TransientError.Transaction.") => {
            StoryGraphError::ConcurrentModification(message)
        }
        c if c.starts_with("Neo.TransientError.") => StoryGraphError::StoreUnavailable(message),
        _ => StoryGraphError::Database(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use storygraph_common::ErrorKind;

    #[test]
    fn deadlocks_surface_as_concurrent_modification() {
        let err = classify_code("Neo.TransientError.Transaction.DeadlockDetected", "deadlock".into());
        assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
    }

    #[test]
    fn constraint_conflicts_surface_as_concurrent_modification() {
        let err = classify_code("Neo.ClientError.Schema.ConstraintValidationFailed", "dup".into());
        assert_eq!(err.kind(), ErrorKind::ConcurrentModification);
    }

    #[test]
    fn unavailable_database_surfaces_as_store_unavailable() {
        let err = classify_code("Neo.TransientError.General.DatabaseUnavailable", "down".into());
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    }

    #[test]
    fn syntax_errors_are_database_errors() {
        let err = classify_code("Neo.ClientError.Statement.SyntaxError", "bad".into());
        assert_eq!(err.kind(), ErrorKind::DatabaseError);
    }

    #[test]
    fn connection_errors_surface_as_store_unavailable() {
        assert_eq!(
            db_err(neo4rs::Error::ConnectionError).kind(),
            ErrorKind::StoreUnavailable
        );
    }
}
