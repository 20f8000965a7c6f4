//! PostgreSQL backend implementation for orderstream-rdbc

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, Transaction};
use crate::error::{Error, Result};
use crate::types::Value;

type BoxedParam = Box<dyn tokio_postgres::types::ToSql + Sync + Send>;

/// Convert a Value to a tokio-postgres compatible parameter
fn value_to_sql(value: &Value) -> BoxedParam {
    match value {
        // every nullable column written by the engine is textual
        Value::Null => Box::new(Option::<String>::None),
        Value::Int64(n) => Box::new(*n),
        Value::Decimal(d) => Box::new(*d),
        Value::String(s) => Box::new(s.clone()),
        Value::DateTimeTz(dt) => Box::new(*dt),
    }
}

fn bind(params: &[Value]) -> Vec<BoxedParam> {
    params.iter().map(value_to_sql).collect()
}

fn param_refs(boxed: &[BoxedParam]) -> Vec<&(dyn tokio_postgres::types::ToSql + Sync)> {
    boxed
        .iter()
        .map(|b| b.as_ref() as &(dyn tokio_postgres::types::ToSql + Sync))
        .collect()
}

/// Name shown in `pg_stat_activity`
const APPLICATION_NAME: &str = "orderstream";

/// Classify a driver error by SQLSTATE
fn map_pg_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::unavailable_with_source("connection closed", e);
    }
    match e.as_db_error() {
        Some(db) => Error::from_sqlstate(db.code().code(), db.message(), db.constraint(), sql),
        // no server response: the socket failed mid-statement
        None => Error::unavailable_with_source(e.to_string(), e),
    }
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::unavailable("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        let boxed = bind(params);
        self.client
            .execute(sql, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.client
            .batch_execute("BEGIN")
            .await
            .map_err(|e| map_pg_error(e, "BEGIN"))?;

        Ok(Box::new(PgTransaction {
            client: Arc::clone(&self.client),
        }))
    }

    async fn is_valid(&self) -> bool {
        if self.ensure_open().is_err() {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// PostgreSQL transaction
///
/// Runs on the owning connection's client, so a connection must not be
/// shared by two concurrent transactions.
pub struct PgTransaction {
    client: Arc<tokio_postgres::Client>,
}

#[async_trait]
impl Transaction for PgTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let boxed = bind(params);
        self.client
            .execute(sql, &param_refs(&boxed))
            .await
            .map_err(|e| map_pg_error(e, sql))
    }

    async fn execute_many(&self, sql: &str, rows: &[Vec<Value>]) -> Result<u64> {
        let stmt = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| map_pg_error(e, sql))?;

        let mut affected = 0;
        for params in rows {
            let boxed = bind(params);
            affected += self
                .client
                .execute(&stmt, &param_refs(&boxed))
                .await
                .map_err(|e| map_pg_error(e, sql))?;
        }
        Ok(affected)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .map_err(|e| map_pg_error(e, "COMMIT"))
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .map_err(|e| map_pg_error(e, "ROLLBACK"))
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e: tokio_postgres::Error| Error::config(e.to_string()))?;

        let timeout = Duration::from_millis(config.connect_timeout_ms);
        pg_config.connect_timeout(timeout);
        pg_config.application_name(APPLICATION_NAME);

        let (client, connection) =
            tokio::time::timeout(timeout, pg_config.connect(tokio_postgres::NoTls))
                .await
                .map_err(|_| Error::timeout(format!("connect timed out after {:?}", timeout)))?
                .map_err(|e| Error::unavailable_with_source("failed to connect", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection terminated");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversion() {
        let _ = value_to_sql(&Value::Int64(42));
        let _ = value_to_sql(&Value::String("order_created".into()));
        let _ = value_to_sql(&Value::Null);
        let _ = value_to_sql(&Value::Decimal(rust_decimal::Decimal::new(66_67, 2)));
    }

    #[test]
    fn test_factory_name() {
        assert_eq!(PgConnectionFactory.name(), "postgres");
    }

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = PgConnectionFactory
            .connect(&ConnectionConfig::new("postgres://host:notaport/db"))
            .await;
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
