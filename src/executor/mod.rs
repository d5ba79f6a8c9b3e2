//! One-shot query execution against a chosen endpoint
//!
//! Every call opens its own connection and releases it before returning.
//! Release is tied to ownership: the connection is dropped on every exit
//! path, including errors and cancellation of the calling future.

mod mysql;

pub use mysql::{Credentials, MySqlConnector};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::time::timeout;
use tracing::debug;

use crate::cluster::Address;
use crate::config::DatabaseConfig;
use crate::protocol::{ColumnDefinition, TextRow};

/// Upper bound for the polite COM_QUIT on release
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Opens database connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &Address) -> Result<Box<dyn Connection>, ExecuteError>;
}

/// An open database connection
///
/// Dropping the value releases the underlying socket.
#[async_trait]
pub trait Connection: Send {
    async fn query(&mut self, sql: &str) -> Result<QueryResult, ExecuteError>;

    /// Close politely before release
    async fn close(self: Box<Self>);
}

/// Execution errors, split by whether another endpoint could help
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecuteError {
    /// Network, handshake or authentication failure
    #[error("Connection to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },

    /// The query failed or its result could not be decoded
    #[error("Query on {addr} failed: {reason}")]
    Query { addr: String, reason: String },
}

impl ExecuteError {
    pub fn connection(addr: &Address, reason: impl fmt::Display) -> Self {
        ExecuteError::Connection {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn query(addr: &Address, reason: impl fmt::Display) -> Self {
        ExecuteError::Query {
            addr: addr.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, ExecuteError::Connection { .. })
    }
}

/// Rows of one result set, in server column order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub(crate) fn with_columns(columns: &[ColumnDefinition]) -> Self {
        Self::new(columns.iter().map(|c| c.name.clone()).collect(), Vec::new())
    }

    pub(crate) fn push_text_row(&mut self, columns: &[ColumnDefinition], row: TextRow) {
        let values = columns
            .iter()
            .zip(row.values)
            .map(|(column, value)| text_value(column, value))
            .collect();
        self.rows.push(values);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Map a text-protocol value to JSON, keeping numbers numeric
fn text_value(column: &ColumnDefinition, value: Option<String>) -> Value {
    let Some(text) = value else {
        return Value::Null;
    };
    if column.is_integer() {
        if let Ok(n) = text.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(n) = text.parse::<u64>() {
            return Value::from(n);
        }
    } else if column.is_float() {
        if let Some(n) = text.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
            return Value::Number(n);
        }
    }
    Value::String(text)
}

/// Serializes as a list of `{column: value}` objects
impl Serialize for QueryResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct RowRef<'a>(&'a [String], &'a [Value]);

        impl Serialize for RowRef<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for (column, value) in self.0.iter().zip(self.1) {
                    map.serialize_entry(column, value)?;
                }
                map.end()
            }
        }

        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for row in self.rows() {
            seq.serialize_element(&RowRef(self.columns(), row))?;
        }
        seq.end()
    }
}

/// Timeouts applied to one execution
#[derive(Debug, Clone, Copy)]
pub struct ExecutorTimeouts {
    pub connect: Duration,
    pub query: Duration,
}

impl From<&DatabaseConfig> for ExecutorTimeouts {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            connect: Duration::from_millis(config.connect_timeout_ms),
            query: Duration::from_millis(config.query_timeout_ms),
        }
    }
}

/// Runs one query per call on a fresh connection
#[derive(Clone)]
pub struct QueryExecutor {
    connector: Arc<dyn Connector>,
    timeouts: ExecutorTimeouts,
}

impl QueryExecutor {
    pub fn new(connector: Arc<dyn Connector>, timeouts: ExecutorTimeouts) -> Self {
        Self {
            connector,
            timeouts,
        }
    }

    /// Executor backed by the in-crate MySQL client
    pub fn mysql(config: &DatabaseConfig) -> Self {
        Self::new(
            Arc::new(MySqlConnector::new(Credentials::from(config))),
            ExecutorTimeouts::from(config),
        )
    }

    /// Open a connection, run `sql`, collect every row, release the connection
    pub async fn execute(&self, addr: &Address, sql: &str) -> Result<QueryResult, ExecuteError> {
        let mut conn = match timeout(self.timeouts.connect, self.connector.connect(addr)).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(ExecuteError::connection(
                    addr,
                    format!("connect timed out after {:?}", self.timeouts.connect),
                ))
            }
        };

        let result = match timeout(self.timeouts.query, conn.query(sql)).await {
            Ok(result) => result,
            Err(_) => Err(ExecuteError::query(
                addr,
                format!("query timed out after {:?}", self.timeouts.query),
            )),
        };

        if let Err(ref e) = result {
            debug!(addr = %addr, error = %e, "Query failed, releasing connection");
        }

        // The connection is consumed here; if the close itself stalls, dropping
        // the timed-out future drops the connection with it.
        let _ = timeout(CLOSE_TIMEOUT, conn.close()).await;

        result
    }
}
