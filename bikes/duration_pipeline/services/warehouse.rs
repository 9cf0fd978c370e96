use std::{collections::HashMap, fmt};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors surfaced by warehouse clients.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// Network or HTTP client failure.
    #[error("transport error: {0}")]
    Transport(String),
    /// The service rejected or failed the job (syntax, permissions, quota).
    #[error("query failed: {0}")]
    Query(String),
    /// Referenced table does not exist.
    #[error("table not found: {0}")]
    NotFound(String),
    /// Response could not be decoded.
    #[error("malformed response: {0}")]
    Decode(String),
    /// Job did not complete within the configured number of polls.
    #[error("job {job_id} still running after {polls} polls")]
    Timeout {
        /// Service-assigned job id.
        job_id: String,
        /// Polls performed.
        polls: u32,
    },
}

/// Fully qualified table reference (`project.dataset.table`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Owning project.
    pub project: String,
    /// Dataset.
    pub dataset: String,
    /// Table name.
    pub table: String,
}

impl TableRef {
    /// Creates a reference.
    #[must_use]
    pub fn new(
        project: impl Into<String>,
        dataset: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// `project.dataset.table` without quoting.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}.{}.{}", self.project, self.dataset, self.table)
    }

    /// `project.dataset` quoted for SQL.
    #[must_use]
    pub fn quoted_dataset(&self) -> String {
        format!("`{}.{}`", self.project, self.dataset)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.qualified())
    }
}

/// A query submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryJob {
    /// SQL text, possibly a multi-statement script.
    pub sql: String,
    /// Region hint.
    pub location: String,
    /// Always `false` for this pipeline; kept explicit on the wire.
    pub use_legacy_sql: bool,
}

impl QueryJob {
    /// Standard-SQL job in `location`.
    #[must_use]
    pub fn standard(sql: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            location: location.into(),
            use_legacy_sql: false,
        }
    }
}

/// Outcome of a successful job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    /// Service-assigned job id, when the service reports one.
    pub job_id: Option<String>,
}

/// Column names plus row values, as returned by the warehouse.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    /// Column names in order.
    pub columns: Vec<String>,
    /// Row cells, aligned with `columns`.
    pub rows: Vec<Vec<Value>>,
}

impl TableData {
    /// Creates a table.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    /// Position of a column.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Warehouse used by the feature build and training steps.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Runs a job to completion.
    async fn execute(&self, job: &QueryJob) -> Result<JobSummary, WarehouseError>;

    /// Reads every row of `table`.
    async fn read_table(&self, table: &TableRef, location: &str)
        -> Result<TableData, WarehouseError>;
}

/// In-memory warehouse for tests and dry runs.
///
/// `execute` only records the job; tables are seeded with [`Self::with_table`].
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    tables: Mutex<HashMap<String, TableData>>,
    jobs: Mutex<Vec<QueryJob>>,
    execute_failure: Option<String>,
    read_failure: Option<String>,
}

impl MemoryWarehouse {
    /// Empty warehouse.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a table.
    #[must_use]
    pub fn with_table(self, table: &TableRef, data: TableData) -> Self {
        self.tables.lock().insert(table.qualified(), data);
        self
    }

    /// Makes every `execute` call fail with `message`.
    #[must_use]
    pub fn failing_execute(mut self, message: impl Into<String>) -> Self {
        self.execute_failure = Some(message.into());
        self
    }

    /// Makes every `read_table` call fail with `message`.
    #[must_use]
    pub fn failing_read(mut self, message: impl Into<String>) -> Self {
        self.read_failure = Some(message.into());
        self
    }

    /// Jobs submitted so far.
    #[must_use]
    pub fn executed(&self) -> Vec<QueryJob> {
        self.jobs.lock().clone()
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn execute(&self, job: &QueryJob) -> Result<JobSummary, WarehouseError> {
        self.jobs.lock().push(job.clone());
        if let Some(message) = &self.execute_failure {
            return Err(WarehouseError::Query(message.clone()));
        }
        let count = self.jobs.lock().len();
        Ok(JobSummary {
            job_id: Some(format!("memory-job-{count}")),
        })
    }

    async fn read_table(
        &self,
        table: &TableRef,
        _location: &str,
    ) -> Result<TableData, WarehouseError> {
        if let Some(message) = &self.read_failure {
            return Err(WarehouseError::Transport(message.clone()));
        }
        self.tables
            .lock()
            .get(&table.qualified())
            .cloned()
            .ok_or_else(|| WarehouseError::NotFound(table.qualified()))
    }
}
