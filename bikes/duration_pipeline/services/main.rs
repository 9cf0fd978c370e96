//! Clients for the managed services the pipeline drives.
//!
//! Each seam is a trait so steps can run against the real cloud APIs or the
//! in-memory doubles used in tests and dry runs.

/// Warehouse trait, table model and in-memory warehouse.
pub mod warehouse;
/// BigQuery REST implementation of [`warehouse::Warehouse`].
pub mod bigquery;
/// Object storage trait with GCS, local-directory and in-memory stores.
pub mod storage;
/// E-mail delivery.
pub mod mail;
#[cfg(test)]
mod stub_server;

pub use bigquery::BigQueryWarehouse;
pub use mail::{EmailMessage, HttpMailRelay, LogMailer, MailError, Mailer, MemoryMailer};
pub use storage::{
    GcsObjectStore, LocalObjectStore, MemoryObjectStore, ObjectLocation, ObjectStore, StorageError,
    StoredObject,
};
pub use warehouse::{
    JobSummary, MemoryWarehouse, QueryJob, TableData, TableRef, Warehouse, WarehouseError,
};
