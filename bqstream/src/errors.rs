//! Error types for bqstream.
//!
//! This module provides error types for all failure scenarios in the change
//! capture pipeline. The error design follows these principles:
//!
//! - **Rich error information**: Include context to help diagnose issues
//! - **Type safety**: Different error types for different subsystems
//! - **Actionable**: Callers can determine how to handle each error
//! - **Composable**: Errors can be converted between layers
//!
//! # Error Categories
//!
//! - **ConfigError**: Enrollment and configuration failures (fail fast)
//! - **CaptureError**: Change extraction failures
//! - **QueueError**: Durable queue storage failures
//! - **CursorError**: Backfill cursor storage failures
//! - **SourceError**: Host-table read failures
//! - **WarehouseError**: Warehouse RPC failures (transient, retried next tick)
//! - **DispatchError**: Dispatch tick failures, composed from the layers above
//! - **ArchiveError**: Archive run failures
//! - **AuditError**: Audit sampling failures

use crate::types::{AttributeName, TableName};
use thiserror::Error;

/// Errors raised while building a configuration or enrolling a table.
///
/// Configuration errors are detected at startup, before any change is
/// captured. A process that gets past enrollment never sees one of these at
/// runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An `Only`/`Except` capture mode was given an empty attribute list.
    #[error("capture mode for table '{0}' was given an empty attribute list")]
    EmptyAttributeList(TableName),

    /// A capture mode named an attribute the table does not have.
    #[error("table '{table}' has no attribute '{attribute}'")]
    UnknownAttribute {
        /// The table being enrolled
        table: TableName,
        /// The attribute that is not one of its columns
        attribute: AttributeName,
    },

    /// The table was already enrolled; exactly one capture mode is allowed
    /// per table.
    #[error("table '{0}' is already enrolled for change capture")]
    AlreadyEnrolled(TableName),

    /// An operation referenced a table that was never enrolled.
    #[error("table '{0}' is not enrolled for change capture")]
    NotEnrolled(TableName),

    /// The configured timezone name was not recognized.
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),

    /// The configured batch size was outside 1..=10_000.
    #[error("batch size {0} is outside the permitted range 1..=10000")]
    InvalidBatchSize(usize),

    /// A required configuration value was missing.
    #[error("missing configuration value: {0}")]
    Missing(&'static str),
}

/// Errors that can occur when interacting with the durable queue store.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// The underlying storage failed.
    #[error("queue storage failed: {0}")]
    Storage(String),
}

/// Errors that can occur when interacting with the backfill cursor store.
#[derive(Debug, Clone, Error)]
pub enum CursorError {
    /// The underlying storage failed.
    #[error("cursor storage failed: {0}")]
    Storage(String),
}

/// Errors that can occur when reading enrolled host tables.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The reader has no table by this name.
    #[error("source has no table '{0}'")]
    UnknownTable(TableName),

    /// The underlying storage failed.
    #[error("source read failed: {0}")]
    Storage(String),
}

/// Errors that can occur when talking to the warehouse.
///
/// These are the transient delivery errors of the pipeline: a failed insert
/// leaves the durable queue untouched and the next scheduled tick retries.
#[derive(Debug, Clone, Error)]
pub enum WarehouseError {
    /// The transport to the warehouse failed (network, auth, availability).
    #[error("warehouse transport failed: {0}")]
    Transport(String),

    /// The warehouse rejected an insert call.
    #[error("warehouse rejected insert into '{table}': {reason}")]
    InsertRejected {
        /// The target table of the rejected insert
        table: String,
        /// The reason reported by the warehouse
        reason: String,
    },

    /// A query response could not be interpreted.
    #[error("malformed warehouse response: {0}")]
    MalformedResponse(String),
}

/// Errors that can occur while extracting changes from a commit notice.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The captured records could not be enqueued.
    #[error("failed to enqueue captured changes: {0}")]
    Queue(#[from] QueueError),
}

/// Errors that can occur during a dispatch tick.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// The durable queue failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// The backfill cursor store failed.
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// A host-table read failed while topping up the queue.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// The warehouse insert failed; queue state was left unchanged.
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
}

/// Errors that can occur during an archive run.
#[derive(Debug, Clone, Error)]
pub enum ArchiveError {
    /// The archive referenced a table that was never enrolled.
    #[error("table '{0}' is not enrolled for change capture")]
    NotEnrolled(TableName),

    /// A partial archive named an attribute outside the table's allow-list.
    #[error("attribute '{attribute}' of table '{table}' is not tracked")]
    UntrackedAttribute {
        /// The table being archived
        table: TableName,
        /// The attribute outside its allow-list
        attribute: AttributeName,
    },

    /// The backfill cursor store failed.
    #[error("cursor error: {0}")]
    Cursor(#[from] CursorError),

    /// A host-table read failed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// A warehouse call failed.
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),
}

/// Errors that can occur while sampling the warehouse against the source.
#[derive(Debug, Clone, Error)]
pub enum AuditError {
    /// A warehouse query failed.
    #[error("warehouse error: {0}")]
    Warehouse(#[from] WarehouseError),

    /// A host-table read failed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),
}

/// Type alias for configuration results.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Type alias for queue store results.
pub type QueueResult<T> = Result<T, QueueError>;

/// Type alias for cursor store results.
pub type CursorResult<T> = Result<T, CursorError>;

/// Type alias for host-table read results.
pub type SourceResult<T> = Result<T, SourceError>;

/// Type alias for warehouse results.
pub type WarehouseResult<T> = Result<T, WarehouseError>;

/// Type alias for capture results.
pub type CaptureResult<T> = Result<T, CaptureError>;

/// Type alias for dispatch results.
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Type alias for archive results.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Type alias for audit results.
pub type AuditResult<T> = Result<T, AuditError>;
