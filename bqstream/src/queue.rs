//! The durable change queue.
//!
//! Captured changes land here before anything is sent anywhere: the queue
//! is the write-ahead log of the pipeline. Entries are only marked sent
//! after a confirmed warehouse insert and only garbage-collected once
//! sent, so a crash at any point yields duplicate delivery, never loss.

use crate::errors::QueueResult;
use crate::types::{AttributeName, ChangeId, TableName, Timestamp, INSERT_ROW_CEILING};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The payload recorded for a destroy sentinel.
pub const DESTROY_SENTINEL_VALUE: &[u8] = b"True";

/// One captured per-attribute change, queued for delivery.
///
/// `attribute = None` is the destroy sentinel for `record_id`; every other
/// entry records the post-change value of a single tracked attribute.
/// `new_value` holds raw bytes; UTF-8 sanitizing is deferred to dispatch so
/// nothing captured is ever rejected at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedChange {
    /// Unique identifier for this queue entry
    pub id: ChangeId,
    /// The enrolled table the change belongs to
    pub table_name: TableName,
    /// The mutated row's primary key
    pub record_id: i64,
    /// The changed attribute, or `None` for a destroy sentinel
    pub attribute: Option<AttributeName>,
    /// The post-change value, or `None` for NULL
    pub new_value: Option<Vec<u8>>,
    /// When the change was observed
    pub observed_at: Timestamp,
    /// Whether this entry has been delivered to the warehouse
    pub sent: bool,
    /// When the entry was delivered, if it has been
    pub sent_at: Option<Timestamp>,
}

impl QueuedChange {
    /// Creates an unsent entry for one attribute change.
    pub fn attribute_change(
        table_name: TableName,
        record_id: i64,
        attribute: AttributeName,
        new_value: Option<Vec<u8>>,
        observed_at: Timestamp,
    ) -> Self {
        Self {
            id: ChangeId::new(),
            table_name,
            record_id,
            attribute: Some(attribute),
            new_value,
            observed_at,
            sent: false,
            sent_at: None,
        }
    }

    /// Creates the destroy sentinel for a record.
    pub fn destroy_sentinel(table_name: TableName, record_id: i64, observed_at: Timestamp) -> Self {
        Self {
            id: ChangeId::new(),
            table_name,
            record_id,
            attribute: None,
            new_value: Some(DESTROY_SENTINEL_VALUE.to_vec()),
            observed_at,
            sent: false,
            sent_at: None,
        }
    }

    /// Whether this entry is a destroy sentinel.
    pub const fn is_destroy_sentinel(&self) -> bool {
        self.attribute.is_none()
    }
}

/// Storage port for the durable change queue.
///
/// Implementations must preserve the at-least-once contract: entries are
/// deleted only by [`delete_sent`](QueueStore::delete_sent), and only
/// [`mark_sent`](QueueStore::mark_sent) - called after a confirmed
/// warehouse insert - transitions them to sent.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Appends a batch of entries in a single storage write.
    async fn enqueue(&self, records: Vec<QueuedChange>) -> QueueResult<()>;

    /// Returns the oldest unsent entries, FIFO by `observed_at`, up to
    /// `min(limit, INSERT_ROW_CEILING)`.
    ///
    /// Dequeuing does not mutate anything; the same entries are returned
    /// again until they are marked sent.
    async fn dequeue_batch(&self, limit: usize) -> QueueResult<Vec<QueuedChange>>;

    /// Marks the given entries sent, stamping `sent_at`.
    ///
    /// Idempotent: entries already sent keep their original `sent_at`, and
    /// unknown ids are ignored.
    async fn mark_sent(&self, ids: &[ChangeId]) -> QueueResult<()>;

    /// Deletes every sent entry, returning how many were removed.
    async fn delete_sent(&self) -> QueueResult<usize>;

    /// The number of unsent entries.
    async fn pending_count(&self) -> QueueResult<usize>;
}

/// Spare room in the queue for backfill, given the configured batch size.
///
/// `max(0, batch_size - pending - buffered)`, where `buffered` counts
/// entries staged in memory but not yet enqueued.
pub fn available_capacity(batch_size: usize, pending: usize, buffered: usize) -> usize {
    batch_size
        .min(INSERT_ROW_CEILING)
        .saturating_sub(pending)
        .saturating_sub(buffered)
}
