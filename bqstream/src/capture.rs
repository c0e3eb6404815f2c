//! Change capture.
//!
//! The host persistence layer owns transactions; this module owns what
//! becomes of them. During a transaction the host accumulates writes into
//! a [`TransactionContext`]; on commit the context is consumed into
//! [`CommitNotice`]s and handed to the [`ChangeExtractor`], which turns
//! them into queued per-attribute changes. On rollback the context is
//! simply dropped - nothing was written to the queue, so nothing needs
//! undoing.
//!
//! Net-change semantics: an attribute written and later restored to its
//! initial value within the same transaction produces no change record.

use crate::config::StreamConfig;
use crate::errors::CaptureResult;
use crate::queue::{QueueStore, QueuedChange};
use crate::registry::TableRegistry;
use crate::source::AttributeValue;
use crate::types::{AttributeName, TableName, Timestamp};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// A committed mutation reported by the host persistence layer.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitNotice {
    /// A row was created.
    Created {
        /// The mutated table
        table: TableName,
        /// The new row's primary key
        record_id: i64,
        /// The row's post-create attribute values
        row: BTreeMap<AttributeName, AttributeValue>,
        /// When the owning transaction committed
        committed_at: Timestamp,
    },
    /// A row was updated.
    Updated {
        /// The mutated table
        table: TableName,
        /// The updated row's primary key
        record_id: i64,
        /// Net post-commit values of the attributes that changed
        changes: BTreeMap<AttributeName, AttributeValue>,
        /// When the owning transaction committed
        committed_at: Timestamp,
    },
    /// A row was destroyed.
    Destroyed {
        /// The mutated table
        table: TableName,
        /// The destroyed row's primary key
        record_id: i64,
        /// When the owning transaction committed
        committed_at: Timestamp,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFate {
    Created,
    Updated,
    Destroyed,
}

#[derive(Debug)]
struct TrackedRow {
    fate: RowFate,
    // First-seen pre-write values, captured once per attribute
    initial: BTreeMap<AttributeName, AttributeValue>,
    // Latest written values
    current: BTreeMap<AttributeName, AttributeValue>,
}

/// Accumulates one transaction's writes until its outcome is known.
///
/// The host creates one context per transaction, feeds every write through
/// it, and on commit calls [`into_commits`](Self::into_commits). On
/// rollback the context is dropped; there is no clear-and-reuse path.
#[derive(Debug, Default)]
pub struct TransactionContext {
    rows: BTreeMap<(TableName, i64), TrackedRow>,
}

impl TransactionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the transaction created a row with the given values.
    pub fn record_created(
        &mut self,
        table: TableName,
        record_id: i64,
        row: impl IntoIterator<Item = (AttributeName, AttributeValue)>,
    ) {
        self.rows.insert(
            (table, record_id),
            TrackedRow {
                fate: RowFate::Created,
                initial: BTreeMap::new(),
                current: row.into_iter().collect(),
            },
        );
    }

    /// Records one attribute write.
    ///
    /// The first write per attribute captures `old` as the value to diff
    /// against at commit; later writes to the same attribute only move the
    /// current value, so a write that restores the initial value cancels
    /// out.
    pub fn record_write(
        &mut self,
        table: TableName,
        record_id: i64,
        attribute: AttributeName,
        old: AttributeValue,
        new: AttributeValue,
    ) {
        let row = self.rows.entry((table, record_id)).or_insert(TrackedRow {
            fate: RowFate::Updated,
            initial: BTreeMap::new(),
            current: BTreeMap::new(),
        });
        if row.fate == RowFate::Updated {
            row.initial.entry(attribute.clone()).or_insert(old);
        }
        row.current.insert(attribute, new);
    }

    /// Records that the transaction destroyed a row.
    ///
    /// Destroy wins over anything else the transaction did to the row; a
    /// row created and destroyed in one transaction yields only the
    /// destroy sentinel.
    pub fn record_destroyed(&mut self, table: TableName, record_id: i64) {
        let row = self.rows.entry((table, record_id)).or_insert(TrackedRow {
            fate: RowFate::Destroyed,
            initial: BTreeMap::new(),
            current: BTreeMap::new(),
        });
        row.fate = RowFate::Destroyed;
    }

    /// Whether the transaction touched any row.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consumes the context into commit notices, one per mutated row.
    ///
    /// Updated rows whose writes all cancelled out produce no notice.
    pub fn into_commits(self, committed_at: Timestamp) -> Vec<CommitNotice> {
        let mut notices = Vec::with_capacity(self.rows.len());

        for ((table, record_id), row) in self.rows {
            match row.fate {
                RowFate::Created => notices.push(CommitNotice::Created {
                    table,
                    record_id,
                    row: row.current,
                    committed_at,
                }),
                RowFate::Updated => {
                    let changes: BTreeMap<_, _> = row
                        .current
                        .into_iter()
                        .filter(|(attribute, value)| {
                            row.initial.get(attribute) != Some(value)
                        })
                        .collect();
                    if !changes.is_empty() {
                        notices.push(CommitNotice::Updated {
                            table,
                            record_id,
                            changes,
                            committed_at,
                        });
                    }
                }
                RowFate::Destroyed => notices.push(CommitNotice::Destroyed {
                    table,
                    record_id,
                    committed_at,
                }),
            }
        }

        notices
    }
}

/// What became of one capture call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOutcome {
    /// Change records written to the durable queue
    pub queued: usize,
    /// Records dropped because their table is not enrolled
    pub skipped: usize,
}

impl CaptureOutcome {
    fn absorb(&mut self, other: Self) {
        self.queued += other.queued;
        self.skipped += other.skipped;
    }
}

/// Turns commit notices into queued per-attribute changes.
pub struct ChangeExtractor<Q> {
    config: Arc<StreamConfig>,
    registry: Arc<TableRegistry>,
    queue: Arc<Q>,
}

impl<Q: QueueStore> ChangeExtractor<Q> {
    /// Creates an extractor over the given queue store.
    pub fn new(config: Arc<StreamConfig>, registry: Arc<TableRegistry>, queue: Arc<Q>) -> Self {
        Self {
            config,
            registry,
            queue,
        }
    }

    /// Captures every notice of a committed transaction.
    pub async fn on_transaction_commit(
        &self,
        context: TransactionContext,
        committed_at: Timestamp,
    ) -> CaptureResult<CaptureOutcome> {
        let mut outcome = CaptureOutcome::default();
        for notice in context.into_commits(committed_at) {
            outcome.absorb(self.on_committed(notice).await?);
        }
        Ok(outcome)
    }

    /// Captures one committed mutation.
    ///
    /// A notice for an unenrolled table is logged and counted as skipped;
    /// it never fails the caller. Queue storage failures do fail the
    /// caller - losing the write-ahead record is not a per-record
    /// condition.
    pub async fn on_committed(&self, notice: CommitNotice) -> CaptureResult<CaptureOutcome> {
        let records = match notice {
            CommitNotice::Created {
                table,
                record_id,
                row,
                committed_at,
            } => {
                let Some(enrollment) = self.registry.enrollment(&table) else {
                    return Ok(self.skip(&table, record_id));
                };
                let mut records = Vec::new();
                for attribute in enrollment.allow_list() {
                    // Create emits only attributes that have a value
                    let Some(value) = row.get(attribute) else {
                        continue;
                    };
                    if value.is_null() {
                        continue;
                    }
                    records.push(QueuedChange::attribute_change(
                        table.clone(),
                        record_id,
                        attribute.clone(),
                        value.render(self.config.timezone),
                        committed_at,
                    ));
                }
                records
            }
            CommitNotice::Updated {
                table,
                record_id,
                changes,
                committed_at,
            } => {
                let Some(enrollment) = self.registry.enrollment(&table) else {
                    return Ok(self.skip(&table, record_id));
                };
                changes
                    .into_iter()
                    .filter(|(attribute, _)| enrollment.tracks(attribute))
                    .map(|(attribute, value)| {
                        QueuedChange::attribute_change(
                            table.clone(),
                            record_id,
                            attribute,
                            value.render(self.config.timezone),
                            committed_at,
                        )
                    })
                    .collect()
            }
            CommitNotice::Destroyed {
                table,
                record_id,
                committed_at,
            } => {
                if !self.registry.is_enrolled(&table) {
                    return Ok(self.skip(&table, record_id));
                }
                vec![QueuedChange::destroy_sentinel(
                    table,
                    record_id,
                    committed_at,
                )]
            }
        };

        let queued = records.len();
        if queued > 0 {
            debug!(queued, "enqueueing captured changes");
            self.queue.enqueue(records).await?;
        }
        Ok(CaptureOutcome { queued, skipped: 0 })
    }

    fn skip(&self, table: &TableName, record_id: i64) -> CaptureOutcome {
        warn!(%table, record_id, "dropping change for unenrolled table");
        CaptureOutcome {
            queued: 0,
            skipped: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WarehouseCredentials;
    use crate::errors::QueueResult;
    use crate::registry::{CaptureMode, TableDescriptor};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn table(name: &str) -> TableName {
        TableName::try_new(name).unwrap()
    }

    fn attr(name: &str) -> AttributeName {
        AttributeName::try_new(name).unwrap()
    }

    fn text(value: &str) -> AttributeValue {
        AttributeValue::Text(value.to_string())
    }

    /// Records enqueued batches without any storage behind them.
    #[derive(Default)]
    struct RecordingQueue {
        batches: Mutex<Vec<Vec<QueuedChange>>>,
    }

    impl RecordingQueue {
        fn all(&self) -> Vec<QueuedChange> {
            self.batches.lock().unwrap().iter().flatten().cloned().collect()
        }

        fn batch_count(&self) -> usize {
            self.batches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl QueueStore for RecordingQueue {
        async fn enqueue(&self, records: Vec<QueuedChange>) -> QueueResult<()> {
            self.batches.lock().unwrap().push(records);
            Ok(())
        }

        async fn dequeue_batch(&self, _limit: usize) -> QueueResult<Vec<QueuedChange>> {
            Ok(Vec::new())
        }

        async fn mark_sent(&self, _ids: &[crate::types::ChangeId]) -> QueueResult<()> {
            Ok(())
        }

        async fn delete_sent(&self) -> QueueResult<usize> {
            Ok(0)
        }

        async fn pending_count(&self) -> QueueResult<usize> {
            Ok(0)
        }
    }

    fn extractor(registry: TableRegistry) -> (ChangeExtractor<RecordingQueue>, Arc<RecordingQueue>) {
        let config = StreamConfig::builder(
            WarehouseCredentials::new("c", "e", "k", "p"),
            "analytics",
        )
        .build()
        .unwrap();
        let queue = Arc::new(RecordingQueue::default());
        (
            ChangeExtractor::new(Arc::new(config), Arc::new(registry), Arc::clone(&queue)),
            queue,
        )
    }

    fn orders_registry() -> TableRegistry {
        let mut registry = TableRegistry::new();
        registry
            .enroll(
                TableDescriptor::new(table("orders"))
                    .with_column(attr("id"))
                    .with_column(attr("name"))
                    .with_column(attr("status")),
                CaptureMode::All,
            )
            .unwrap();
        registry
    }

    #[test]
    fn context_drops_changes_reverted_within_the_transaction() {
        let mut context = TransactionContext::new();
        context.record_write(table("orders"), 1, attr("status"), text("new"), text("paid"));
        context.record_write(table("orders"), 1, attr("status"), text("paid"), text("new"));

        let notices = context.into_commits(Timestamp::now());
        assert!(notices.is_empty());
    }

    #[test]
    fn context_reports_net_change_only() {
        let mut context = TransactionContext::new();
        context.record_write(table("orders"), 1, attr("status"), text("new"), text("paid"));
        context.record_write(table("orders"), 1, attr("status"), text("paid"), text("shipped"));
        context.record_write(table("orders"), 1, attr("name"), text("a"), text("a"));

        let notices = context.into_commits(Timestamp::now());
        assert_eq!(notices.len(), 1);
        match &notices[0] {
            CommitNotice::Updated { changes, .. } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes.get(&attr("status")), Some(&text("shipped")));
            }
            other => panic!("expected Updated, got {other:?}"),
        }
    }

    #[test]
    fn destroy_wins_over_create_within_one_transaction() {
        let mut context = TransactionContext::new();
        context.record_created(table("orders"), 1, vec![(attr("name"), text("x"))]);
        context.record_destroyed(table("orders"), 1);

        let notices = context.into_commits(Timestamp::now());
        assert_eq!(notices.len(), 1);
        assert!(matches!(notices[0], CommitNotice::Destroyed { .. }));
    }

    #[test]
    fn dropping_a_context_emits_nothing() {
        let mut context = TransactionContext::new();
        context.record_write(table("orders"), 1, attr("status"), text("a"), text("b"));
        // Rollback path: the context goes out of scope unconsumed.
        drop(context);
    }

    #[tokio::test]
    async fn create_emits_one_record_per_non_null_allow_listed_attribute() {
        let (extractor, queue) = extractor(orders_registry());

        let mut row = BTreeMap::new();
        row.insert(attr("id"), AttributeValue::Integer(1));
        row.insert(attr("name"), text("primary record"));
        row.insert(attr("status"), AttributeValue::Null);

        let outcome = extractor
            .on_committed(CommitNotice::Created {
                table: table("orders"),
                record_id: 1,
                row,
                committed_at: Timestamp::now(),
            })
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome { queued: 2, skipped: 0 });
        let records = queue.all();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| !r.is_destroy_sentinel()));
        // One bulk write, not one write per record
        assert_eq!(queue.batch_count(), 1);
    }

    #[tokio::test]
    async fn update_ignores_attributes_outside_the_allow_list() {
        let mut registry = TableRegistry::new();
        registry
            .enroll(
                TableDescriptor::new(table("orders"))
                    .with_column(attr("name"))
                    .with_column(attr("status")),
                CaptureMode::Only(vec![attr("status")]),
            )
            .unwrap();
        let (extractor, queue) = extractor(registry);

        let mut changes = BTreeMap::new();
        changes.insert(attr("name"), text("renamed"));
        changes.insert(attr("status"), text("shipped"));

        let outcome = extractor
            .on_committed(CommitNotice::Updated {
                table: table("orders"),
                record_id: 5,
                changes,
                committed_at: Timestamp::now(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.queued, 1);
        let records = queue.all();
        assert_eq!(records[0].attribute, Some(attr("status")));
        assert_eq!(records[0].new_value.as_deref(), Some(b"shipped".as_slice()));
    }

    #[tokio::test]
    async fn destroy_emits_exactly_one_sentinel() {
        let (extractor, queue) = extractor(orders_registry());

        let outcome = extractor
            .on_committed(CommitNotice::Destroyed {
                table: table("orders"),
                record_id: 9,
                committed_at: Timestamp::now(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.queued, 1);
        let records = queue.all();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_destroy_sentinel());
    }

    #[tokio::test]
    async fn unenrolled_table_is_skipped_not_failed() {
        let (extractor, queue) = extractor(orders_registry());

        let outcome = extractor
            .on_committed(CommitNotice::Destroyed {
                table: table("unknown"),
                record_id: 1,
                committed_at: Timestamp::now(),
            })
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome { queued: 0, skipped: 1 });
        assert!(queue.all().is_empty());
    }

    #[tokio::test]
    async fn empty_update_makes_no_queue_call() {
        let (extractor, queue) = extractor(orders_registry());

        let outcome = extractor
            .on_committed(CommitNotice::Updated {
                table: table("orders"),
                record_id: 5,
                changes: BTreeMap::new(),
                committed_at: Timestamp::now(),
            })
            .await
            .unwrap();

        assert_eq!(outcome.queued, 0);
        assert_eq!(queue.batch_count(), 0);
    }
}
