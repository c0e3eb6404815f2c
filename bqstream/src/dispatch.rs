//! The dispatch tick.
//!
//! A scheduler calls [`Dispatcher::dequeue_items`] periodically. Each tick
//! optionally tops the queue up from backfill, drains one bounded batch,
//! ships it to the warehouse in a single insert, and acknowledges only
//! what that insert confirmed. A failed insert changes nothing: the same
//! records are picked up by the next tick.

use crate::backfill::BackfillRunner;
use crate::config::StreamConfig;
use crate::cursor::CursorStore;
use crate::errors::DispatchResult;
use crate::queue::QueueStore;
use crate::registry::TableRegistry;
use crate::source::SourceReader;
use crate::types::{ChangeId, INSERT_ROW_CEILING};
use crate::warehouse::{ensure_sink, WarehouseClient, WarehouseRow};
use std::sync::Arc;
use tracing::{debug, error, info};

/// What one dispatch tick accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Records queued from backfill during this tick
    pub backfilled: usize,
    /// Records delivered to the warehouse and marked sent
    pub dispatched: usize,
    /// Previously-sent records garbage-collected
    pub deleted: usize,
}

/// Drains the durable queue to the warehouse, one bounded batch per tick.
///
/// Single-writer: two concurrent ticks against the same queue would
/// dequeue overlapping batches and race on `mark_sent` and the capacity
/// check. Run ticks from one scheduler slot (or serialize them
/// externally); the stores being `Send + Sync` does not make the tick
/// protocol concurrent.
pub struct Dispatcher<Q, C, S, W> {
    config: Arc<StreamConfig>,
    queue: Arc<Q>,
    cursors: Arc<C>,
    warehouse: Arc<W>,
    backfill: BackfillRunner<C, S, Q>,
}

impl<Q, C, S, W> Dispatcher<Q, C, S, W>
where
    Q: QueueStore,
    C: CursorStore,
    S: SourceReader,
    W: WarehouseClient,
{
    /// Creates a dispatcher over the given stores.
    pub fn new(
        config: Arc<StreamConfig>,
        registry: Arc<TableRegistry>,
        queue: Arc<Q>,
        cursors: Arc<C>,
        source: Arc<S>,
        warehouse: Arc<W>,
    ) -> Self {
        let backfill = BackfillRunner::new(
            Arc::clone(&config),
            registry,
            Arc::clone(&cursors),
            source,
            Arc::clone(&queue),
        );
        Self {
            config,
            queue,
            cursors,
            warehouse,
            backfill,
        }
    }

    /// Creates the warehouse dataset and output table if absent.
    ///
    /// Call once at startup, before the first tick.
    pub async fn initialize_sink(&self) -> DispatchResult<()> {
        ensure_sink(self.warehouse.as_ref(), &self.config).await?;
        Ok(())
    }

    /// Runs one dispatch tick.
    ///
    /// Re-running on an empty queue is a no-op: no warehouse call is made
    /// and nothing is acknowledged.
    pub async fn dequeue_items(&self) -> DispatchResult<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();

        if self.backfill_needed().await? {
            self.backfill.verify_cursors().await?;
            outcome.backfilled = self.backfill.top_up().await?;
        }

        let batch_size: usize = self.config.batch_size.into();
        let batch = self
            .queue
            .dequeue_batch(batch_size.min(INSERT_ROW_CEILING))
            .await?;
        if batch.is_empty() {
            debug!("queue empty; nothing to dispatch");
            return Ok(outcome);
        }

        let rows: Vec<WarehouseRow> = batch.iter().map(WarehouseRow::from_queued).collect();
        if let Err(failure) = self
            .warehouse
            .insert(&self.config.output_table_name, &rows)
            .await
        {
            error!(
                error = %failure,
                project = %self.config.credentials.project_id,
                dataset = %self.config.dataset,
                table = %self.config.output_table_name,
                "warehouse insert failed; queue left untouched for retry"
            );
            return Err(failure.into());
        }

        let ids: Vec<ChangeId> = batch.iter().map(|record| record.id).collect();
        self.queue.mark_sent(&ids).await?;
        outcome.dispatched = ids.len();
        outcome.deleted = self.queue.delete_sent().await?;

        info!(
            backfilled = outcome.backfilled,
            dispatched = outcome.dispatched,
            deleted = outcome.deleted,
            "dispatch tick complete"
        );
        Ok(outcome)
    }

    /// Whether this tick should run backfill before draining.
    ///
    /// True when a cutoff is configured and either no cursor rows exist
    /// yet or some cursor has not reached the cutoff.
    async fn backfill_needed(&self) -> DispatchResult<bool> {
        let Some(cutoff) = self.config.backfill_cutoff else {
            return Ok(false);
        };
        if self.cursors.all().await?.is_empty() {
            return Ok(true);
        }
        Ok(self.cursors.any_behind(cutoff).await?)
    }
}
