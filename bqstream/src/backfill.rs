//! Cursor-driven backfill.
//!
//! Live capture only sees rows mutated after enrollment; backfill walks
//! each enrolled table backward through history, one `created_at` at a
//! time, queueing the same per-attribute records live capture would have
//! produced. Progress is the cursor table: scanning resumes from the
//! minimum `earliest_synced_at` of a table's cursors and stops at the
//! configured cutoff.

use crate::config::StreamConfig;
use crate::cursor::CursorStore;
use crate::errors::DispatchResult;
use crate::queue::{available_capacity, QueueStore, QueuedChange};
use crate::registry::TableRegistry;
use crate::source::SourceReader;
use crate::types::{TableName, Timestamp};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Walks enrolled tables backward in time, topping up the durable queue.
pub struct BackfillRunner<C, S, Q> {
    config: Arc<StreamConfig>,
    registry: Arc<TableRegistry>,
    cursors: Arc<C>,
    source: Arc<S>,
    queue: Arc<Q>,
}

impl<C, S, Q> BackfillRunner<C, S, Q>
where
    C: CursorStore,
    S: SourceReader,
    Q: QueueStore,
{
    /// Creates a runner over the given stores.
    pub fn new(
        config: Arc<StreamConfig>,
        registry: Arc<TableRegistry>,
        cursors: Arc<C>,
        source: Arc<S>,
        queue: Arc<Q>,
    ) -> Self {
        Self {
            config,
            registry,
            cursors,
            source,
            queue,
        }
    }

    /// Reconciles cursor rows against the registry, once per deploy.
    ///
    /// The cursor store's revision sentinel gates the work: when it already
    /// matches the configured deploy revision nothing is scanned. Otherwise
    /// missing cursor rows are created, rows for de-registered attributes
    /// are removed, every row is reactivated, and the sentinel is stamped.
    ///
    /// Returns whether reconciliation ran.
    pub async fn verify_cursors(&self) -> DispatchResult<bool> {
        let current = self.config.deploy_revision.as_str();
        let recorded = self.cursors.deploy_revision().await?;
        if recorded.as_deref() == Some(current) {
            debug!(revision = current, "cursor set already validated for this deploy");
            return Ok(false);
        }

        info!(revision = current, "reconciling backfill cursors");

        let tracked: BTreeSet<_> = self.registry.tracked_pairs().into_iter().collect();
        for (table, attribute) in &tracked {
            self.cursors.ensure(table, attribute).await?;
        }
        for cursor in self.cursors.all().await? {
            let pair = (cursor.table_name.clone(), cursor.attribute.clone());
            if !tracked.contains(&pair) {
                debug!(table = %pair.0, attribute = %pair.1, "removing de-registered cursor");
                self.cursors.remove(&pair.0, &pair.1).await?;
            }
        }

        self.cursors.reset_archived().await?;
        self.cursors.set_deploy_revision(current).await?;
        Ok(true)
    }

    /// Buffers historical rows into the queue until capacity runs out or
    /// every table is archived. Returns how many records were queued.
    ///
    /// The buffer is written in a single bulk enqueue at the end; a crash
    /// mid-run loses only buffered (never-queued) records, which the next
    /// run re-reads from the same cursor positions.
    pub async fn top_up(&self) -> DispatchResult<usize> {
        let Some(cutoff) = self.config.backfill_cutoff else {
            return Ok(0);
        };
        let batch_size: usize = self.config.batch_size.into();
        let mut buffer: Vec<QueuedChange> = Vec::new();

        loop {
            let pending = self.queue.pending_count().await?;
            if available_capacity(batch_size, pending, buffer.len()) == 0 {
                break;
            }

            let cursors = self.cursors.all().await?;
            let active: BTreeSet<TableName> = cursors
                .iter()
                .filter(|cursor| !cursor.archived)
                .map(|cursor| cursor.table_name.clone())
                .collect();
            if active.is_empty() {
                break;
            }

            let mut advanced = 0;
            for table in &active {
                advanced += self.advance_table(table, cutoff, &mut buffer).await?;
            }
            if advanced == 0 {
                // Every active table archived itself this pass
                break;
            }
        }

        let buffered = buffer.len();
        if buffered > 0 {
            debug!(buffered, "enqueueing backfill buffer");
            self.queue.enqueue(buffer).await?;
        }
        Ok(buffered)
    }

    /// Advances one table by one timestamp-batch, buffering its records.
    ///
    /// Rows sharing the batch's `created_at` move together as one unit,
    /// and every cursor row of the table advances to that timestamp. An
    /// empty scan archives the table.
    async fn advance_table(
        &self,
        table: &TableName,
        cutoff: Timestamp,
        buffer: &mut Vec<QueuedChange>,
    ) -> DispatchResult<usize> {
        let cursors = self.cursors.for_table(table).await?;
        if cursors.is_empty() {
            return Ok(0);
        }

        let earliest = cursors
            .iter()
            .filter_map(|cursor| cursor.earliest_synced_at)
            .min()
            .unwrap_or_else(Timestamp::now);

        let Some(batch_at) = self
            .source
            .next_created_at_before(table, cutoff, earliest)
            .await?
        else {
            info!(%table, "no history remains before cursor; archiving");
            self.cursors.set_archived(table, true).await?;
            return Ok(0);
        };

        let rows = self.source.rows_created_at(table, batch_at).await?;
        let mut queued = 0;
        for cursor in &cursors {
            for row in &rows {
                let value = row.value(&cursor.attribute);
                buffer.push(QueuedChange::attribute_change(
                    table.clone(),
                    row.id,
                    cursor.attribute.clone(),
                    value.render(self.config.timezone),
                    row.created_at,
                ));
                queued += 1;
            }
        }

        self.cursors.set_earliest_for_table(table, batch_at).await?;
        debug!(%table, batch_at = %batch_at, queued, "advanced backfill cursor");
        Ok(queued)
    }
}
