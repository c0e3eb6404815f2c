//! Bulk historical archiving.
//!
//! The archiver bypasses the live queue: it walks an enrolled table's rows
//! by descending id, maps every tracked attribute of every row straight
//! into warehouse rows, and inserts them in windows sized to the insert
//! ceiling. The resume pointer is the warehouse itself - the minimum
//! `record_id` it already holds for the table - so an interrupted run
//! picks up where the last confirmed insert left off.

use crate::config::StreamConfig;
use crate::cursor::CursorStore;
use crate::errors::{ArchiveError, ArchiveResult, WarehouseError};
use crate::registry::TableRegistry;
use crate::source::SourceReader;
use crate::types::{AttributeName, TableName, Timestamp, INSERT_ROW_CEILING};
use crate::warehouse::{
    ensure_sink, parse_wire_timestamp, sanitize_utf8, sql, WarehouseClient, WarehouseRow,
};
use std::sync::Arc;
use tracing::{debug, info};

/// What one archive run accomplished.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveOutcome {
    /// Warehouse rows inserted
    pub rows_streamed: usize,
    /// Tables whose cursors ended the run archived
    pub tables_archived: usize,
}

/// Streams pre-existing rows of enrolled tables into the warehouse.
///
/// Runs as a one-shot job, independent of the live dispatcher; the only
/// shared state is the cursor store, which the archiver keeps in step so
/// live backfill does not redo archived history.
pub struct Archiver<C, S, W> {
    config: Arc<StreamConfig>,
    registry: Arc<TableRegistry>,
    cursors: Arc<C>,
    source: Arc<S>,
    warehouse: Arc<W>,
}

impl<C, S, W> Archiver<C, S, W>
where
    C: CursorStore,
    S: SourceReader,
    W: WarehouseClient,
{
    /// Creates an archiver over the given stores.
    pub fn new(
        config: Arc<StreamConfig>,
        registry: Arc<TableRegistry>,
        cursors: Arc<C>,
        source: Arc<S>,
        warehouse: Arc<W>,
    ) -> Self {
        Self {
            config,
            registry,
            cursors,
            source,
            warehouse,
        }
    }

    /// Archives every enrolled table back to `cutoff`.
    ///
    /// Creates the dataset and output table if absent, rebuilds cursor
    /// rows from what the warehouse already holds, then walks each table's
    /// id range downward until the window preceding the cutoff is empty.
    pub async fn full_archive(&self, cutoff: Timestamp) -> ArchiveResult<ArchiveOutcome> {
        info!(%cutoff, "starting full archive");
        ensure_sink(self.warehouse.as_ref(), &self.config).await?;
        self.seed_cursors_from_warehouse().await?;

        let mut outcome = ArchiveOutcome::default();
        for table in self.registry.tables() {
            let attributes: Vec<AttributeName> = self
                .registry
                .allow_list(table)
                .map(|allow| allow.iter().cloned().collect())
                .unwrap_or_default();
            outcome.rows_streamed += self.archive_table(table, &attributes, cutoff).await?;
            self.cursors.set_archived(table, true).await?;
            outcome.tables_archived += 1;
        }

        info!(
            rows_streamed = outcome.rows_streamed,
            tables_archived = outcome.tables_archived,
            "full archive complete"
        );
        Ok(outcome)
    }

    /// Archives a single table restricted to an explicit attribute subset.
    ///
    /// For selective backfills after enrolling new attributes; does not
    /// touch archived flags, so live backfill's view of the table is
    /// unchanged.
    pub async fn partial_archive(
        &self,
        cutoff: Timestamp,
        table: &TableName,
        attributes: &[AttributeName],
    ) -> ArchiveResult<ArchiveOutcome> {
        let Some(enrollment) = self.registry.enrollment(table) else {
            return Err(ArchiveError::NotEnrolled(table.clone()));
        };
        for attribute in attributes {
            if !enrollment.tracks(attribute) {
                return Err(ArchiveError::UntrackedAttribute {
                    table: table.clone(),
                    attribute: attribute.clone(),
                });
            }
        }

        info!(%table, attributes = attributes.len(), %cutoff, "starting partial archive");
        ensure_sink(self.warehouse.as_ref(), &self.config).await?;

        let rows_streamed = self.archive_table(table, attributes, cutoff).await?;
        Ok(ArchiveOutcome {
            rows_streamed,
            tables_archived: 0,
        })
    }

    /// Rebuilds cursor rows from the warehouse's own earliest-row
    /// aggregate.
    ///
    /// Recovery path for interrupted runs: whatever reached the warehouse
    /// before a crash defines where each `(table, attribute)` pair
    /// resumes. Pairs no longer tracked by the registry are ignored.
    pub async fn seed_cursors_from_warehouse(&self) -> ArchiveResult<usize> {
        let statement = sql::earliest_updates(
            &self.config.credentials.project_id,
            &self.config.dataset,
            &self.config.output_table_name,
        );
        let response = self.warehouse.query(&statement).await?;

        let mut seeded = 0;
        for index in 0..response.rows.len() {
            let Some(table_cell) = response.value(index, "table_name") else {
                continue;
            };
            // Destroy sentinels aggregate under a NULL attr; skip them
            let Some(attr_cell) = response.value(index, "attr") else {
                continue;
            };
            let Some(earliest_cell) = response.value(index, "bq_earliest_update") else {
                continue;
            };

            let (Ok(table), Ok(attribute)) = (
                TableName::try_new(table_cell),
                AttributeName::try_new(attr_cell),
            ) else {
                continue;
            };
            let tracked = self
                .registry
                .allow_list(&table)
                .is_some_and(|allow| allow.contains(&attribute));
            if !tracked {
                debug!(%table, %attribute, "ignoring warehouse rows for untracked pair");
                continue;
            }

            let earliest = parse_wire_timestamp(earliest_cell)?;
            self.cursors.ensure(&table, &attribute).await?;
            self.cursors.set_earliest(&table, &attribute, earliest).await?;
            seeded += 1;
        }

        self.cursors.reset_archived().await?;
        Ok(seeded)
    }

    /// Walks one table's id range downward from the resume pointer to the
    /// cutoff floor, inserting one window per iteration.
    async fn archive_table(
        &self,
        table: &TableName,
        attributes: &[AttributeName],
        cutoff: Timestamp,
    ) -> ArchiveResult<usize> {
        if attributes.is_empty() {
            return Ok(0);
        }
        for attribute in attributes {
            self.cursors.ensure(table, attribute).await?;
        }

        // Resume pointer: just below what the warehouse already holds, or
        // the newest local row when it holds nothing.
        let mut pointer = match self.min_warehouse_record_id(table).await? {
            Some(min_id) => min_id - 1,
            None => match self.source.max_id(table).await? {
                Some(max_id) => max_id,
                None => {
                    debug!(%table, "source table empty; nothing to archive");
                    return Ok(0);
                }
            },
        };

        let Some(floor) = self.source.first_id_at_or_after(table, cutoff).await? else {
            debug!(%table, "no rows at or after cutoff");
            return Ok(0);
        };

        // Window sized so rows x attributes stays within one insert call
        let window = (INSERT_ROW_CEILING / attributes.len()).max(1);
        let mut streamed = 0;

        while pointer >= floor {
            let rows = self
                .source
                .rows_in_id_window(table, pointer, floor, window)
                .await?;
            let Some(window_min) = rows.iter().map(|row| row.id).min() else {
                break;
            };

            let mut batch = Vec::with_capacity(rows.len() * attributes.len());
            let mut oldest_created = rows[0].created_at;
            for row in &rows {
                oldest_created = oldest_created.min(row.created_at);
                for attribute in attributes {
                    batch.push(WarehouseRow {
                        table_name: table.to_string(),
                        record_id: row.id,
                        attr: Some(attribute.to_string()),
                        new_value: row
                            .value(attribute)
                            .render(self.config.timezone)
                            .map(|bytes| sanitize_utf8(&bytes)),
                        updated_at: row.created_at,
                    });
                }
            }

            self.warehouse
                .insert(&self.config.output_table_name, &batch)
                .await?;
            streamed += batch.len();

            for attribute in attributes {
                self.cursors
                    .set_earliest(table, attribute, oldest_created)
                    .await?;
            }

            debug!(%table, window_min, batch = batch.len(), "archived window");
            pointer = window_min - 1;
        }

        Ok(streamed)
    }

    /// The minimum `record_id` the warehouse already holds for a table.
    async fn min_warehouse_record_id(
        &self,
        table: &TableName,
    ) -> ArchiveResult<Option<i64>> {
        let statement = sql::min_record_id(
            &self.config.credentials.project_id,
            &self.config.dataset,
            &self.config.output_table_name,
            table.as_ref(),
        );
        let response = self.warehouse.query(&statement).await?;

        match response.value(0, "min_record_id") {
            None => Ok(None),
            Some(cell) => cell
                .parse::<i64>()
                .map(Some)
                .map_err(|error| {
                    WarehouseError::MalformedResponse(format!(
                        "bad min_record_id '{cell}': {error}"
                    ))
                    .into()
                }),
        }
    }
}
