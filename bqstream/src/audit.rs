//! Warehouse-versus-source sampling.
//!
//! The change stream is at-least-once, so the warehouse may hold several
//! rows per `(record_id, attr)`. The auditor reduces them to the winning
//! row - latest `updated_at` wins - and diffs the surviving values against
//! the live source rows. Read-only on both sides; used for spot checks,
//! not as part of the delivery path.

use crate::config::StreamConfig;
use crate::errors::AuditResult;
use crate::source::{SourceReader, SourceRow};
use crate::types::{AttributeName, TableName, Timestamp};
use crate::warehouse::{parse_wire_timestamp, sanitize_utf8, sql, WarehouseClient};
use std::collections::{btree_map::Entry, BTreeMap};
use std::sync::Arc;
use tracing::info;

/// Why a sampled value failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// The warehouse and source disagree on the value
    ValueDiffers,
    /// The warehouse has the record but the source table does not
    MissingInSource,
}

/// One failed comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mismatch {
    /// The sampled row's primary key
    pub record_id: i64,
    /// The attribute that failed
    pub attribute: AttributeName,
    /// The source-of-truth value, rendered the way capture renders it
    pub source_value: Option<String>,
    /// The warehouse's winning value
    pub warehouse_value: Option<String>,
    /// What kind of failure this is
    pub kind: MismatchKind,
}

/// Samples warehouse rows against the source of truth.
pub struct Auditor<S, W> {
    config: Arc<StreamConfig>,
    source: Arc<S>,
    warehouse: Arc<W>,
}

impl<S, W> Auditor<S, W>
where
    S: SourceReader,
    W: WarehouseClient,
{
    /// Creates an auditor over the given source and warehouse.
    pub fn new(config: Arc<StreamConfig>, source: Arc<S>, warehouse: Arc<W>) -> Self {
        Self {
            config,
            source,
            warehouse,
        }
    }

    /// Verifies the warehouse's view of the given records.
    ///
    /// Duplicate deliveries are resolved before comparison: per
    /// `(record_id, attr)` only the row with the latest `updated_at`
    /// counts. Destroy sentinels (NULL attr) are not compared; a
    /// destroyed record naturally has no source row to compare against.
    pub async fn verify_records(
        &self,
        table: &TableName,
        record_ids: &[i64],
    ) -> AuditResult<Vec<Mismatch>> {
        if record_ids.is_empty() {
            return Ok(Vec::new());
        }

        let statement = sql::rows_for_records(
            &self.config.credentials.project_id,
            &self.config.dataset,
            &self.config.output_table_name,
            table.as_ref(),
            record_ids,
        );
        let response = self.warehouse.query(&statement).await?;

        // Last-write-wins reduction over the duplicated stream
        let mut winners: BTreeMap<(i64, AttributeName), (Timestamp, Option<String>)> =
            BTreeMap::new();
        for index in 0..response.rows.len() {
            let Some(id_cell) = response.value(index, "record_id") else {
                continue;
            };
            let Ok(record_id) = id_cell.parse::<i64>() else {
                continue;
            };
            let Some(attr_cell) = response.value(index, "attr") else {
                continue;
            };
            let Ok(attribute) = AttributeName::try_new(attr_cell) else {
                continue;
            };
            let Some(ts_cell) = response.value(index, "updated_at") else {
                continue;
            };
            let updated_at = parse_wire_timestamp(ts_cell)?;
            let value = response.value(index, "new_value").map(ToString::to_string);

            match winners.entry((record_id, attribute)) {
                Entry::Vacant(entry) => {
                    entry.insert((updated_at, value));
                }
                Entry::Occupied(mut entry) => {
                    if updated_at > entry.get().0 {
                        entry.insert((updated_at, value));
                    }
                }
            }
        }

        let mut source_rows: BTreeMap<i64, Option<SourceRow>> = BTreeMap::new();
        let mut mismatches = Vec::new();

        for ((record_id, attribute), (_, warehouse_value)) in winners {
            if let Entry::Vacant(entry) = source_rows.entry(record_id) {
                entry.insert(self.source.row(table, record_id).await?);
            }

            match source_rows.get(&record_id).and_then(Option::as_ref) {
                None => mismatches.push(Mismatch {
                    record_id,
                    attribute,
                    source_value: None,
                    warehouse_value,
                    kind: MismatchKind::MissingInSource,
                }),
                Some(row) => {
                    let source_value = row
                        .value(&attribute)
                        .render(self.config.timezone)
                        .map(|bytes| sanitize_utf8(&bytes));
                    if source_value != warehouse_value {
                        mismatches.push(Mismatch {
                            record_id,
                            attribute,
                            source_value,
                            warehouse_value,
                            kind: MismatchKind::ValueDiffers,
                        });
                    }
                }
            }
        }

        info!(
            %table,
            sampled = record_ids.len(),
            mismatches = mismatches.len(),
            "audit sample complete"
        );
        Ok(mismatches)
    }
}
