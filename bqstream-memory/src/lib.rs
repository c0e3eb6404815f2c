//! In-memory adapters for the `bqstream` change capture library
//!
//! This crate provides in-memory implementations of the storage and
//! transport ports from the bqstream crate - the durable queue, the
//! backfill cursor store, the host-table reader, and the warehouse client -
//! useful for testing and development scenarios where persistence is not
//! required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bqstream::cursor::{BackfillCursor, CursorStore};
use bqstream::errors::{
    CursorResult, QueueResult, SourceError, SourceResult, WarehouseError, WarehouseResult,
};
use bqstream::queue::{QueueStore, QueuedChange};
use bqstream::source::{SourceReader, SourceRow};
use bqstream::types::{AttributeName, ChangeId, TableName, Timestamp, INSERT_ROW_CEILING};
use bqstream::warehouse::{QueryResponse, TableSchema, WarehouseClient, WarehouseRow};

/// Thread-safe in-memory durable queue for testing
#[derive(Clone, Default)]
pub struct InMemoryQueueStore {
    entries: Arc<RwLock<Vec<QueuedChange>>>,
}

impl InMemoryQueueStore {
    /// Create a new empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry currently in the store, sent or not
    pub fn all(&self) -> Vec<QueuedChange> {
        self.entries.read().expect("RwLock poisoned").clone()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, records: Vec<QueuedChange>) -> QueueResult<()> {
        self.entries
            .write()
            .expect("RwLock poisoned")
            .extend(records);
        Ok(())
    }

    async fn dequeue_batch(&self, limit: usize) -> QueueResult<Vec<QueuedChange>> {
        let entries = self.entries.read().expect("RwLock poisoned");

        let mut pending: Vec<QueuedChange> = entries
            .iter()
            .filter(|entry| !entry.sent)
            .cloned()
            .collect();
        // FIFO by observation time; the id tiebreak keeps order stable
        pending.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        pending.truncate(limit.min(INSERT_ROW_CEILING));
        Ok(pending)
    }

    async fn mark_sent(&self, ids: &[ChangeId]) -> QueueResult<()> {
        let mut entries = self.entries.write().expect("RwLock poisoned");

        let now = Timestamp::now();
        for entry in entries.iter_mut() {
            if !entry.sent && ids.contains(&entry.id) {
                entry.sent = true;
                entry.sent_at = Some(now);
            }
        }
        Ok(())
    }

    async fn delete_sent(&self) -> QueueResult<usize> {
        let mut entries = self.entries.write().expect("RwLock poisoned");

        let before = entries.len();
        entries.retain(|entry| !entry.sent);
        Ok(before - entries.len())
    }

    async fn pending_count(&self) -> QueueResult<usize> {
        let entries = self.entries.read().expect("RwLock poisoned");

        Ok(entries.iter().filter(|entry| !entry.sent).count())
    }
}

/// Thread-safe in-memory cursor store for testing
///
/// The deploy-revision sentinel is held in its own slot; it never appears
/// among the cursor rows, matching the port contract.
#[derive(Clone, Default)]
pub struct InMemoryCursorStore {
    rows: Arc<RwLock<Vec<BackfillCursor>>>,
    revision: Arc<RwLock<Option<String>>>,
}

impl InMemoryCursorStore {
    /// Create a new empty cursor store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn all(&self) -> CursorResult<Vec<BackfillCursor>> {
        Ok(self.rows.read().expect("RwLock poisoned").clone())
    }

    async fn for_table(&self, table: &TableName) -> CursorResult<Vec<BackfillCursor>> {
        let rows = self.rows.read().expect("RwLock poisoned");

        Ok(rows
            .iter()
            .filter(|row| &row.table_name == table)
            .cloned()
            .collect())
    }

    async fn ensure(&self, table: &TableName, attribute: &AttributeName) -> CursorResult<()> {
        let mut rows = self.rows.write().expect("RwLock poisoned");

        let exists = rows
            .iter()
            .any(|row| &row.table_name == table && &row.attribute == attribute);
        if !exists {
            rows.push(BackfillCursor::new(table.clone(), attribute.clone()));
        }
        Ok(())
    }

    async fn remove(&self, table: &TableName, attribute: &AttributeName) -> CursorResult<()> {
        let mut rows = self.rows.write().expect("RwLock poisoned");

        rows.retain(|row| !(&row.table_name == table && &row.attribute == attribute));
        Ok(())
    }

    async fn set_earliest(
        &self,
        table: &TableName,
        attribute: &AttributeName,
        earliest: Timestamp,
    ) -> CursorResult<()> {
        let mut rows = self.rows.write().expect("RwLock poisoned");

        if let Some(row) = rows
            .iter_mut()
            .find(|row| &row.table_name == table && &row.attribute == attribute)
        {
            row.earliest_synced_at = Some(earliest);
        } else {
            let mut row = BackfillCursor::new(table.clone(), attribute.clone());
            row.earliest_synced_at = Some(earliest);
            rows.push(row);
        }
        Ok(())
    }

    async fn set_earliest_for_table(
        &self,
        table: &TableName,
        earliest: Timestamp,
    ) -> CursorResult<()> {
        let mut rows = self.rows.write().expect("RwLock poisoned");

        for row in rows.iter_mut().filter(|row| &row.table_name == table) {
            row.earliest_synced_at = Some(earliest);
        }
        Ok(())
    }

    async fn set_archived(&self, table: &TableName, archived: bool) -> CursorResult<()> {
        let mut rows = self.rows.write().expect("RwLock poisoned");

        for row in rows.iter_mut().filter(|row| &row.table_name == table) {
            row.archived = archived;
        }
        Ok(())
    }

    async fn reset_archived(&self) -> CursorResult<()> {
        let mut rows = self.rows.write().expect("RwLock poisoned");

        for row in rows.iter_mut() {
            row.archived = false;
        }
        Ok(())
    }

    async fn any_behind(&self, cutoff: Timestamp) -> CursorResult<bool> {
        let rows = self.rows.read().expect("RwLock poisoned");

        Ok(rows
            .iter()
            .any(|row| row.earliest_synced_at.map_or(true, |earliest| earliest >= cutoff)))
    }

    async fn deploy_revision(&self) -> CursorResult<Option<String>> {
        Ok(self.revision.read().expect("RwLock poisoned").clone())
    }

    async fn set_deploy_revision(&self, revision: &str) -> CursorResult<()> {
        *self.revision.write().expect("RwLock poisoned") = Some(revision.to_string());
        Ok(())
    }
}

/// Thread-safe in-memory host-table reader for testing
///
/// Tables must be registered before they can be read; reads against an
/// unregistered table fail with `SourceError::UnknownTable`, matching a
/// renamed or dropped host table in production.
#[derive(Clone, Default)]
pub struct InMemorySource {
    tables: Arc<RwLock<BTreeMap<TableName, Vec<SourceRow>>>>,
}

impl InMemorySource {
    /// Create a new empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a table with no rows
    pub fn register_table(&self, table: TableName) {
        self.tables
            .write()
            .expect("RwLock poisoned")
            .entry(table)
            .or_default();
    }

    /// Registers the table if needed and appends a row
    pub fn insert_row(&self, table: TableName, row: SourceRow) {
        self.tables
            .write()
            .expect("RwLock poisoned")
            .entry(table)
            .or_default()
            .push(row);
    }

    fn with_table<T>(
        &self,
        table: &TableName,
        f: impl FnOnce(&[SourceRow]) -> T,
    ) -> SourceResult<T> {
        let tables = self.tables.read().expect("RwLock poisoned");

        tables
            .get(table)
            .map(|rows| f(rows))
            .ok_or_else(|| SourceError::UnknownTable(table.clone()))
    }
}

#[async_trait]
impl SourceReader for InMemorySource {
    async fn next_created_at_before(
        &self,
        table: &TableName,
        floor: Timestamp,
        ceiling: Timestamp,
    ) -> SourceResult<Option<Timestamp>> {
        self.with_table(table, |rows| {
            rows.iter()
                .map(|row| row.created_at)
                .filter(|created| *created >= floor && *created < ceiling)
                .max()
        })
    }

    async fn rows_created_at(
        &self,
        table: &TableName,
        created_at: Timestamp,
    ) -> SourceResult<Vec<SourceRow>> {
        self.with_table(table, |rows| {
            rows.iter()
                .filter(|row| row.created_at == created_at)
                .cloned()
                .collect()
        })
    }

    async fn rows_in_id_window(
        &self,
        table: &TableName,
        ceiling_id: i64,
        floor_id: i64,
        limit: usize,
    ) -> SourceResult<Vec<SourceRow>> {
        self.with_table(table, |rows| {
            let mut window: Vec<SourceRow> = rows
                .iter()
                .filter(|row| row.id >= floor_id && row.id <= ceiling_id)
                .cloned()
                .collect();
            window.sort_by(|a, b| b.id.cmp(&a.id));
            window.truncate(limit);
            window
        })
    }

    async fn first_id_at_or_after(
        &self,
        table: &TableName,
        cutoff: Timestamp,
    ) -> SourceResult<Option<i64>> {
        self.with_table(table, |rows| {
            rows.iter()
                .filter(|row| row.created_at >= cutoff)
                .map(|row| row.id)
                .min()
        })
    }

    async fn max_id(&self, table: &TableName) -> SourceResult<Option<i64>> {
        self.with_table(table, |rows| rows.iter().map(|row| row.id).max())
    }

    async fn row(&self, table: &TableName, id: i64) -> SourceResult<Option<SourceRow>> {
        self.with_table(table, |rows| {
            rows.iter().find(|row| row.id == id).cloned()
        })
    }
}

/// Thread-safe in-memory warehouse for testing
///
/// Supports the three canonical query shapes from `bqstream::warehouse::sql`
/// and one-shot insert failure injection for delivery-failure tests.
#[derive(Clone, Default)]
pub struct InMemoryWarehouse {
    datasets: Arc<RwLock<BTreeSet<String>>>,
    tables: Arc<RwLock<BTreeMap<String, TableSchema>>>,
    rows: Arc<RwLock<BTreeMap<String, Vec<WarehouseRow>>>>,
    fail_next_insert: Arc<AtomicBool>,
    insert_calls: Arc<AtomicUsize>,
}

impl InMemoryWarehouse {
    /// Create a new empty warehouse
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next insert call fail with a transport error
    pub fn fail_next_insert(&self) {
        self.fail_next_insert.store(true, Ordering::SeqCst);
    }

    /// How many insert calls have been attempted (including failed ones)
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    /// Every row inserted into the given table
    pub fn rows_in(&self, table: &str) -> Vec<WarehouseRow> {
        self.rows
            .read()
            .expect("RwLock poisoned")
            .get(table)
            .cloned()
            .unwrap_or_default()
    }
}

fn extract<'a>(statement: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = statement.find(prefix)? + prefix.len();
    let end = statement[start..].find(suffix)? + start;
    Some(&statement[start..end])
}

fn output_table(statement: &str) -> Option<&str> {
    // FROM [project:dataset.table]
    let bracketed = extract(statement, "[", "]")?;
    bracketed.rsplit('.').next()
}

#[async_trait]
impl WarehouseClient for InMemoryWarehouse {
    async fn create_dataset(&self, name: &str) -> WarehouseResult<()> {
        self.datasets
            .write()
            .expect("RwLock poisoned")
            .insert(name.to_string());
        Ok(())
    }

    async fn create_table(&self, name: &str, schema: &TableSchema) -> WarehouseResult<()> {
        self.tables
            .write()
            .expect("RwLock poisoned")
            .insert(name.to_string(), schema.clone());
        Ok(())
    }

    async fn insert(&self, table: &str, rows: &[WarehouseRow]) -> WarehouseResult<()> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(WarehouseError::Transport(
                "injected insert failure".to_string(),
            ));
        }

        self.rows
            .write()
            .expect("RwLock poisoned")
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().cloned());
        Ok(())
    }

    async fn query(&self, statement: &str) -> WarehouseResult<QueryResponse> {
        let stored = self.rows.read().expect("RwLock poisoned");
        let table = output_table(statement).ok_or_else(|| {
            WarehouseError::MalformedResponse(format!("no FROM clause in '{statement}'"))
        })?;
        let rows = stored.get(table).cloned().unwrap_or_default();

        if statement.starts_with("SELECT MIN(record_id)") {
            let source = extract(statement, "table_name = '", "'").ok_or_else(|| {
                WarehouseError::MalformedResponse(format!("no table filter in '{statement}'"))
            })?;
            let min = rows
                .iter()
                .filter(|row| row.table_name == source)
                .map(|row| row.record_id)
                .min();
            return Ok(QueryResponse {
                schema: vec!["min_record_id".to_string()],
                rows: vec![vec![min.map(|id| id.to_string())]],
            });
        }

        if statement.starts_with("SELECT table_name, attr, MIN(updated_at)") {
            let mut groups: BTreeMap<(String, Option<String>), Timestamp> = BTreeMap::new();
            for row in &rows {
                let key = (row.table_name.clone(), row.attr.clone());
                groups
                    .entry(key)
                    .and_modify(|earliest| *earliest = (*earliest).min(row.updated_at))
                    .or_insert(row.updated_at);
            }
            return Ok(QueryResponse {
                schema: vec![
                    "table_name".to_string(),
                    "attr".to_string(),
                    "bq_earliest_update".to_string(),
                ],
                rows: groups
                    .into_iter()
                    .map(|((table_name, attr), earliest)| {
                        vec![
                            Some(table_name),
                            attr,
                            Some(earliest.as_datetime().to_rfc3339()),
                        ]
                    })
                    .collect(),
            });
        }

        if statement.starts_with("SELECT table_name, record_id, attr, new_value, updated_at") {
            let source = extract(statement, "table_name = '", "'").ok_or_else(|| {
                WarehouseError::MalformedResponse(format!("no table filter in '{statement}'"))
            })?;
            let ids: BTreeSet<i64> = extract(statement, "IN (", ")")
                .map(|list| {
                    list.split(", ")
                        .filter_map(|id| id.parse::<i64>().ok())
                        .collect()
                })
                .unwrap_or_default();

            return Ok(QueryResponse {
                schema: vec![
                    "table_name".to_string(),
                    "record_id".to_string(),
                    "attr".to_string(),
                    "new_value".to_string(),
                    "updated_at".to_string(),
                ],
                rows: rows
                    .iter()
                    .filter(|row| row.table_name == source && ids.contains(&row.record_id))
                    .map(|row| {
                        vec![
                            Some(row.table_name.clone()),
                            Some(row.record_id.to_string()),
                            row.attr.clone(),
                            row.new_value.clone(),
                            Some(row.updated_at.as_datetime().to_rfc3339()),
                        ]
                    })
                    .collect(),
            });
        }

        Err(WarehouseError::Transport(format!(
            "unsupported query: {statement}"
        )))
    }

    async fn list_datasets(&self) -> WarehouseResult<Vec<String>> {
        Ok(self
            .datasets
            .read()
            .expect("RwLock poisoned")
            .iter()
            .cloned()
            .collect())
    }

    async fn list_tables(&self) -> WarehouseResult<Vec<String>> {
        Ok(self
            .tables
            .read()
            .expect("RwLock poisoned")
            .keys()
            .cloned()
            .collect())
    }
}
