//! Warehouse wire contract.
//!
//! The warehouse is an external collaborator reached through the
//! [`WarehouseClient`] port: create a dataset and table, stream rows in,
//! run aggregate queries out. The output table always has the same fixed
//! five-column schema regardless of what host tables feed it.

use crate::errors::{WarehouseError, WarehouseResult};
use crate::queue::QueuedChange;
use crate::types::Timestamp;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The type of one output schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldType {
    /// STRING
    String,
    /// INTEGER
    Integer,
    /// TIMESTAMP
    Timestamp,
}

/// Whether a schema field may be NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FieldMode {
    /// The field must always carry a value
    Required,
    /// The field may be NULL
    Nullable,
}

/// One field of a warehouse table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name
    pub name: String,
    /// Field type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// NULL-ability
    pub mode: FieldMode,
}

impl SchemaField {
    /// Creates a schema field.
    pub fn new(name: impl Into<String>, field_type: FieldType, mode: FieldMode) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode,
        }
    }
}

/// A warehouse table schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// The table's fields, in order
    pub fields: Vec<SchemaField>,
}

/// The fixed schema of the change stream output table.
pub fn datastream_schema() -> TableSchema {
    TableSchema {
        fields: vec![
            SchemaField::new("table_name", FieldType::String, FieldMode::Required),
            SchemaField::new("record_id", FieldType::Integer, FieldMode::Required),
            SchemaField::new("attr", FieldType::String, FieldMode::Nullable),
            SchemaField::new("new_value", FieldType::String, FieldMode::Nullable),
            SchemaField::new("updated_at", FieldType::Timestamp, FieldMode::Required),
        ],
    }
}

/// One row of the output table, ready for an insert call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRow {
    /// Source table name
    pub table_name: String,
    /// Source row primary key
    pub record_id: i64,
    /// Tracked attribute, or NULL for a destroy sentinel
    pub attr: Option<String>,
    /// Rendered value, or NULL
    pub new_value: Option<String>,
    /// When the change was observed (or the row created, for backfill)
    pub updated_at: Timestamp,
}

impl WarehouseRow {
    /// Builds the insert-ready row for a queued change.
    ///
    /// This is where payload bytes become text: anything that is not valid
    /// UTF-8 is repaired with [`sanitize_utf8`] rather than failing the
    /// batch.
    pub fn from_queued(change: &QueuedChange) -> Self {
        Self {
            table_name: change.table_name.to_string(),
            record_id: change.record_id,
            attr: change.attribute.as_ref().map(ToString::to_string),
            new_value: change.new_value.as_deref().map(sanitize_utf8),
            updated_at: change.observed_at,
        }
    }
}

/// Decodes bytes as UTF-8, replacing each undecodable sequence with `_`.
///
/// Valid input passes through byte-for-byte. The replacement is per
/// invalid sequence, so a single stray byte costs one placeholder, not the
/// record.
pub fn sanitize_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return out;
            }
            Err(error) => {
                let (valid, after) = rest.split_at(error.valid_up_to());
                out.push_str(&String::from_utf8_lossy(valid));
                out.push('_');
                match error.error_len() {
                    Some(len) => rest = &after[len..],
                    // Truncated sequence at the end of input
                    None => return out,
                }
            }
        }
    }
}

/// Parses a timestamp cell from a query response.
///
/// The wire format is RFC 3339, matching how [`WarehouseRow`] timestamps
/// serialize.
pub fn parse_wire_timestamp(cell: &str) -> WarehouseResult<Timestamp> {
    chrono::DateTime::parse_from_rfc3339(cell)
        .map(|parsed| Timestamp::new(parsed.with_timezone(&chrono::Utc)))
        .map_err(|error| {
            WarehouseError::MalformedResponse(format!("bad timestamp '{cell}': {error}"))
        })
}

/// A query result: column names plus rows of stringly-typed cells.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryResponse {
    /// Column names, in select order
    pub schema: Vec<String>,
    /// Result rows; each cell is `None` for NULL
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResponse {
    /// Reads one cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        let index = self.schema.iter().position(|name| name == column)?;
        self.rows.get(row)?.get(index)?.as_deref()
    }
}

/// The warehouse client port.
///
/// A failed [`insert`](WarehouseClient::insert) must have no partial
/// effect visible to the library; the dispatcher treats any `Err` as
/// "nothing was delivered" and leaves the queue untouched for the next
/// tick.
#[async_trait]
pub trait WarehouseClient: Send + Sync {
    /// Creates a dataset.
    async fn create_dataset(&self, name: &str) -> WarehouseResult<()>;

    /// Creates a table with the given schema inside the configured dataset.
    async fn create_table(&self, name: &str, schema: &TableSchema) -> WarehouseResult<()>;

    /// Streams rows into a table. All-or-nothing at the RPC layer.
    async fn insert(&self, table: &str, rows: &[WarehouseRow]) -> WarehouseResult<()>;

    /// Runs a query and returns its rows.
    async fn query(&self, sql: &str) -> WarehouseResult<QueryResponse>;

    /// Lists existing dataset names.
    async fn list_datasets(&self) -> WarehouseResult<Vec<String>>;

    /// Lists existing table names in the configured dataset.
    async fn list_tables(&self) -> WarehouseResult<Vec<String>>;
}

/// Creates the configured dataset and output table if either is missing.
///
/// Safe to call on every startup; existing objects are left alone.
pub async fn ensure_sink<W: WarehouseClient>(
    client: &W,
    config: &crate::config::StreamConfig,
) -> WarehouseResult<()> {
    let datasets = client.list_datasets().await?;
    if !datasets.contains(&config.dataset) {
        tracing::info!(dataset = %config.dataset, "creating warehouse dataset");
        client.create_dataset(&config.dataset).await?;
    }

    let tables = client.list_tables().await?;
    if !tables.contains(&config.output_table_name) {
        tracing::info!(table = %config.output_table_name, "creating warehouse output table");
        client
            .create_table(&config.output_table_name, &datastream_schema())
            .await?;
    }
    Ok(())
}

/// Builders for the canonical statements the library sends through
/// [`WarehouseClient::query`]. Adapters and tests agree on these shapes.
pub mod sql {
    /// The minimum `record_id` already streamed for one source table.
    pub fn min_record_id(project: &str, dataset: &str, table: &str, source_table: &str) -> String {
        format!(
            "SELECT MIN(record_id) AS min_record_id FROM [{project}:{dataset}.{table}] \
             WHERE table_name = '{source_table}'"
        )
    }

    /// The earliest `updated_at` per `(table_name, attr)` pair.
    pub fn earliest_updates(project: &str, dataset: &str, table: &str) -> String {
        format!(
            "SELECT table_name, attr, MIN(updated_at) AS bq_earliest_update \
             FROM [{project}:{dataset}.{table}] GROUP BY table_name, attr"
        )
    }

    /// Every streamed row for the given record ids of one source table.
    pub fn rows_for_records(
        project: &str,
        dataset: &str,
        table: &str,
        source_table: &str,
        record_ids: &[i64],
    ) -> String {
        let ids = record_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "SELECT table_name, record_id, attr, new_value, updated_at \
             FROM [{project}:{dataset}.{table}] \
             WHERE table_name = '{source_table}' AND record_id IN ({ids})"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttributeName, TableName};

    #[test]
    fn datastream_schema_matches_wire_contract() {
        let schema = datastream_schema();
        assert_eq!(schema.fields.len(), 5);

        let names: Vec<_> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["table_name", "record_id", "attr", "new_value", "updated_at"]
        );

        assert_eq!(schema.fields[0].mode, FieldMode::Required);
        assert_eq!(schema.fields[1].field_type, FieldType::Integer);
        assert_eq!(schema.fields[2].mode, FieldMode::Nullable);
        assert_eq!(schema.fields[3].mode, FieldMode::Nullable);
        assert_eq!(schema.fields[4].field_type, FieldType::Timestamp);
    }

    #[test]
    fn schema_serializes_with_wire_field_names() {
        let json = serde_json::to_string(&datastream_schema()).unwrap();
        assert!(json.contains("\"type\":\"STRING\""));
        assert!(json.contains("\"mode\":\"REQUIRED\""));
        assert!(json.contains("\"mode\":\"NULLABLE\""));
    }

    #[test]
    fn sanitize_passes_valid_utf8_through() {
        assert_eq!(sanitize_utf8(b"plain ascii"), "plain ascii");
        assert_eq!(sanitize_utf8("héllo wörld".as_bytes()), "héllo wörld");
        assert_eq!(sanitize_utf8(b""), "");
    }

    #[test]
    fn sanitize_replaces_each_invalid_sequence_with_placeholder() {
        assert_eq!(sanitize_utf8(b"ok\xffok"), "ok_ok");
        assert_eq!(sanitize_utf8(b"\xff\xfe"), "__");
        // Truncated multi-byte sequence at end of input
        assert_eq!(sanitize_utf8(b"abc\xe2\x82"), "abc_");
    }

    #[test]
    fn from_queued_renders_destroy_sentinel() {
        let sentinel = QueuedChange::destroy_sentinel(
            TableName::try_new("orders").unwrap(),
            42,
            Timestamp::now(),
        );
        let row = WarehouseRow::from_queued(&sentinel);

        assert_eq!(row.table_name, "orders");
        assert_eq!(row.record_id, 42);
        assert_eq!(row.attr, None);
        assert_eq!(row.new_value.as_deref(), Some("True"));
    }

    #[test]
    fn from_queued_repairs_invalid_payload_bytes() {
        let change = QueuedChange::attribute_change(
            TableName::try_new("orders").unwrap(),
            7,
            AttributeName::try_new("note").unwrap(),
            Some(b"bad\xffbyte".to_vec()),
            Timestamp::now(),
        );
        let row = WarehouseRow::from_queued(&change);
        assert_eq!(row.new_value.as_deref(), Some("bad_byte"));
    }

    #[test]
    fn query_response_reads_cells_by_column_name() {
        let response = QueryResponse {
            schema: vec!["table_name".to_string(), "attr".to_string()],
            rows: vec![vec![Some("orders".to_string()), None]],
        };

        assert_eq!(response.value(0, "table_name"), Some("orders"));
        assert_eq!(response.value(0, "attr"), None);
        assert_eq!(response.value(0, "missing"), None);
        assert_eq!(response.value(9, "attr"), None);
    }

    #[test]
    fn sql_builders_produce_canonical_statements() {
        assert_eq!(
            sql::min_record_id("proj", "analytics", "bq_datastream", "orders"),
            "SELECT MIN(record_id) AS min_record_id FROM [proj:analytics.bq_datastream] \
             WHERE table_name = 'orders'"
        );
        assert_eq!(
            sql::earliest_updates("proj", "analytics", "bq_datastream"),
            "SELECT table_name, attr, MIN(updated_at) AS bq_earliest_update \
             FROM [proj:analytics.bq_datastream] GROUP BY table_name, attr"
        );
        assert_eq!(
            sql::rows_for_records("proj", "analytics", "bq_datastream", "orders", &[1, 2]),
            "SELECT table_name, record_id, attr, new_value, updated_at \
             FROM [proj:analytics.bq_datastream] \
             WHERE table_name = 'orders' AND record_id IN (1, 2)"
        );
    }
}
