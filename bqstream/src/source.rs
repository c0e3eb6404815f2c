//! Host-table read contract.
//!
//! The library never touches the host's object model or ORM. Everything it
//! needs from enrolled tables - live rows for backfill, descending ID
//! windows for archiving, single rows for auditing - goes through the
//! [`SourceReader`] port, which the host persistence layer implements once
//! at startup.

use crate::errors::SourceResult;
use crate::types::{AttributeName, TableName, Timestamp};
use async_trait::async_trait;
use chrono_tz::Tz;
use std::collections::BTreeMap;

/// A typed attribute value read from a host table or reported in a diff.
///
/// Values stay typed until they are rendered for the queue or the
/// warehouse, so temporal normalization happens exactly once, at
/// stringification time.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// SQL NULL
    Null,
    /// A boolean column value
    Bool(bool),
    /// An integer column value
    Integer(i64),
    /// A floating point column value
    Float(f64),
    /// A text column value
    Text(String),
    /// A binary column value; may be arbitrary bytes
    Bytes(Vec<u8>),
    /// A temporal column value, held in UTC until rendered
    Timestamp(Timestamp),
}

impl AttributeValue {
    /// Returns whether the value is SQL NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Renders the value as a queue payload.
    ///
    /// Returns `None` for NULL. Temporal values are converted to the given
    /// timezone and formatted as RFC 3339; binary values pass through
    /// untouched (UTF-8 repair happens at dispatch time, not here).
    pub fn render(&self, timezone: Tz) -> Option<Vec<u8>> {
        match self {
            Self::Null => None,
            Self::Bool(value) => Some(value.to_string().into_bytes()),
            Self::Integer(value) => Some(value.to_string().into_bytes()),
            Self::Float(value) => Some(value.to_string().into_bytes()),
            Self::Text(value) => Some(value.clone().into_bytes()),
            Self::Bytes(value) => Some(value.clone()),
            Self::Timestamp(value) => Some(
                value
                    .as_datetime()
                    .with_timezone(&timezone)
                    .to_rfc3339()
                    .into_bytes(),
            ),
        }
    }
}

/// One row of an enrolled host table.
///
/// `id`, `created_at`, and `updated_at` are first-class because every
/// enrolled table must expose them; all other columns live in the value
/// map.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    /// The row's primary key
    pub id: i64,
    /// When the row was created
    pub created_at: Timestamp,
    /// When the row was last updated
    pub updated_at: Timestamp,
    values: BTreeMap<AttributeName, AttributeValue>,
}

impl SourceRow {
    /// Creates a row with no additional column values.
    pub const fn new(id: i64, created_at: Timestamp, updated_at: Timestamp) -> Self {
        Self {
            id,
            created_at,
            updated_at,
            values: BTreeMap::new(),
        }
    }

    /// Adds a column value.
    #[must_use]
    pub fn with_value(mut self, attribute: AttributeName, value: AttributeValue) -> Self {
        self.values.insert(attribute, value);
        self
    }

    /// Reads a column value by attribute name.
    ///
    /// The `id`, `created_at`, and `updated_at` struct fields answer for
    /// their attribute names so cursor rows tracking those columns read the
    /// same way as any other. Unknown attributes read as NULL.
    pub fn value(&self, attribute: &AttributeName) -> AttributeValue {
        if let Some(value) = self.values.get(attribute) {
            return value.clone();
        }
        match attribute.as_ref() {
            "id" => AttributeValue::Integer(self.id),
            "created_at" => AttributeValue::Timestamp(self.created_at),
            "updated_at" => AttributeValue::Timestamp(self.updated_at),
            _ => AttributeValue::Null,
        }
    }
}

/// Read access to enrolled host tables.
///
/// Implementations are expected to translate these calls to indexed range
/// queries; every method is on the hot path of either backfill or archive.
#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Returns the latest `created_at` strictly below `ceiling` and at or
    /// after `floor`, or `None` when no row remains in that range.
    ///
    /// This is the backfill scan: the caller walks backward one timestamp
    /// at a time, and rows sharing that timestamp move together.
    async fn next_created_at_before(
        &self,
        table: &TableName,
        floor: Timestamp,
        ceiling: Timestamp,
    ) -> SourceResult<Option<Timestamp>>;

    /// Returns every row of `table` with exactly this `created_at`.
    async fn rows_created_at(
        &self,
        table: &TableName,
        created_at: Timestamp,
    ) -> SourceResult<Vec<SourceRow>>;

    /// Returns up to `limit` rows with ids in `floor_id..=ceiling_id`,
    /// ordered by id descending. The archiver's window fetch.
    async fn rows_in_id_window(
        &self,
        table: &TableName,
        ceiling_id: i64,
        floor_id: i64,
        limit: usize,
    ) -> SourceResult<Vec<SourceRow>>;

    /// Returns the id of the first row created at or after `cutoff`.
    async fn first_id_at_or_after(
        &self,
        table: &TableName,
        cutoff: Timestamp,
    ) -> SourceResult<Option<i64>>;

    /// Returns the largest id in `table`, or `None` for an empty table.
    async fn max_id(&self, table: &TableName) -> SourceResult<Option<i64>>;

    /// Fetches a single row by id.
    async fn row(&self, table: &TableName, id: i64) -> SourceResult<Option<SourceRow>>;
}
