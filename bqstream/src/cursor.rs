//! Backfill cursor storage.
//!
//! One cursor row per tracked `(table, attribute)` pair records how far
//! back in history streaming has reached. `earliest_synced_at` only ever
//! moves toward the configured cutoff; once a scan at the cutoff boundary
//! comes back empty the row is archived and backfill stops touching that
//! table. A reserved sentinel row stores the deploy revision that last
//! validated the cursor set, so reconciliation against the registry runs
//! once per deploy instead of every tick.

use crate::errors::CursorResult;
use crate::types::{AttributeName, TableName, Timestamp};
use async_trait::async_trait;

/// The reserved `table_name` of the deploy-revision sentinel row.
pub const REVISION_SENTINEL: &str = "! revision !";

/// Backfill progress for one `(table, attribute)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillCursor {
    /// The enrolled table
    pub table_name: TableName,
    /// The tracked attribute
    pub attribute: AttributeName,
    /// The earliest `created_at` already streamed for this pair.
    /// `None` means backfill has not touched the pair yet and scanning
    /// starts from "now".
    pub earliest_synced_at: Option<Timestamp>,
    /// Whether history between the cutoff and the cursor is exhausted
    pub archived: bool,
}

impl BackfillCursor {
    /// Creates a fresh, unarchived cursor with no progress.
    pub const fn new(table_name: TableName, attribute: AttributeName) -> Self {
        Self {
            table_name,
            attribute,
            earliest_synced_at: None,
            archived: false,
        }
    }
}

/// Storage port for backfill cursors and the revision sentinel.
///
/// The sentinel row is not a cursor: [`all`](CursorStore::all) and
/// [`for_table`](CursorStore::for_table) never return it, and it is only
/// reachable through the revision accessors.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Every cursor row, excluding the revision sentinel.
    async fn all(&self) -> CursorResult<Vec<BackfillCursor>>;

    /// The cursor rows for one table.
    async fn for_table(&self, table: &TableName) -> CursorResult<Vec<BackfillCursor>>;

    /// Creates the cursor row if it does not exist; existing rows keep
    /// their progress.
    async fn ensure(&self, table: &TableName, attribute: &AttributeName) -> CursorResult<()>;

    /// Removes the cursor row for a de-registered attribute.
    async fn remove(&self, table: &TableName, attribute: &AttributeName) -> CursorResult<()>;

    /// Sets `earliest_synced_at` for a single cursor row, creating it if
    /// missing.
    async fn set_earliest(
        &self,
        table: &TableName,
        attribute: &AttributeName,
        earliest: Timestamp,
    ) -> CursorResult<()>;

    /// Sets `earliest_synced_at` on every cursor row of a table; rows
    /// sharing a table advance together.
    async fn set_earliest_for_table(
        &self,
        table: &TableName,
        earliest: Timestamp,
    ) -> CursorResult<()>;

    /// Sets the archived flag on every cursor row of a table.
    async fn set_archived(&self, table: &TableName, archived: bool) -> CursorResult<()>;

    /// Clears the archived flag on every cursor row.
    async fn reset_archived(&self) -> CursorResult<()>;

    /// Whether any cursor row still has history to stream relative to the
    /// cutoff: `earliest_synced_at` is unset or has not yet reached it.
    async fn any_behind(&self, cutoff: Timestamp) -> CursorResult<bool>;

    /// The deploy revision recorded by the sentinel row, if any.
    async fn deploy_revision(&self) -> CursorResult<Option<String>>;

    /// Stamps the sentinel row with the given deploy revision.
    async fn set_deploy_revision(&self, revision: &str) -> CursorResult<()>;
}
