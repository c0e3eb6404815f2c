//! Table enrollment registry.
//!
//! The registry is populated once at startup: the host describes each table
//! it wants captured and picks a capture mode, and the registry derives the
//! attribute allow-list. Everything downstream - extraction, backfill,
//! archiving - consults the registry instead of resolving table or
//! attribute names dynamically at runtime.

use crate::errors::{ConfigError, ConfigResult};
use crate::types::{AttributeName, TableName};
use std::collections::{BTreeMap, BTreeSet};

/// A static description of an enrolled host table's columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDescriptor {
    name: TableName,
    columns: Vec<AttributeName>,
}

impl TableDescriptor {
    /// Creates a descriptor with no columns.
    pub const fn new(name: TableName) -> Self {
        Self {
            name,
            columns: Vec::new(),
        }
    }

    /// Adds a column. Call once per column, in table order.
    #[must_use]
    pub fn with_column(mut self, column: AttributeName) -> Self {
        self.columns.push(column);
        self
    }

    /// The table's name.
    pub const fn name(&self) -> &TableName {
        &self.name
    }

    /// The table's columns, in declaration order.
    pub fn columns(&self) -> &[AttributeName] {
        &self.columns
    }

    fn has_column(&self, column: &AttributeName) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// How the attribute allow-list is derived for one table.
///
/// Exactly one mode is active per enrolled table; enrolling twice is a
/// configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// Track every column.
    All,
    /// Track only the named attributes.
    Only(Vec<AttributeName>),
    /// Track every column except the named attributes.
    Except(Vec<AttributeName>),
}

/// An enrolled table together with its derived allow-list.
#[derive(Debug, Clone)]
pub struct Enrollment {
    descriptor: TableDescriptor,
    allow_list: BTreeSet<AttributeName>,
}

impl Enrollment {
    /// The table's descriptor.
    pub const fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    /// The attributes tracked for this table.
    pub const fn allow_list(&self) -> &BTreeSet<AttributeName> {
        &self.allow_list
    }

    /// Whether the given attribute is tracked.
    pub fn tracks(&self, attribute: &AttributeName) -> bool {
        self.allow_list.contains(attribute)
    }
}

/// The set of tables enrolled for change capture.
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: BTreeMap<TableName, Enrollment>,
}

impl TableRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enrolls a table with the given capture mode.
    ///
    /// Fails fast on the configuration errors the pipeline must never see
    /// at runtime: re-enrollment, an empty `Only`/`Except` list, or a mode
    /// naming an attribute the table does not have.
    pub fn enroll(&mut self, descriptor: TableDescriptor, mode: CaptureMode) -> ConfigResult<()> {
        if self.tables.contains_key(descriptor.name()) {
            return Err(ConfigError::AlreadyEnrolled(descriptor.name().clone()));
        }

        let allow_list = match mode {
            CaptureMode::All => descriptor.columns().iter().cloned().collect(),
            CaptureMode::Only(attributes) => {
                if attributes.is_empty() {
                    return Err(ConfigError::EmptyAttributeList(descriptor.name().clone()));
                }
                for attribute in &attributes {
                    if !descriptor.has_column(attribute) {
                        return Err(ConfigError::UnknownAttribute {
                            table: descriptor.name().clone(),
                            attribute: attribute.clone(),
                        });
                    }
                }
                attributes.into_iter().collect()
            }
            CaptureMode::Except(attributes) => {
                if attributes.is_empty() {
                    return Err(ConfigError::EmptyAttributeList(descriptor.name().clone()));
                }
                for attribute in &attributes {
                    if !descriptor.has_column(attribute) {
                        return Err(ConfigError::UnknownAttribute {
                            table: descriptor.name().clone(),
                            attribute: attribute.clone(),
                        });
                    }
                }
                let excluded: BTreeSet<_> = attributes.into_iter().collect();
                descriptor
                    .columns()
                    .iter()
                    .filter(|column| !excluded.contains(*column))
                    .cloned()
                    .collect()
            }
        };

        let name = descriptor.name().clone();
        self.tables.insert(
            name,
            Enrollment {
                descriptor,
                allow_list,
            },
        );
        Ok(())
    }

    /// Looks up a table's enrollment.
    pub fn enrollment(&self, table: &TableName) -> Option<&Enrollment> {
        self.tables.get(table)
    }

    /// The allow-list for a table, if enrolled.
    pub fn allow_list(&self, table: &TableName) -> Option<&BTreeSet<AttributeName>> {
        self.tables.get(table).map(Enrollment::allow_list)
    }

    /// Whether a table is enrolled.
    pub fn is_enrolled(&self, table: &TableName) -> bool {
        self.tables.contains_key(table)
    }

    /// All enrolled table names.
    pub fn tables(&self) -> impl Iterator<Item = &TableName> + '_ {
        self.tables.keys()
    }

    /// Every tracked `(table, attribute)` pair, the cursor key space.
    pub fn tracked_pairs(&self) -> Vec<(TableName, AttributeName)> {
        self.tables
            .iter()
            .flat_map(|(table, enrollment)| {
                enrollment
                    .allow_list()
                    .iter()
                    .map(move |attribute| (table.clone(), attribute.clone()))
            })
            .collect()
    }
}
