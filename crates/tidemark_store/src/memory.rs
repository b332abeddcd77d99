//! In-memory local store.

use crate::error::{StoreError, StoreResult};
use crate::local::{LocalId, LocalStore, LocalTransaction, RowKey};
use crate::schema::TableSchema;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tidemark_protocol::Record;

/// Rows of one table plus the next id to assign.
#[derive(Debug, Clone)]
struct Table {
    rows: BTreeMap<LocalId, Record>,
    next_id: LocalId,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl Table {
    fn find(&self, schema: &TableSchema, key: RowKey<'_>) -> Vec<LocalId> {
        match key {
            RowKey::Local(id) => self
                .rows
                .contains_key(&id)
                .then_some(id)
                .into_iter()
                .collect(),
            RowKey::Remote(remote_id) => self
                .rows
                .iter()
                .filter(|(_, row)| {
                    row.get(&schema.remote_id_column).and_then(Value::as_str) == Some(remote_id)
                })
                .map(|(id, _)| *id)
                .collect(),
        }
    }

    /// Returns the first unique column `row` collides on, ignoring `exclude`.
    fn unique_violation(
        &self,
        schema: &TableSchema,
        row: &Record,
        exclude: Option<LocalId>,
    ) -> Option<String> {
        for column in schema.unique() {
            let Some(value) = row.get(column).filter(|v| !v.is_null()) else {
                continue;
            };
            let taken = self
                .rows
                .iter()
                .filter(|(id, _)| Some(**id) != exclude)
                .any(|(_, other)| other.get(column) == Some(value));
            if taken {
                return Some(column.to_string());
            }
        }
        None
    }
}

/// An in-memory, single-table local store.
///
/// Transactions work on a snapshot of the table: commit swaps the snapshot
/// in, rollback drops it. The table lock is held for the whole transaction,
/// so no other writer or reader observes intermediate state.
///
/// # Constraints
///
/// - The local id column is the primary key and is assigned on insert
///   unless the inserted fields carry one
/// - The remote id column and every [`TableSchema::unique_columns`] entry
///   must be unique among non-null values
///
/// # Example
///
/// ```rust
/// use tidemark_store::{LocalStore, MemoryLocalStore, TableSchema};
///
/// let store = MemoryLocalStore::new(TableSchema::new("notes"));
/// assert_eq!(store.biggest_remote_time().unwrap(), 0);
/// assert!(store.modified_since(0).unwrap().is_empty());
/// ```
#[derive(Debug)]
pub struct MemoryLocalStore {
    schema: Arc<TableSchema>,
    table: Mutex<Table>,
}

impl MemoryLocalStore {
    /// Creates an empty store for the given table.
    #[must_use]
    pub fn new(schema: TableSchema) -> Self {
        Self {
            schema: Arc::new(schema),
            table: Mutex::new(Table::default()),
        }
    }

    /// Returns the table schema.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Inserts a row in its own transaction.
    ///
    /// Returns `None` if a constraint rejected the row.
    pub fn insert(&self, fields: &Record) -> StoreResult<Option<LocalId>> {
        self.transaction(|txn| txn.insert(fields))
    }

    /// Returns a copy of the first row matching `key`.
    pub fn get(&self, key: RowKey<'_>) -> Option<Record> {
        let table = self.table.lock();
        let id = table.find(&self.schema, key).into_iter().next()?;
        table.rows.get(&id).cloned()
    }

    /// Returns a copy of every row, ordered by local id.
    pub fn rows(&self) -> Vec<Record> {
        self.table.lock().rows.values().cloned().collect()
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.table.lock().rows.len()
    }

    /// Returns true if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalStore for MemoryLocalStore {
    type Transaction = MemoryTransaction;

    fn table(&self) -> &str {
        &self.schema.table
    }

    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Transaction) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.table.lock();
        let mut txn = MemoryTransaction {
            schema: Arc::clone(&self.schema),
            table: guard.clone(),
        };

        match f(&mut txn) {
            Ok(value) => {
                *guard = txn.table;
                tracing::trace!(table = %self.schema.table, "transaction committed");
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(table = %self.schema.table, "transaction rolled back");
                Err(e)
            }
        }
    }

    fn update(&self, key: RowKey<'_>, fields: &Record) -> StoreResult<usize> {
        self.transaction(|txn| txn.update(key, fields))
    }

    fn modified_since(&self, threshold: i64) -> StoreResult<Vec<Record>> {
        let table = self.table.lock();
        let column = &self.schema.modified_column;

        let mut changed: Vec<(i64, LocalId, &Record)> = table
            .rows
            .iter()
            .filter_map(|(id, row)| {
                let modified = row.get(column).and_then(Value::as_i64)?;
                (modified > threshold).then_some((modified, *id, row))
            })
            .collect();
        changed.sort_by_key(|(modified, id, _)| (*modified, *id));

        Ok(changed.into_iter().map(|(_, _, row)| row.clone()).collect())
    }

    fn biggest_remote_time(&self) -> StoreResult<i64> {
        let table = self.table.lock();
        let column = &self.schema.remote_modified_column;

        Ok(table
            .rows
            .values()
            .filter_map(|row| row.get(column).and_then(Value::as_i64))
            .max()
            .unwrap_or(0))
    }
}

/// Working copy of the table inside a [`MemoryLocalStore`] transaction.
#[derive(Debug)]
pub struct MemoryTransaction {
    schema: Arc<TableSchema>,
    table: Table,
}

impl LocalTransaction for MemoryTransaction {
    fn update(&mut self, key: RowKey<'_>, fields: &Record) -> StoreResult<usize> {
        let ids = self.table.find(&self.schema, key);
        let mut updated = Vec::with_capacity(ids.len());

        for id in &ids {
            let mut row = self.table.rows.get(id).cloned().unwrap_or_default();
            for (column, value) in fields {
                if *column != self.schema.local_id_column {
                    row.insert(column.clone(), value.clone());
                }
            }
            if let Some(column) = self.table.unique_violation(&self.schema, &row, Some(*id)) {
                return Err(StoreError::Constraint {
                    table: self.schema.table.clone(),
                    column,
                });
            }
            updated.push((*id, row));
        }

        for (id, row) in updated {
            self.table.rows.insert(id, row);
        }
        Ok(ids.len())
    }

    fn insert(&mut self, fields: &Record) -> StoreResult<Option<LocalId>> {
        let requested = fields
            .get(&self.schema.local_id_column)
            .and_then(Value::as_i64);
        let id = match requested {
            Some(id) if self.table.rows.contains_key(&id) => return Ok(None),
            Some(id) => id,
            None => self.table.next_id,
        };

        let mut row = fields.clone();
        row.insert(self.schema.local_id_column.clone(), Value::from(id));
        if self.table.unique_violation(&self.schema, &row, None).is_some() {
            return Ok(None);
        }

        self.table.rows.insert(id, row);
        self.table.next_id = self.table.next_id.max(id + 1);
        Ok(Some(id))
    }

    fn modified_at(&self, key: RowKey<'_>) -> StoreResult<Option<i64>> {
        Ok(self
            .table
            .find(&self.schema, key)
            .first()
            .and_then(|id| self.table.rows.get(id))
            .and_then(|row| row.get(&self.schema.modified_column))
            .and_then(Value::as_i64))
    }
}
