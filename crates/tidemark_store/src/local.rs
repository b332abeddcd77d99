//! Local store capability.

use crate::error::{StoreError, StoreResult};
use tidemark_protocol::Record;

/// Local primary key, assigned by the store and immutable once assigned.
pub type LocalId = i64;

/// Selects the row an update or lookup applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKey<'a> {
    /// Match on the local primary key.
    Local(LocalId),
    /// Match on the remote object id column.
    Remote(&'a str),
}

/// Writes performed inside one local transaction.
///
/// Nothing written through a transaction is visible to other readers until
/// the enclosing [`LocalStore::transaction`] call commits.
pub trait LocalTransaction {
    /// Sets the given columns on every row matching `key`.
    ///
    /// Returns the number of matched rows. The local id column is never
    /// rewritten.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Constraint`] if the new values collide with a
    /// unique column of another row.
    fn update(&mut self, key: RowKey<'_>, fields: &Record) -> StoreResult<usize>;

    /// Inserts a row and returns its local id.
    ///
    /// Returns `Ok(None)` if the row was rejected by a constraint; this is the
    /// store's failure sentinel, distinct from an I/O error.
    fn insert(&mut self, fields: &Record) -> StoreResult<Option<LocalId>>;

    /// Reads the local modification time of the row matching `key`.
    fn modified_at(&self, key: RowKey<'_>) -> StoreResult<Option<i64>>;
}

/// A transactional record store holding one synchronized table.
///
/// # Invariants
///
/// - `transaction` commits only if the closure returns `Ok`; any `Err`
///   (or a panic) discards every write made through the transaction
/// - `modified_since` is strictly greater-than and ascending
/// - Implementations must be `Send + Sync`
pub trait LocalStore: Send + Sync {
    /// Transaction handle passed to [`LocalStore::transaction`] closures.
    type Transaction: LocalTransaction;

    /// Name of the synchronized table, used in diagnostics.
    fn table(&self) -> &str;

    /// Runs `f` inside a transaction.
    ///
    /// If `f` returns `Ok`, the transaction is committed. If it returns `Err`
    /// the transaction is rolled back and the error is returned unchanged.
    fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Transaction) -> Result<T, E>,
        E: From<StoreError>;

    /// Updates one row outside any caller transaction, atomically.
    ///
    /// Returns the number of matched rows.
    fn update(&self, key: RowKey<'_>, fields: &Record) -> StoreResult<usize>;

    /// Returns every row whose local modification time is strictly greater
    /// than `threshold`, ordered ascending by that time.
    ///
    /// An empty vector means nothing changed; an error means the query
    /// itself failed.
    fn modified_since(&self, threshold: i64) -> StoreResult<Vec<Record>>;

    /// Returns the largest remote modification time stored locally, or 0.
    fn biggest_remote_time(&self) -> StoreResult<i64>;
}
