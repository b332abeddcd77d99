//! Table layout descriptor.

/// Describes where a synchronized table keeps its bookkeeping columns.
///
/// Stores use this to resolve [`crate::RowKey`]s, to run the modified-since
/// range query, and to enforce uniqueness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    /// Table name.
    pub table: String,
    /// Primary key column, assigned by the store on insert.
    pub local_id_column: String,
    /// Column holding the remote object id.
    pub remote_id_column: String,
    /// Column holding the local modification time.
    pub modified_column: String,
    /// Column holding the last known remote modification time.
    pub remote_modified_column: String,
    /// Additional columns that must be unique when non-null.
    pub unique_columns: Vec<String>,
}

impl TableSchema {
    /// Creates a schema with the default column names
    /// (`_id`, `server_id`, `modified`, `server_modified`).
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            local_id_column: "_id".into(),
            remote_id_column: "server_id".into(),
            modified_column: "modified".into(),
            remote_modified_column: "server_modified".into(),
            unique_columns: Vec::new(),
        }
    }

    /// Sets the local id column.
    #[must_use]
    pub fn with_local_id_column(mut self, column: impl Into<String>) -> Self {
        self.local_id_column = column.into();
        self
    }

    /// Sets the remote id column.
    #[must_use]
    pub fn with_remote_id_column(mut self, column: impl Into<String>) -> Self {
        self.remote_id_column = column.into();
        self
    }

    /// Sets the local modification column.
    #[must_use]
    pub fn with_modified_column(mut self, column: impl Into<String>) -> Self {
        self.modified_column = column.into();
        self
    }

    /// Sets the remote modification column.
    #[must_use]
    pub fn with_remote_modified_column(mut self, column: impl Into<String>) -> Self {
        self.remote_modified_column = column.into();
        self
    }

    /// Adds a column that must be unique.
    #[must_use]
    pub fn with_unique_column(mut self, column: impl Into<String>) -> Self {
        self.unique_columns.push(column.into());
        self
    }

    /// Every column whose non-null values must be unique, remote id first.
    pub fn unique(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.remote_id_column.as_str())
            .chain(self.unique_columns.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let schema = TableSchema::new("notes");
        assert_eq!(schema.local_id_column, "_id");
        assert_eq!(schema.remote_id_column, "server_id");
        assert_eq!(schema.modified_column, "modified");
        assert_eq!(schema.remote_modified_column, "server_modified");
    }

    #[test]
    fn unique_includes_remote_id() {
        let schema = TableSchema::new("notes")
            .with_remote_id_column("remote_key")
            .with_unique_column("slug");
        let unique: Vec<_> = schema.unique().collect();
        assert_eq!(unique, vec!["remote_key", "slug"]);
    }
}
