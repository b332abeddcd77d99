//! # Tidemark Store
//!
//! Local store and watermark capabilities for Tidemark sync.
//!
//! The sync engine never talks to a concrete database. It drives two
//! capabilities defined here:
//!
//! - [`LocalStore`] - a transactional table with update-by-key, insert,
//!   and a range query over the local modification column
//! - [`WatermarkStore`] - one durable integer per sync scope
//!
//! ## Available Implementations
//!
//! - [`MemoryLocalStore`] - Snapshot-transactional in-memory table
//! - [`MemoryWatermarkStore`] - For testing and ephemeral sync state
//! - [`FileWatermarkStore`] - Durable JSON file guarded by an advisory lock
//!
//! ## Example
//!
//! ```rust
//! use tidemark_store::{LocalStore, LocalTransaction, MemoryLocalStore, RowKey, TableSchema};
//! use serde_json::json;
//!
//! let store = MemoryLocalStore::new(TableSchema::new("notes"));
//! let mut row = tidemark_protocol::Record::new();
//! row.insert("title".into(), json!("milk"));
//! row.insert("modified".into(), json!(5));
//!
//! let id = store
//!     .transaction(|txn| txn.insert(&row))
//!     .unwrap()
//!     .expect("no constraint violated");
//! assert!(store.get(RowKey::Local(id)).is_some());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod local;
mod memory;
mod schema;
mod watermark;

pub use error::{StoreError, StoreResult};
pub use local::{LocalId, LocalStore, LocalTransaction, RowKey};
pub use memory::{MemoryLocalStore, MemoryTransaction};
pub use schema::TableSchema;
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};
