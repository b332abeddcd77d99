//! # Tidemark Protocol
//!
//! Remote object model and query types for Tidemark sync.
//!
//! This crate provides:
//! - [`RemoteObject`] and [`Record`] for objects exchanged with a remote collection
//! - [`Clause`] filter trees (base predicate, exclusive "greater-than", conjunction)
//! - [`QueryParams`], [`PageCursor`] and [`QueryPage`] for cursor-continued queries
//! - [`RemoteAck`] for the id/time a remote store assigns on create or update
//!
//! This is a pure data crate with no I/O operations. Every type serializes
//! with serde so a concrete transport can put it on the wire as JSON.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clause;
mod object;
mod query;

pub use clause::{compare_values, Clause};
pub use object::{RemoteAck, RemoteObject, Record, ID_FIELD, MODIFIED_FIELD};
pub use query::{PageCursor, QueryPage, QueryParams};
