//! # Tidemark Engine
//!
//! Watermark-based bidirectional sync between a local table and a remote
//! object collection.
//!
//! This crate provides:
//! - The sync cycle state machine (idle → downloading → applying →
//!   collecting → uploading → committing)
//! - The remote store and entity codec capabilities
//! - Download conflict policies and upload failure policies
//! - Retry with exponential backoff
//! - An in-memory remote collection for tests and demos
//!
//! ## Architecture
//!
//! One cycle runs five phases in strict sequence:
//! 1. Download every remote object newer than the biggest remote time
//!    already stored locally, page by page, in ascending modification order
//! 2. Apply the whole batch in one local transaction, stamping rows with the
//!    current watermark
//! 3. Collect local rows modified after the watermark
//! 4. Upload each of them independently and write the assigned remote state
//!    back, stamped with the cycle time
//! 5. Commit the cycle time as the new watermark
//!
//! ## Key Invariants
//!
//! - The watermark only advances when every phase succeeded
//! - Downloaded rows never echo back as uploads in the same cycle
//! - A failed apply leaves no downloaded entity in the local store
//! - An entity with a remote id is updated, one without is created

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod codec;
mod config;
mod engine;
mod error;
mod remote;
mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::EntityCodec;
pub use config::{ConflictPolicy, RetryConfig, SyncConfig, UploadPolicy};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use remote::{MemoryRemoteStore, RemoteStore};
pub use state::{
    DownloadConflict, SyncCycleResult, SyncState, SyncStats, UploadFailure, UploadStage,
};
