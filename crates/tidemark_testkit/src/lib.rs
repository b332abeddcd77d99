//! # Tidemark Testkit
//!
//! Test utilities for Tidemark sync.
//!
//! This crate provides:
//! - A `Note` entity with its codec and table schema
//! - A harness wiring in-memory stores and a manual clock to an engine
//! - Property-based test generators using proptest
//! - Tracing setup for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tidemark_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn downloads_notes() {
//!     let harness = TestHarness::new();
//!     harness.seed_remote("milk", 10);
//!     harness.engine().sync().await.unwrap();
//!     assert_eq!(harness.local.len(), 1);
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
}

pub use fixtures::*;
pub use generators::*;

/// Installs a fmt subscriber writing through the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Safe to call
/// from every test.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
