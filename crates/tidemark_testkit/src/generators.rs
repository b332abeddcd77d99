//! Property-based test generators using proptest.
//!
//! Provides strategies for remote collections, local change sets and page
//! sizes that keep the invariants the sync engine relies on.

use crate::fixtures::Note;
use proptest::prelude::*;

/// Strategy for note titles.
pub fn title_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9 ]{0,15}").expect("Invalid regex")
}

/// Strategy for a note that has never been synced.
pub fn note_strategy() -> impl Strategy<Value = Note> {
    (title_strategy(), prop::string::string_regex("[a-z ]{0,40}").expect("Invalid regex"))
        .prop_map(|(title, body)| Note::new(title, body))
}

/// Strategy for a remote collection: titles with positive modification
/// times, duplicates allowed, in no particular order.
pub fn remote_collection_strategy(max_len: usize) -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec((title_strategy(), 1i64..10_000), 0..=max_len)
}

/// Strategy for download page sizes.
pub fn page_size_strategy() -> impl Strategy<Value = u32> {
    1u32..=12
}

/// One locally changed note and whether it already exists remotely.
#[derive(Debug, Clone)]
pub struct LocalChange {
    /// The note.
    pub note: Note,
    /// Whether the note should be given a remote id before syncing.
    pub synced_before: bool,
}

/// Strategy for a set of local changes.
pub fn local_changes_strategy(max_len: usize) -> impl Strategy<Value = Vec<LocalChange>> {
    prop::collection::vec(
        (note_strategy(), any::<bool>()).prop_map(|(note, synced_before)| LocalChange {
            note,
            synced_before,
        }),
        0..=max_len,
    )
}

/// Configuration for property tests.
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn titles_are_never_empty(title in title_strategy()) {
            prop_assert!(!title.is_empty());
        }

        #[test]
        fn remote_times_are_positive(collection in remote_collection_strategy(20)) {
            prop_assert!(collection.len() <= 20);
            prop_assert!(collection.iter().all(|(_, time)| *time > 0));
        }

        #[test]
        fn generated_notes_are_unsynced(note in note_strategy()) {
            prop_assert!(note.local_id.is_none());
            prop_assert!(note.remote_id.is_none());
        }
    }
}
