//! Fixed parameters of the HMA layout, bundled so tests can shrink them.
//!
//! Production code should use [`HmaConfig::default`]; the numbers there are
//! the wire-format constants from the spec and must not be changed without
//! also changing every on-disk deployment.

use std::path::{Path, PathBuf};

/// Bundle of the parameters that determine an HMA file's size and shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HmaConfig {
    /// Maximum concurrent connections per HMA (`C` in the layout).
    pub client_slots: u32,
    /// Number of page-locking slots (`P` in the layout).
    pub page_slots: u32,
    /// Suffix appended to the database path to name the HMA file.
    pub file_suffix: &'static str,
    /// Bound on transient CAS retries against a same-instant concurrent
    /// installer before yielding the thread. Scheduling courtesy only;
    /// the acquisition loop itself is otherwise unbounded by design.
    pub lock_retry_spins: u32,
}

impl Default for HmaConfig {
    fn default() -> Self {
        HmaConfig {
            client_slots: 16,
            page_slots: 262_144,
            file_suffix: "-hma",
            lock_retry_spins: 64,
        }
    }
}

impl HmaConfig {
    /// Total size of the HMA file in bytes: one DMS word, `C` client words,
    /// `P` page-lock words.
    pub fn region_size(&self) -> u64 {
        4 + 4 * self.client_slots as u64 + 4 * self.page_slots as u64
    }

    /// Word index of a client slot (`1..=C`).
    pub fn client_word_index(&self, id: u32) -> u64 {
        1 + id as u64
    }

    /// Word index of a page-lock slot, wrapping `page` into `0..P`.
    pub fn page_word_index(&self, page: u32) -> u64 {
        1 + self.client_slots as u64 + (page % self.page_slots) as u64
    }

    /// Derive the HMA file path from a database path.
    pub fn hma_path(&self, db_path: &Path) -> PathBuf {
        let mut os = db_path.as_os_str().to_owned();
        os.push(self.file_suffix);
        PathBuf::from(os)
    }
}
