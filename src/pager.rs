//! The Pager collaborator this crate treats as external.
//!
//! The B-tree, journal format, and VFS are out of scope; we only need the
//! three operations a page-lock manager calls into a pager for.

use std::path::Path;

use crate::client::ClientId;
use crate::error::LockError;

/// External collaborator: the single-writer storage engine sharing a
/// database file through this lock manager.
pub trait Pager: Send + Sync {
    /// The database file path (the HMA file name is derived from this).
    fn filename(&self) -> &Path;

    /// Replay or discard the rollback journal belonging to `client_id`.
    /// Called once per crashed slot discovered, whether at `connect` time
    /// or during `overcome`'s dead-peer recovery.
    fn rollback_journal(&self, client_id: ClientId) -> Result<(), LockError>;

    /// Attempt to take an exclusive lock on the main database file.
    /// Returns `Ok(true)` if granted (caller may unlink the HMA file),
    /// `Ok(false)` if some other process still holds it open.
    fn lock_database_file_exclusive(&self) -> Result<bool, LockError>;
}
