//! The exhaustive error taxonomy from the error-handling design.
//!
//! Every public entry point returns `Result<T, LockError>`; there is no
//! sentinel `Ok` variant distinct from `Result::Ok`.

use std::io;

#[derive(thiserror::Error, Debug)]
pub enum LockError {
    /// Non-blocking contention that is not a detected deadlock.
    #[error("lock operation would block")]
    Busy,

    /// Kernel-reported EDEADLK, or contention with a live client that
    /// cannot be overcome.
    #[error("deadlock detected or conflict could not be resolved")]
    BusyDeadlock,

    /// `stat`/`open`/`ftruncate`/`mmap` failure on the HMA file.
    #[error("cannot open HMA file: {0}")]
    CantOpen(#[source] io::Error),

    /// Any allocation failure; no partial lock state is installed.
    #[error("allocation failed")]
    NoMem,

    /// Catch-all mapping/initialization failure.
    #[error("{0}")]
    Error(String),
}

impl LockError {
    pub(crate) fn cant_open(e: io::Error) -> Self {
        LockError::CantOpen(e)
    }
}
