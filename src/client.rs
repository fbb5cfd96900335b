//! The per-client record: client id, the Pager back-pointer, the list of
//! pages currently locked by this client, and write-lock timing counters.
//!
//! Owned by the caller, freed on disconnect. Not `Sync` — `aLock[]` is
//! single-threaded per the concurrency model; a client record is never
//! shared across threads without external synchronization.

use std::sync::Arc;

use crate::error::LockError;
use crate::logger::Logger;
use crate::pager::Pager;
use crate::registry::{HmaHandle, Registry};

/// Client slot index, `0..C`.
pub type ClientId = u32;

/// Zero-sized marker whose `Weak` is stashed in the owning HMA's local
/// client table. Its strong-count reaching zero on `Client` drop is what
/// invalidates that table entry — see the design notes on replacing the
/// original's intrusive raw pointers with weak back-references.
pub(crate) struct ClientAlive;

/// Cumulative writer-lock timing, updated whenever the sentinel page (0)
/// lock is released.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteStats {
    pub cumulative_micros: u64,
    pub last_acquired_micros: Option<u64>,
}

/// Geometrically-growing list of pages locked by one client during the
/// current transaction, released in recorded order by `end`.
///
/// Growth failures are reported as `NoMem` and never leave the list
/// mutated — `try_reserve` is checked before the value is recorded.
#[derive(Debug, Default)]
pub struct PageLockList {
    pages: Vec<u32>,
}

const INITIAL_LOCK_LIST_CAPACITY: usize = 128;

impl PageLockList {
    pub fn new() -> Self {
        PageLockList { pages: Vec::new() }
    }

    pub fn push(&mut self, page: u32) -> Result<(), LockError> {
        if self.pages.len() == self.pages.capacity() {
            let additional = if self.pages.capacity() == 0 {
                INITIAL_LOCK_LIST_CAPACITY
            } else {
                self.pages.capacity()
            };
            self.pages.try_reserve(additional).map_err(|_| LockError::NoMem)?;
        }
        self.pages.push(page);
        Ok(())
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, u32> {
        self.pages.drain(..)
    }
}

/// A live connection to an HMA: the handle shared with every other client
/// in this process and across processes via the mapped file, the client id
/// this connection claimed, and everything needed to release its locks.
pub struct Client {
    pub(crate) handle: Arc<HmaHandle>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pager: Box<dyn Pager>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) id: ClientId,
    pub(crate) locks: PageLockList,
    pub(crate) in_transaction: bool,
    pub(crate) writer_period_start: Option<u64>,
    pub(crate) write_stats: WriteStats,
    pub(crate) alive: Arc<ClientAlive>,
    pub(crate) disconnected: bool,
}

impl Client {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn write_stats(&self) -> WriteStats {
        self.write_stats
    }
}
