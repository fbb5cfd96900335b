//! The client registry: a process-global table of live HMAs, each with its
//! own table of local clients, serialized by one mutex.
//!
//! Per the design notes, this is an explicit value an embedding application
//! owns (typically as `Arc<Registry>`) rather than a process-wide `static`
//! with a hidden lock — the one exception the teacher crate itself makes
//! is a lazily-initialized base `Instant`, nothing resource-owning.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::client::{Client, ClientAlive, ClientId, PageLockList, WriteStats};
use crate::config::HmaConfig;
use crate::engine;
use crate::error::LockError;
use crate::hma::{oslock, HmaRegion, LockMode};
use crate::logger::Logger;
use crate::pager::Pager;

type HmaKey = (u64, u64);

/// One HMA file as seen by this process: the mapping plus its filesystem
/// identity. Shared by every local client connected to it.
pub struct HmaHandle {
    region: HmaRegion,
    path: PathBuf,
    dev: u64,
    ino: u64,
}

impl HmaHandle {
    pub fn region(&self) -> &HmaRegion {
        &self.region
    }

    pub fn config(&self) -> &HmaConfig {
        self.region.config()
    }

    pub fn fd(&self) -> RawFd {
        self.region.fd()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn key(&self) -> HmaKey {
        (self.dev, self.ino)
    }
}

/// Mutable bookkeeping for one HMA, held inside the registry's single
/// mutex: the live-client count and a weak-reference table mapping client
/// id to the local `Client` occupying it (if any). A `None`/expired entry
/// means that slot, if occupied at all, belongs to a different process.
struct HmaBookkeeping {
    live_clients: u32,
    local_clients: Vec<Option<Weak<ClientAlive>>>,
}

impl HmaBookkeeping {
    fn new(client_slots: u32) -> Self {
        HmaBookkeeping {
            live_clients: 0,
            local_clients: vec![None; client_slots as usize],
        }
    }

    fn is_local(&self, id: ClientId) -> bool {
        self.local_clients
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade)
            .is_some()
    }
}

pub(crate) struct RegistryInner {
    hmas: HashMap<HmaKey, Arc<HmaHandle>>,
    bookkeeping: HashMap<HmaKey, HmaBookkeeping>,
}

/// Process-global registry of HMA handles. All mutation — handle
/// creation/destruction, client-slot allocation, cross-client rollback —
/// is serialized by one lock; no other operation acquires it while a page
/// CAS is in flight.
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            inner: Mutex::new(RegistryInner {
                hmas: HashMap::new(),
                bookkeeping: HashMap::new(),
            }),
        }
    }

    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&mut RegistryInner) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    pub(crate) fn is_local(inner: &RegistryInner, key: HmaKey, id: ClientId) -> bool {
        inner
            .bookkeeping
            .get(&key)
            .map(|b| b.is_local(id))
            .unwrap_or(false)
    }

    /// Number of locally-connected clients on the HMA identified by `key`.
    /// Exposed for the de-duplication property: callers compare this
    /// against their own count of live client records.
    pub fn live_client_count(&self, key: (u64, u64)) -> u32 {
        self.inner
            .lock()
            .bookkeeping
            .get(&key)
            .map(|b| b.live_clients)
            .unwrap_or(0)
    }

    /// Connect to the HMA for `pager`'s database, claiming a free client
    /// slot. De-duplicates by `(dev, inode)` of the HMA file so that two
    /// connects to differently-spelled paths to the same file share one
    /// handle.
    pub fn connect(
        self: &Arc<Self>,
        pager: Box<dyn Pager>,
        config: HmaConfig,
        logger: Arc<dyn Logger>,
    ) -> Result<Client, LockError> {
        let db_path = pager.filename().to_path_buf();
        let hma_path = config.hma_path(&db_path);

        let mut inner = self.inner.lock();

        // Cheap de-dup check: if the file already exists and this process
        // already tracks it, reuse the handle instead of mapping it again
        // (re-opening and re-attempting the exclusive DMS lock from a new
        // fd in the same process would spuriously "win" it — fcntl
        // byte-range locks never conflict with themselves).
        if let Some(key) = fs::metadata(&hma_path).ok().map(|m| (m.dev(), m.ino())) {
            if let Some(handle) = inner.hmas.get(&key).cloned() {
                if handle.config() == &config {
                    return Self::claim_slot(&mut inner, key, handle, pager, logger, self.clone());
                }
            }
        }

        let (region, dev, ino) =
            HmaRegion::open_or_create(&hma_path, &config, pager.as_ref(), logger.as_ref())?;
        let key = (dev, ino);

        debug_assert!(
            !inner.hmas.contains_key(&key),
            "HMA handle registered twice under one continuously-held registry lock"
        );

        let handle = Arc::new(HmaHandle {
            region,
            path: hma_path,
            dev,
            ino,
        });
        inner.hmas.insert(key, handle.clone());
        inner
            .bookkeeping
            .insert(key, HmaBookkeeping::new(config.client_slots));

        Self::claim_slot(&mut inner, key, handle, pager, logger, self.clone())
    }

    fn claim_slot(
        inner: &mut RegistryInner,
        key: HmaKey,
        handle: Arc<HmaHandle>,
        pager: Box<dyn Pager>,
        logger: Arc<dyn Logger>,
        registry: Arc<Registry>,
    ) -> Result<Client, LockError> {
        let config = handle.config().clone();
        let bookkeeping = inner
            .bookkeeping
            .get_mut(&key)
            .expect("bookkeeping entry must exist alongside its handle");

        for i in 0..config.client_slots {
            if bookkeeping.is_local(i) {
                continue;
            }

            match oslock::os_lock(handle.fd(), config.client_word_index(i), LockMode::Exclusive, false) {
                Ok(()) => {
                    let word = handle.region().client_word(i);
                    if word.load(Ordering::SeqCst) != 0 {
                        if let Err(e) = engine::rollback_client(&handle, pager.as_ref(), i, logger.as_ref()) {
                            let _ = oslock::os_lock(handle.fd(), config.client_word_index(i), LockMode::None, false);
                            return Err(e);
                        }
                    }

                    oslock::os_lock(handle.fd(), config.client_word_index(i), LockMode::Shared, true)?;
                    word.store(1, Ordering::SeqCst);

                    let alive = Arc::new(ClientAlive);
                    bookkeeping.local_clients[i as usize] = Some(Arc::downgrade(&alive));
                    bookkeeping.live_clients += 1;

                    return Ok(Client {
                        handle,
                        registry,
                        pager,
                        logger,
                        id: i,
                        locks: PageLockList::new(),
                        in_transaction: false,
                        writer_period_start: None,
                        write_stats: WriteStats::default(),
                        alive,
                        disconnected: false,
                    });
                }
                Err(LockError::Busy) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(LockError::Busy)
    }

    /// Disconnect a client: zero its client-slot word, release the shared
    /// OS lock on it, and decrement the HMA's live-client count. If this
    /// was the last client and the Pager grants an exclusive lock on the
    /// main database file, unlink the HMA file.
    pub fn disconnect(&self, mut client: Client) -> Result<(), LockError> {
        if client.disconnected {
            return Ok(());
        }
        client.disconnected = true;
        self.disconnect_internal(&mut client)
    }

    pub(crate) fn disconnect_internal(&self, client: &mut Client) -> Result<(), LockError> {
        let key = (client.handle.dev, client.handle.ino);
        let id = client.id;
        let config = client.handle.config().clone();

        let mut inner = self.inner.lock();

        // Zero the slot and release its OS lock under the registry mutex,
        // in that order: a concurrent claim_slot scanning this slot must
        // never observe it released-but-still-marked-occupied, which would
        // read as a crashed client instead of a graceful disconnect.
        client.handle.region().client_word(id).store(0, Ordering::SeqCst);
        oslock::os_lock(client.handle.fd(), config.client_word_index(id), LockMode::None, false)?;

        let last = {
            let bookkeeping = inner
                .bookkeeping
                .get_mut(&key)
                .expect("bookkeeping entry must exist for a connected client");
            bookkeeping.local_clients[id as usize] = None;
            bookkeeping.live_clients = bookkeeping.live_clients.saturating_sub(1);
            bookkeeping.live_clients == 0
        };

        if last {
            let exclusive = client.pager.lock_database_file_exclusive().unwrap_or(false);
            if exclusive {
                let _ = fs::remove_file(client.handle.path());
            }
            inner.hmas.remove(&key);
            inner.bookkeeping.remove(&key);
        }

        Ok(())
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        let registry = self.registry.clone();
        if let Err(e) = registry.disconnect_internal(self) {
            self.logger
                .cant_open(&format!("error during implicit disconnect of client {}: {e}", self.id));
        }
    }
}
