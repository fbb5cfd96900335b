//! HMA file creation, sizing, and memory-mapping.
//!
//! The file layout is flat: one DMS word, `C` client words, `P` page-lock
//! words, all 32-bit little-endian, with no embedded header — the wire
//! format in the external-interfaces section is exact. A file of the wrong
//! size for the configured layout is rejected as `CantOpen` rather than
//! being silently reinterpreted.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::AtomicU32;

use memmap2::MmapMut;

use super::oslock::{self, LockMode};
use crate::config::HmaConfig;
use crate::error::LockError;
use crate::logger::Logger;
use crate::pager::Pager;

/// The memory-mapped coordination file, owned by one `HmaHandle` per
/// process. Mutation of the page-lock and client words happens through
/// `AtomicU32` views reinterpreted from the mapped bytes: `AtomicU32` has
/// the same size, alignment, and bit representation as `u32`, and the
/// mapping is `MAP_SHARED`, so a sequentially-consistent `compare_exchange`
/// here is visible to every other process mapping the same file, not just
/// other threads in this one.
pub struct HmaRegion {
    file: File,
    mmap: MmapMut,
    config: HmaConfig,
}

fn dev_ino(meta: &fs::Metadata) -> (u64, u64) {
    (meta.dev(), meta.ino())
}

impl HmaRegion {
    fn map(file: File, config: HmaConfig) -> Result<Self, LockError> {
        let mmap = unsafe { MmapMut::map_mut(&file).map_err(LockError::cant_open)? };
        debug_assert_eq!(mmap.as_ptr() as usize % 4, 0, "mmap base must be 4-byte aligned");
        Ok(HmaRegion { file, mmap, config })
    }

    /// Ensure the HMA file at `hma_path` exists and is mapped, performing
    /// first-time initialization (sizing, zeroing, per-slot journal
    /// rollback) if this call is the one that wins the exclusive DMS lock.
    ///
    /// Returns the mapped region plus the `(dev, inode)` identity used by
    /// the registry to de-duplicate handles across differently-spelled
    /// paths to the same file.
    pub fn open_or_create(
        hma_path: &Path,
        config: &HmaConfig,
        pager: &dyn Pager,
        logger: &dyn Logger,
    ) -> Result<(Self, u64, u64), LockError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(hma_path)
            .map_err(|e| {
                logger.cant_open(&e.to_string());
                LockError::cant_open(e)
            })?;

        match oslock::os_lock(file.as_raw_fd(), 0, LockMode::Exclusive, false) {
            Ok(()) => Self::initialize(file, hma_path, config, pager, logger),
            Err(LockError::Busy) => Self::join(file, hma_path, config, logger),
            Err(e) => {
                logger.cant_open(&e.to_string());
                Err(e)
            }
        }
    }

    /// We won the exclusive DMS lock: no live client holds a shared lock on
    /// it, so it is safe to (re)size, zero, and sweep every client slot's
    /// journal before anyone else maps the file.
    fn initialize(
        file: File,
        hma_path: &Path,
        config: &HmaConfig,
        pager: &dyn Pager,
        logger: &dyn Logger,
    ) -> Result<(Self, u64, u64), LockError> {
        file.set_len(config.region_size()).map_err(LockError::cant_open)?;

        let mut region = Self::map(file, config.clone())?;
        region.zero();
        for id in 0..config.client_slots {
            pager.rollback_journal(id)?;
        }
        region.mmap.flush().map_err(LockError::cant_open)?;

        // Downgrade to a shared lock, held for the lifetime of this handle,
        // so subsequent joiners can tell "someone is connected" apart from
        // "the file is mid-initialization".
        oslock::os_lock(region.fd(), 0, LockMode::Shared, true)?;

        let meta = fs::metadata(hma_path).map_err(LockError::cant_open)?;
        let (dev, ino) = dev_ino(&meta);
        Ok((region, dev, ino))
    }

    /// Someone else already holds (or is mid-install of) the DMS lock: wait
    /// for them to finish initializing, then map the now-correctly-sized
    /// file.
    fn join(file: File, hma_path: &Path, config: &HmaConfig, logger: &dyn Logger) -> Result<(Self, u64, u64), LockError> {
        oslock::os_lock(file.as_raw_fd(), 0, LockMode::Shared, true)?;

        let meta = file.metadata().map_err(LockError::cant_open)?;
        if meta.len() != config.region_size() {
            let e = io::Error::new(io::ErrorKind::InvalidData, "HMA file has unexpected size");
            logger.cant_open(&e.to_string());
            return Err(LockError::cant_open(e));
        }

        let region = Self::map(file, config.clone())?;
        let meta = fs::metadata(hma_path).map_err(LockError::cant_open)?;
        let (dev, ino) = dev_ino(&meta);
        Ok((region, dev, ino))
    }

    pub fn zero(&mut self) {
        self.mmap.fill(0);
    }

    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn config(&self) -> &HmaConfig {
        &self.config
    }

    fn word_atomic(&self, index: u64) -> &AtomicU32 {
        let offset = (index * 4) as usize;
        debug_assert!(offset + 4 <= self.mmap.len());
        unsafe { &*(self.mmap.as_ptr().add(offset) as *const AtomicU32) }
    }

    pub fn dms_word(&self) -> &AtomicU32 {
        self.word_atomic(0)
    }

    pub fn client_word(&self, id: u32) -> &AtomicU32 {
        self.word_atomic(self.config.client_word_index(id))
    }

    pub fn page_word(&self, page: u32) -> &AtomicU32 {
        self.word_atomic(self.config.page_word_index(page))
    }
}

// The region is shared read/write across every process mapping the same
// file; all mutation goes through `AtomicU32` CAS or is guarded by an OS
// byte-range lock, so sharing the handle across threads is sound.
unsafe impl Send for HmaRegion {}
unsafe impl Sync for HmaRegion {}
