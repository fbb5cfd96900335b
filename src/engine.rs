//! The page lock engine: the acquisition/release algorithm, dead-client
//! recovery, and deadlock avoidance. This is the algorithmic core — every
//! other module exists to give this one a mapped word and a way to lock a
//! byte range on it.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::client::{Client, ClientId};
use crate::hma::layout;
use crate::hma::{oslock, LockMode};
use crate::logger::Logger;
use crate::pager::Pager;
use crate::registry::{HmaHandle, Registry};
use crate::error::LockError;

/// Installs a RESERVED marker for `i` on construction, undoes it on drop
/// unless `commit` was called. Replaces the `goto`-style cleanup the
/// acquisition algorithm would otherwise need on its failure paths.
struct ReservationGuard<'a> {
    word: &'a AtomicU32,
    c: u32,
    i: u32,
    committed: bool,
}

impl<'a> ReservationGuard<'a> {
    fn install(word: &'a AtomicU32, c: u32, i: u32, current: u32) -> Result<Self, u32> {
        let n = layout::with_write_holder(current, c, i);
        match word.compare_exchange(current, n, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(ReservationGuard { word, c, i, committed: false }),
            Err(actual) => Err(actual),
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        loop {
            let v = self.word.load(Ordering::SeqCst);
            if layout::write_holder(v, self.c) != Some(self.i) {
                return;
            }
            let n = layout::clear_write_holder(v, self.c);
            if self.word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                return;
            }
        }
    }
}

/// Bumps a transient-CAS-race counter, yielding the thread once `budget` is
/// reached and resetting to zero. Purely a scheduling courtesy — the spin
/// itself is never load-bearing for correctness, only for not burning a
/// core spinning against another thread's concurrent installer.
fn spin_or_yield(spins: u32, budget: u32) -> u32 {
    let spins = spins + 1;
    if spins >= budget {
        std::thread::yield_now();
        0
    } else {
        spins
    }
}

impl Client {
    /// Take a long-held exclusive OS lock on our own client slot for the
    /// duration of the transaction, then acquire a RESERVED-or-stronger
    /// lock on the sentinel page to timestamp the writer period.
    pub fn begin(&mut self) -> Result<(), LockError> {
        let config = self.handle.config().clone();
        oslock::os_lock(self.handle.fd(), config.client_word_index(self.id), LockMode::Exclusive, true)?;
        self.in_transaction = true;
        self.lock(0, true, true)
    }

    /// Acquire SHARED (`write = false`) or EXCLUSIVE (`write = true`) on
    /// `page`. Blocks on inter-process contention when `blocking` is set;
    /// otherwise returns `BusyDeadlock` the moment a live conflicter is
    /// found.
    pub fn lock(&mut self, page: u32, write: bool, blocking: bool) -> Result<(), LockError> {
        let handle = self.handle.clone();
        let c = handle.config().client_slots;
        let i = self.id;
        let word = handle.region().page_word(page);

        let v0 = word.load(Ordering::SeqCst);
        let already_held = if write {
            layout::write_holder(v0, c) == Some(i)
        } else {
            layout::read_bit(v0, i)
        };
        if already_held {
            return Ok(());
        }

        self.locks.push(page)?;

        let mask = if write { layout::all_read_mask(c) & !(1 << i) } else { 0 };
        let spin_budget = handle.config().lock_retry_spins.max(1);
        let mut reservation: Option<ReservationGuard<'_>> = None;
        let mut v = word.load(Ordering::SeqCst);
        let mut spins = 0u32;

        'acquire: loop {
            loop {
                let other_writer = matches!(layout::write_holder(v, c), Some(w) if w != i);
                let read_conflict = v & mask != 0;
                if !other_writer && !read_conflict {
                    break;
                }

                if write && blocking && reservation.is_none() && layout::write_holder(v, c).is_none() {
                    match ReservationGuard::install(word, c, i, v) {
                        Ok(guard) => {
                            reservation = Some(guard);
                            v = word.load(Ordering::SeqCst);
                            continue;
                        }
                        Err(actual) => {
                            v = actual;
                            spins = spin_or_yield(spins, spin_budget);
                            continue;
                        }
                    }
                }

                let i_block = match layout::write_holder(v, c) {
                    Some(w) if w != i => w,
                    _ => (v & mask).trailing_zeros(),
                };

                match overcome(self, i_block, blocking) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.logger.busy_deadlock(&format!(
                            "client {} denied {} on page {page}: client {i_block} is live and local",
                            self.id,
                            if write { "exclusive" } else { "shared" },
                        ));
                        return Err(LockError::BusyDeadlock);
                    }
                    Err(LockError::BusyDeadlock) => {
                        self.logger.busy_deadlock(&format!(
                            "client {} denied {} on page {page}: kernel detected deadlock waiting on client {i_block}",
                            self.id,
                            if write { "exclusive" } else { "shared" },
                        ));
                        return Err(LockError::BusyDeadlock);
                    }
                    Err(e) => return Err(e),
                }
                v = word.load(Ordering::SeqCst);
            }

            let mut n = layout::set_read_bit(v, i);
            if write {
                n = layout::with_write_holder(n, c, i);
            }
            match word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break 'acquire,
                Err(actual) => {
                    v = actual;
                    spins = spin_or_yield(spins, spin_budget);
                    continue 'acquire;
                }
            }
        }

        if let Some(guard) = reservation.take() {
            guard.commit();
        }

        if page == 0 {
            self.writer_period_start = Some(crate::time::now_micros());
        }

        Ok(())
    }

    /// Release every page lock taken during the transaction, in recorded
    /// order, and downgrade the client-slot OS lock back to shared.
    pub fn end(&mut self) -> Result<(), LockError> {
        let handle = self.handle.clone();
        let c = handle.config().client_slots;
        let id = self.id;
        let mut released_sentinel = false;

        let pages: Vec<u32> = self.locks.drain().collect();
        for page in pages {
            let word = handle.region().page_word(page);
            loop {
                let v = word.load(Ordering::SeqCst);
                let mut n = layout::clear_read_bit(v, id);
                if layout::write_holder(v, c) == Some(id) {
                    n = layout::clear_write_holder(n, c);
                }
                if n == v {
                    break;
                }
                if word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                    break;
                }
            }
            if page == 0 {
                released_sentinel = true;
            }
        }

        if released_sentinel {
            if let Some(started) = self.writer_period_start.take() {
                let elapsed = crate::time::now_micros().saturating_sub(started);
                self.write_stats.cumulative_micros += elapsed;
                self.write_stats.last_acquired_micros = Some(started);
                let whole_seconds = elapsed / 1_000_000;
                if whole_seconds > 0 {
                    self.logger.warning(&format!(
                        "client {id} held the writer lock for {whole_seconds} whole second(s)"
                    ));
                }
            }
        }

        let config = handle.config().clone();
        oslock::os_lock(handle.fd(), config.client_word_index(id), LockMode::Shared, true)?;
        self.in_transaction = false;
        Ok(())
    }

    /// Consult the mapping and answer from the slot encoding alone.
    pub fn has_lock(&self, page: u32, write: bool) -> bool {
        let c = self.handle.config().client_slots;
        let v = self.handle.region().page_word(page).load(Ordering::SeqCst);
        if write {
            layout::write_holder(v, c) == Some(self.id)
        } else {
            layout::read_bit(v, self.id)
        }
    }

    /// Reserved for future use; present for API symmetry with the rest of
    /// the engine's entry points.
    pub fn release_write_locks(&mut self) -> Result<(), LockError> {
        Ok(())
    }
}

/// Resolve a conflict with the client holding/blocking via `i_block`:
/// recover it if it has crashed, wait on its liveness lock if blocking and
/// remote, or report "do not retry" if it's local (a live same-process
/// client, which must be avoided by the caller's own lock ordering).
fn overcome(client: &mut Client, i_block: ClientId, blocking: bool) -> Result<bool, LockError> {
    let handle = client.handle.clone();
    let config = handle.config().clone();
    let key = handle.key();
    let registry = client.registry.clone();
    let pager = client.pager.as_ref();
    let logger = client.logger.as_ref();

    registry.with_locked(|inner| {
        if Registry::is_local(inner, key, i_block) {
            return Ok(false);
        }

        match oslock::os_lock(handle.fd(), config.client_word_index(i_block), LockMode::Exclusive, false) {
            Ok(()) => {
                rollback_client(&handle, pager, i_block, logger)?;
                oslock::os_lock(handle.fd(), config.client_word_index(i_block), LockMode::None, false)?;
                Ok(true)
            }
            Err(LockError::Busy) => {
                if !blocking {
                    return Ok(false);
                }
                oslock::os_lock(handle.fd(), config.client_word_index(i_block), LockMode::Shared, true)?;
                oslock::os_lock(handle.fd(), config.client_word_index(i_block), LockMode::None, false)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    })
}

/// Replay/discard client `id`'s journal via the Pager, then scrub its bits
/// from every page-lock word. Called from slot claiming (a stale client
/// word found at connect) and from `overcome` (a remote client proved
/// dead). Each word is updated by CAS-until-success.
pub(crate) fn rollback_client(
    handle: &HmaHandle,
    pager: &dyn Pager,
    id: ClientId,
    logger: &dyn Logger,
) -> Result<(), LockError> {
    pager.rollback_journal(id)?;

    let config = handle.config();
    let c = config.client_slots;
    for page in 0..config.page_slots {
        let word = handle.region().page_word(page);
        loop {
            let v = word.load(Ordering::SeqCst);
            let mut n = layout::clear_read_bit(v, id);
            if layout::write_holder(v, c) == Some(id) {
                n = layout::clear_write_holder(n, c);
            }
            if n == v {
                break;
            }
            if word.compare_exchange(v, n, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
                break;
            }
        }
    }

    logger.notice(&format!("rolled back crashed client {id}"));
    Ok(())
}
