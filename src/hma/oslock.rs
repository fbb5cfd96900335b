//! Advisory byte-range locks over the HMA file descriptor.
//!
//! Used only on the DMS word (index 0) and on client slot words (indices
//! `1..=C`) to detect first-init vs. join and to signal per-client liveness.
//! Page-lock words are never OS-locked — those are entirely CAS-driven.
//!
//! Built on POSIX `fcntl(F_SETLK`/`F_SETLKW)` record locks rather than
//! `flock`: record locks are addressable by byte range and the kernel
//! reports `EDEADLK` for detected deadlocks, both required here.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::LockError;

/// Lock strength requested for one byte-range anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Shared,
    Exclusive,
}

/// Request (or release) an advisory lock on the single byte at
/// `word_index * 4` of `fd`.
///
/// `blocking = true` uses `F_SETLKW` and blocks until the kernel grants the
/// lock or reports a self-induced deadlock (`BusyDeadlock`). `blocking =
/// false` uses `F_SETLK` and returns `Busy` immediately on conflict.
pub fn os_lock(fd: RawFd, word_index: u64, mode: LockMode, blocking: bool) -> Result<(), LockError> {
    let l_type = match mode {
        LockMode::None => libc::F_UNLCK,
        LockMode::Shared => libc::F_RDLCK,
        LockMode::Exclusive => libc::F_WRLCK,
    };

    let mut flock: libc::flock = unsafe { std::mem::zeroed() };
    flock.l_type = l_type as libc::c_short;
    flock.l_whence = libc::SEEK_SET as libc::c_short;
    flock.l_start = (word_index * 4) as libc::off_t;
    flock.l_len = 1;

    let cmd = if blocking { libc::F_SETLKW } else { libc::F_SETLK };

    let ret = unsafe { libc::fcntl(fd, cmd, &mut flock as *mut libc::flock) };
    if ret == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EDEADLK) => Err(LockError::BusyDeadlock),
        Some(libc::EAGAIN) | Some(libc::EACCES) if !blocking => Err(LockError::Busy),
        _ => Err(LockError::Error(format!("fcntl lock failed: {err}"))),
    }
}
