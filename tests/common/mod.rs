//! Shared scaffolding for the end-to-end scenario suites: a shrunk
//! `HmaConfig` and a minimal `Pager` stand-in backed by a real temp file
//! (real `fcntl` locks need a real open file descriptor; they cannot be
//! faked over an in-memory buffer).

use std::fs::{File, OpenOptions};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use hma_lock::hma::{os_lock, LockMode};
use hma_lock::{ClientId, DefaultLogger, HmaConfig, Logger, LockError, Pager};

#[allow(dead_code)]
pub fn test_config() -> HmaConfig {
    HmaConfig {
        client_slots: 4,
        page_slots: 16,
        file_suffix: "-hma",
        lock_retry_spins: 8,
    }
}

#[allow(dead_code)]
pub fn logger() -> Arc<dyn Logger> {
    Arc::new(DefaultLogger)
}

pub struct TestPager {
    path: PathBuf,
    file: File,
    pub rollbacks: Arc<Mutex<Vec<ClientId>>>,
    force_exclusive: Option<bool>,
}

#[allow(dead_code)]
impl TestPager {
    pub fn new(path: &Path) -> Self {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .expect("open test db file");
        TestPager {
            path: path.to_path_buf(),
            file,
            rollbacks: Arc::new(Mutex::new(Vec::new())),
            force_exclusive: None,
        }
    }

    /// Bypass the real `fcntl` attempt and force the result of
    /// `lock_database_file_exclusive`, since two file descriptors opened
    /// by the *same* process never conflict over `fcntl` byte-range locks
    /// (they only conflict across processes) — there is no way to make a
    /// single test process observe a genuinely ungrantable db lock without
    /// this hook.
    pub fn with_forced_exclusive_result(path: &Path, result: bool) -> Self {
        let mut pager = Self::new(path);
        pager.force_exclusive = Some(result);
        pager
    }
}

impl Pager for TestPager {
    fn filename(&self) -> &Path {
        &self.path
    }

    fn rollback_journal(&self, client_id: ClientId) -> Result<(), LockError> {
        self.rollbacks.lock().unwrap().push(client_id);
        Ok(())
    }

    fn lock_database_file_exclusive(&self) -> Result<bool, LockError> {
        if let Some(forced) = self.force_exclusive {
            return Ok(forced);
        }
        match os_lock(self.file.as_raw_fd(), 0, LockMode::Exclusive, false) {
            Ok(()) => Ok(true),
            Err(LockError::Busy) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// A forked child process with a pipe in each direction, used wherever a
/// scenario needs a genuinely separate OS process rather than another
/// local client: POSIX `fcntl` byte-range locks are owned by the process,
/// not the file descriptor, so two `Registry`/fd pairs opened by this same
/// test process would never conflict with each other and cannot stand in
/// for a live, independent peer.
#[allow(dead_code)]
pub struct ChildProcess {
    pid: libc::pid_t,
    to_child: File,
    from_child: File,
}

#[allow(dead_code)]
impl ChildProcess {
    pub fn spawn<F: FnOnce(File, File)>(f: F) -> ChildProcess {
        let mut p2c = [0i32; 2];
        let mut c2p = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(p2c.as_mut_ptr()) }, 0, "pipe");
        assert_eq!(unsafe { libc::pipe(c2p.as_mut_ptr()) }, 0, "pipe");

        match unsafe { libc::fork() } {
            0 => {
                unsafe {
                    libc::close(p2c[1]);
                    libc::close(c2p[0]);
                }
                let from_parent = unsafe { File::from_raw_fd(p2c[0]) };
                let to_parent = unsafe { File::from_raw_fd(c2p[1]) };
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    f(from_parent, to_parent)
                }));
                std::process::exit(if result.is_ok() { 0 } else { 1 });
            }
            pid if pid > 0 => {
                unsafe {
                    libc::close(p2c[0]);
                    libc::close(c2p[1]);
                }
                ChildProcess {
                    pid,
                    to_child: unsafe { File::from_raw_fd(p2c[1]) },
                    from_child: unsafe { File::from_raw_fd(c2p[0]) },
                }
            }
            _ => panic!("fork failed"),
        }
    }

    pub fn recv(&mut self) -> u8 {
        use std::io::Read;
        let mut buf = [0u8; 1];
        self.from_child.read_exact(&mut buf).expect("read from child");
        buf[0]
    }

    pub fn send(&mut self, byte: u8) {
        use std::io::Write;
        self.to_child.write_all(&[byte]).expect("write to child");
    }

    pub fn kill_and_wait(self) {
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        let mut status = 0i32;
        unsafe { libc::waitpid(self.pid, &mut status, 0) };
    }

    pub fn wait(self) {
        let mut status = 0i32;
        unsafe { libc::waitpid(self.pid, &mut status, 0) };
    }
}
