//! Page-lock acquisition/release semantics: SHARED compatibility, EXCLUSIVE
//! contention, lock-list accounting, and a genuine cross-thread RESERVED
//! wait.

mod common;

use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Duration;

use common::{logger, test_config, ChildProcess, TestPager};
use hma_lock::{LockError, Registry};

#[test]
fn s3_two_readers_share_a_page() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db.sqlite");
    let config = test_config();
    let registry = Arc::new(Registry::new());

    let mut p1 = registry
        .connect(Box::new(TestPager::new(&db_path)), config.clone(), logger())
        .unwrap();
    let mut p2 = registry
        .connect(Box::new(TestPager::new(&db_path)), config.clone(), logger())
        .unwrap();

    p1.lock(42, false, true).unwrap();
    p2.lock(42, false, true).unwrap();

    assert!(p1.has_lock(42, false));
    assert!(p2.has_lock(42, false));
}

#[test]
fn s4_exclusive_contention_is_busy_deadlock_for_local_clients() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db.sqlite");
    let config = test_config();
    let registry = Arc::new(Registry::new());

    let mut p1 = registry
        .connect(Box::new(TestPager::new(&db_path)), config.clone(), logger())
        .unwrap();
    let mut p2 = registry
        .connect(Box::new(TestPager::new(&db_path)), config.clone(), logger())
        .unwrap();

    p1.lock(9, true, true).unwrap();

    let err = p2.lock(9, true, false).unwrap_err();
    assert!(matches!(err, LockError::BusyDeadlock));

    p1.end().unwrap();
    p2.lock(9, true, true).expect("retry after release succeeds");
    assert!(p2.has_lock(9, true));
}

#[test]
fn end_clears_every_locked_page() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db.sqlite");
    let config = test_config();
    let registry = Arc::new(Registry::new());

    let mut p1 = registry
        .connect(Box::new(TestPager::new(&db_path)), config.clone(), logger())
        .unwrap();

    p1.lock(1, false, true).unwrap();
    p1.lock(2, true, true).unwrap();
    p1.lock(3, false, true).unwrap();

    p1.end().unwrap();

    assert!(!p1.has_lock(1, false));
    assert!(!p1.has_lock(2, true));
    assert!(!p1.has_lock(3, false));

    let mut p2 = registry
        .connect(Box::new(TestPager::new(&db_path)), config.clone(), logger())
        .unwrap();
    p2.lock(2, true, true).expect("page freed by end() is lockable again");
}

/// Reader, writer, and latecomer each run as a real forked child process.
/// A single test process cannot simulate this with multiple `Registry`
/// instances: POSIX `fcntl` byte-range locks are owned by the process, not
/// the file descriptor or the `Registry` object, so two "clients" sharing
/// one real OS process would never see each other's locks as conflicts —
/// the exact landmine `TestPager::with_forced_exclusive_result` documents
/// for `lock_database_file_exclusive`, which here would additionally let
/// one simulated process silently steal another's client slot.
#[test]
fn reserved_lock_starves_new_readers_until_released() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db.sqlite");
    let config = test_config();
    std::fs::write(&db_path, b"").unwrap();

    let reader_db_path = db_path.clone();
    let reader_config = config.clone();
    let mut reader = ChildProcess::spawn(move |mut from_parent, mut to_parent| {
        let registry = Arc::new(Registry::new());
        let mut client = registry
            .connect(Box::new(TestPager::new(&reader_db_path)), reader_config, logger())
            .expect("reader connects");
        client.lock(5, false, true).expect("reader takes a shared lock on page 5");
        to_parent.write_all(&[1]).expect("signal locked");

        let mut go = [0u8; 1];
        from_parent.read_exact(&mut go).expect("wait for release signal");
        client.end().expect("reader releases page 5");
        to_parent.write_all(&[1]).expect("signal released");
    });
    assert_eq!(reader.recv(), 1, "reader holds page 5 shared");

    let writer_db_path = db_path.clone();
    let writer_config = config.clone();
    let mut writer = ChildProcess::spawn(move |_from_parent, mut to_parent| {
        let registry = Arc::new(Registry::new());
        let mut client = registry
            .connect(Box::new(TestPager::new(&writer_db_path)), writer_config, logger())
            .expect("writer connects");
        client.lock(5, true, true).expect("writer eventually acquires page 5");
        to_parent.write_all(&[1]).expect("signal acquired");
    });

    // Give the writer process time to observe the conflict and install the
    // RESERVED marker before the latecomer probes.
    std::thread::sleep(Duration::from_millis(300));

    let latecomer_db_path = db_path.clone();
    let latecomer_config = config.clone();
    let mut latecomer = ChildProcess::spawn(move |_from_parent, mut to_parent| {
        let registry = Arc::new(Registry::new());
        let mut client = registry
            .connect(Box::new(TestPager::new(&latecomer_db_path)), latecomer_config, logger())
            .expect("latecomer connects");
        let is_busy_deadlock = matches!(client.lock(5, false, false), Err(LockError::BusyDeadlock));
        to_parent.write_all(&[is_busy_deadlock as u8]).expect("report result");
    });
    assert_eq!(
        latecomer.recv(),
        1,
        "a new reader must be refused while RESERVED is outstanding"
    );
    latecomer.wait();

    reader.send(1);
    assert_eq!(reader.recv(), 1, "reader finished releasing page 5");
    reader.wait();

    assert_eq!(writer.recv(), 1, "writer eventually acquires page 5");
    writer.wait();
}
