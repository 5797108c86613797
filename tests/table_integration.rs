// End-to-end flows for the ordered map engine: reopen, background sync, shared files.
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime};

use tabstore::api::{ErrorKind, Table, TableOptions};

fn manual() -> TableOptions {
    TableOptions::new()
        .with_poll_delay(Duration::from_secs(3600))
        .with_rewrite_on_load(false)
}

fn touch_later(path: &Path, secs: u64) {
    let file = fs::OpenOptions::new().write(true).open(path).expect("open");
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .expect("mtime");
}

fn wait_for(path: &Path, expected: &str) -> bool {
    for _ in 0..300 {
        if fs::read_to_string(path).unwrap_or_default() == expected {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

#[test]
fn reopen_sees_closed_writes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("t.tsv");

    let table = Table::open(&path, TableOptions::new().with_header("id\tname")).expect("open");
    table.set("a", ["a", "x"]).expect("set");
    table.close().expect("close");

    let table = Table::open(&path, TableOptions::new().with_header("id\tname")).expect("reopen");
    assert_eq!(table.get("a").expect("get"), ["a", "x"]);
    assert_eq!(table.header(), ["id", "name"]);
    assert_eq!(table.get("b").expect_err("absent").kind(), ErrorKind::KeyNotFound);
}

#[test]
fn background_worker_flushes_appends() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("t.tsv");
    let table = Table::open(&path, TableOptions::new().with_poll_delay(Duration::from_millis(5))).expect("open");
    table.set("a", ["a", "1"]).expect("set");
    table.set("b", ["b", "2"]).expect("set");
    assert!(wait_for(&path, "a\t1\nb\t2\n"), "worker never flushed");
    assert_eq!(table.pending_appends(), 0);

    table.delete("a");
    assert!(wait_for(&path, "b\t2\n"), "worker never compacted the tombstone");
}

#[test]
fn open_compacts_superseded_lines() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("t.tsv");
    fs::write(&path, "a\t1\na\t2\nb\t1\nc\t\n").expect("seed");
    let table = Table::open(&path, TableOptions::new().with_poll_delay(Duration::from_secs(3600))).expect("open");
    assert_eq!(table.keys(), ["a", "b"]);
    assert_eq!(fs::read_to_string(&path).expect("read"), "a\t2\nb\t1\n");
}

#[test]
fn second_handle_picks_up_external_writes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("shared.tsv");
    let writer = Table::open(&path, manual().with_header("id\tv")).expect("writer");
    let reader = Table::open(&path, manual().with_header("id\tv")).expect("reader");

    writer.set("k", ["k", "1"]).expect("set");
    writer.commit_appends().expect("commit");
    touch_later(&path, 5);

    assert!(reader.check_external_changes());
    assert!(reader.rewrite(false, None).expect("sync"));
    assert_eq!(reader.get("k").expect("get"), ["k", "1"]);
    assert!(!reader.is_desynced());
}

#[test]
fn reordering_reaches_the_file_on_close() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("t.tsv");
    fs::write(&path, "a\t1\nb\t2\nc\t3\n").expect("seed");
    let table = Table::open(&path, manual()).expect("open");
    table.move_to_end("a", true).expect("move");
    table.close().expect("close");
    assert_eq!(fs::read_to_string(&path).expect("read"), "b\t2\nc\t3\na\t1\n");
}

#[test]
fn rewrite_interval_throttles_unforced_compaction() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("t.tsv");
    fs::write(&path, "a\t1\n").expect("seed");
    let table = Table::open(&path, manual().with_rewrite_interval(Duration::from_secs(3600))).expect("open");
    table.set("a", ["a", "2"]).expect("set");
    assert!(!table.rewrite(false, None).expect("throttled"));
    assert!(table.is_dirty());
    assert!(table.rewrite(true, None).expect("forced"));
    assert_eq!(fs::read_to_string(&path).expect("read"), "a\t2\n");
}
