// Lite engine flows: reopen from offsets, index hand-off, large files.
use std::fs;

use tabstore::api::{ErrorKind, FileOptions, IndexEntry, LiteTable, read_table};

#[test]
fn reopen_rebuilds_the_index_from_the_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("big.tsv");
    let options = FileOptions::new().with_header("id\tvalue");

    let mut lite = LiteTable::open(&path, options.clone()).expect("open");
    for idx in 0..2000 {
        lite.set(&format!("k{idx}"), [format!("k{idx}"), format!("v{idx}")]).expect("set");
    }
    lite.set("k7", ["k7", "seven"]).expect("overwrite");
    lite.delete("k8").expect("delete");
    drop(lite);

    let mut lite = LiteTable::open(&path, options.clone()).expect("reopen");
    assert_eq!(lite.len(), 1999);
    assert_eq!(lite.get("k7").expect("get"), ["k7", "seven"]);
    assert_eq!(lite.get("k1999").expect("get"), ["k1999", "v1999"]);
    assert_eq!(lite.get("k8").expect_err("deleted").kind(), ErrorKind::KeyNotFound);

    // The ordered map view of the same file agrees.
    let snapshot = read_table(&path, &options).expect("read");
    assert_eq!(snapshot.records.len(), 1999);
    assert_eq!(snapshot.records.get("k7"), Some(&vec!["k7".to_string(), "seven".to_string()]));
}

#[test]
fn index_can_be_handed_to_another_instance() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("t.csv");
    fs::write(&path, "a,1\nb,2\n").expect("seed");

    let lite = LiteTable::open(&path, FileOptions::new()).expect("open");
    let index = lite.into_index();
    assert_eq!(index.get("b"), Some(&IndexEntry::Offset(4)));

    let mut reused = LiteTable::with_index(&path, FileOptions::new().with_strict(true), index).expect("reuse");
    assert_eq!(reused.get("b").expect("get"), ["b", "2"]);
    reused.set("c", ["c", "3"]).expect("set");
    assert_eq!(reused.positions(), [0, 4, 8]);
    assert_eq!(fs::read_to_string(&path).expect("read"), "a,1\nb,2\nc,3\n");
}
