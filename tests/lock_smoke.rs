// Multi-process lock smoke test for append serialization.
use std::process::{Command, Stdio};

use tabstore::api::{FileOptions, read_table};

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_tabstore");
    Command::new(exe)
}

#[test]
fn concurrent_appends_never_interleave() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("lock.tsv");
    let payload = "x".repeat(4096);

    let workers = 8;
    let mut children = Vec::new();
    for i in 0..workers {
        let child = cmd()
            .args(["--header", "id\\tpayload\\tworker", "append"])
            .arg(&path)
            .args([format!("k{i}"), payload.clone(), i.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn");
        children.push(child);
    }

    for mut child in children {
        let status = child.wait().expect("wait");
        assert!(status.success());
    }

    let text = std::fs::read_to_string(&path).expect("read");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], "id\tpayload\tworker");
    assert_eq!(lines.len(), workers + 1);
    for line in &lines[1..] {
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 3, "torn line: {}", &line[..line.len().min(40)]);
        assert_eq!(fields[1].len(), 4096);
    }

    let snapshot = read_table(&path, &FileOptions::new().with_header("id\tpayload\tworker")).expect("read");
    assert_eq!(snapshot.records.len(), workers);
}
