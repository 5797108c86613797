//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`.
//! Role: CLI diagnostics that are not errors (for example reading a missing file).
//! Invariants: Notices are non-fatal and never alter stdout payloads or the exit code.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub cmd: String,
    pub path: String,
    pub message: String,
}

impl Notice {
    pub fn file_not_found(cmd: &str, path: &std::path::Path) -> Self {
        Self {
            kind: "file_not_found".to_string(),
            cmd: cmd.to_string(),
            path: path.display().to_string(),
            message: format!("file not found: {}", path.display()),
        }
    }
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("path".to_string(), json!(notice.path));
    inner.insert("message".to_string(), json!(notice.message));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}
