//! Purpose: Embedded ordered key-value store over delimiter-separated text files.
//! Exports: `api` (stable surface), `core` (codec, validator, scanner, engines, errors).
//! Role: Library backing the `tabstore` CLI and embedding applications.
//! Invariants: The file is the source of truth; every engine can rebuild itself from it.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
