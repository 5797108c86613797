//! Purpose: Define the stable public Rust API boundary for tabstore.
//! Exports: Engines, options, one-shot file operations, and error types.
//! Role: Public, additive-only surface; hides scanner and lock internals.
//! Invariants: Types re-exported here keep their names across releases.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::format::{DEFAULTS_KEY, Delimiter};
pub use crate::core::lite::{Index, IndexEntry, LiteTable};
pub use crate::core::options::{FieldsSpec, FileOptions, TableOptions};
pub use crate::core::ordered::OrderedMap;
pub use crate::core::stream::{OpenMode, PlainFiles, StreamProvider, TableStream};
pub use crate::core::table::{RewriteStats, Table};
pub use crate::core::tabular::{
    TableSnapshot, append_records, clear_table, read_last_record, read_table, scrub_table,
};
