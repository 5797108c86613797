//! Purpose: Per-table configuration for the engines and the one-shot file operations.
//! Exports: `FieldsSpec`, `FileOptions`, `TableOptions`.
//! Role: Replaces any process-wide defaults; every table instance carries its own settings.
//! Invariants: Delimiter-dependent inputs (`FieldsSpec::Line`) are split only once the
//!             table's delimiter is known.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::core::codec::Codec;
use crate::core::error::Error;
use crate::core::format::Delimiter;
use crate::core::schema::{Schema, header_from_fields};
use crate::core::stream::{PlainFiles, StreamProvider};

pub const DEFAULT_POLL_DELAY: Duration = Duration::from_millis(10);
pub const MIN_POLL_DELAY: Duration = Duration::from_micros(10);

/// A header or defaults record, given either as fields or as one delimited line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FieldsSpec {
    Fields(Vec<String>),
    Line(String),
}

impl FieldsSpec {
    pub fn fields(&self, delimiter: Delimiter) -> Vec<String> {
        match self {
            FieldsSpec::Fields(fields) => fields.clone(),
            FieldsSpec::Line(line) => line.split(delimiter.as_char()).map(str::to_string).collect(),
        }
    }
}

impl From<&str> for FieldsSpec {
    fn from(line: &str) -> Self {
        FieldsSpec::Line(line.to_string())
    }
}

impl From<String> for FieldsSpec {
    fn from(line: String) -> Self {
        FieldsSpec::Line(line)
    }
}

impl<S: Into<String>> From<Vec<S>> for FieldsSpec {
    fn from(fields: Vec<S>) -> Self {
        FieldsSpec::Fields(fields.into_iter().map(Into::into).collect())
    }
}

impl<S: Into<String>, const N: usize> From<[S; N]> for FieldsSpec {
    fn from(fields: [S; N]) -> Self {
        FieldsSpec::Fields(fields.into_iter().map(Into::into).collect())
    }
}

/// Settings shared by the lite engine and the one-shot table operations.
#[derive(Clone)]
pub struct FileOptions {
    /// Explicit delimiter; inferred from the file extension when unset.
    pub delimiter: Option<Delimiter>,
    pub header: Option<FieldsSpec>,
    pub defaults: Option<FieldsSpec>,
    pub strict: bool,
    pub create_if_missing: bool,
    pub verify_header: bool,
    /// Preset column count; detected from the header or first record when unset.
    pub column_count: Option<usize>,
    pub streams: Arc<dyn StreamProvider>,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            delimiter: None,
            header: None,
            defaults: None,
            strict: false,
            create_if_missing: true,
            verify_header: true,
            column_count: None,
            streams: Arc::new(PlainFiles),
        }
    }
}

impl fmt::Debug for FileOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileOptions")
            .field("delimiter", &self.delimiter)
            .field("header", &self.header)
            .field("defaults", &self.defaults)
            .field("strict", &self.strict)
            .field("create_if_missing", &self.create_if_missing)
            .field("verify_header", &self.verify_header)
            .field("column_count", &self.column_count)
            .finish_non_exhaustive()
    }
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    pub fn with_header(mut self, header: impl Into<FieldsSpec>) -> Self {
        self.header = Some(header.into());
        self
    }

    pub fn with_defaults(mut self, defaults: impl Into<FieldsSpec>) -> Self {
        self.defaults = Some(defaults.into());
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn with_verify_header(mut self, verify: bool) -> Self {
        self.verify_header = verify;
        self
    }

    pub fn with_column_count(mut self, column_count: usize) -> Self {
        self.column_count = Some(column_count);
        self
    }

    pub fn with_streams(mut self, streams: Arc<dyn StreamProvider>) -> Self {
        self.streams = streams;
        self
    }

    pub fn delimiter_for(&self, path: &Path) -> Delimiter {
        self.delimiter.unwrap_or_else(|| Delimiter::for_path(path))
    }

    /// Builds the schema and the normalized header for the table at `path`.
    pub(crate) fn schema_for(&self, path: &Path) -> Result<(Schema, Vec<String>), Error> {
        let delimiter = self.delimiter_for(path);
        let header = self
            .header
            .as_ref()
            .map(|spec| header_from_fields(spec.fields(delimiter)))
            .unwrap_or_default();
        let mut schema = Schema::new(Codec::new(delimiter)?, self.strict);
        schema.set_column_count(self.column_count);
        if let Some(defaults) = &self.defaults {
            schema.set_defaults(defaults.fields(delimiter));
        }
        Ok((schema, header))
    }
}

/// Settings for the ordered map engine: file settings plus the sync policy.
#[derive(Clone, Debug)]
pub struct TableOptions {
    pub file: FileOptions,
    /// Compact the file right after loading it.
    pub rewrite_on_load: bool,
    /// Force a full sync pass when the table is closed.
    pub rewrite_on_exit: bool,
    /// Minimum age of the file before an unforced rewrite; zero disables the throttle.
    pub rewrite_interval: Duration,
    /// Sleep between background sync passes.
    pub poll_delay: Duration,
    pub monitor_external_changes: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            file: FileOptions::default(),
            rewrite_on_load: true,
            rewrite_on_exit: false,
            rewrite_interval: Duration::ZERO,
            poll_delay: DEFAULT_POLL_DELAY,
            monitor_external_changes: true,
        }
    }
}

impl TableOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file_options(mut self, file: FileOptions) -> Self {
        self.file = file;
        self
    }

    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.file.delimiter = Some(delimiter);
        self
    }

    pub fn with_header(mut self, header: impl Into<FieldsSpec>) -> Self {
        self.file.header = Some(header.into());
        self
    }

    pub fn with_defaults(mut self, defaults: impl Into<FieldsSpec>) -> Self {
        self.file.defaults = Some(defaults.into());
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.file.strict = strict;
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.file.create_if_missing = create;
        self
    }

    pub fn with_verify_header(mut self, verify: bool) -> Self {
        self.file.verify_header = verify;
        self
    }

    pub fn with_column_count(mut self, column_count: usize) -> Self {
        self.file.column_count = Some(column_count);
        self
    }

    pub fn with_streams(mut self, streams: Arc<dyn StreamProvider>) -> Self {
        self.file.streams = streams;
        self
    }

    pub fn with_rewrite_on_load(mut self, rewrite: bool) -> Self {
        self.rewrite_on_load = rewrite;
        self
    }

    pub fn with_rewrite_on_exit(mut self, rewrite: bool) -> Self {
        self.rewrite_on_exit = rewrite;
        self
    }

    pub fn with_rewrite_interval(mut self, interval: Duration) -> Self {
        self.rewrite_interval = interval;
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    pub fn with_monitor_external_changes(mut self, monitor: bool) -> Self {
        self.monitor_external_changes = monitor;
        self
    }
}
