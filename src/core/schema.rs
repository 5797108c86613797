//! Purpose: Header parsing, header matching, column-count enforcement, and line classification.
//! Exports: `Schema`, `Parsed`, `Normalized`, `parse_header`, `line_contains_header`,
//!          `verify_table_file`, `conform`.
//! Role: Shared validator used by the forward scan, the reverse scanner, and both engines.
//! Invariants: The column count is fixed once established; strict mode rejects mismatches,
//!             otherwise records are padded with empty strings or truncated.
//! Invariants: The defaults record always starts with `DEFAULTS_KEY`; a defaults record
//!             with no non-empty values means "no substitution".

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;
use tracing::{info, warn};

use crate::core::codec::Codec;
use crate::core::error::{Error, ErrorKind};
use crate::core::format::{self, COMMENT_MARKER, DEFAULTS_KEY, Delimiter};
use crate::core::stream::{OpenMode, StreamProvider};

/// Classification of one file line.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Parsed {
    /// Empty line, comment line, or a line without a key.
    Skipped,
    /// Column count mismatch in strict mode without defaults.
    Rejected { key: String, columns: usize },
    Record(Vec<String>),
    Tombstone(String),
    Defaults(Vec<String>),
    DefaultsCleared,
}

/// Outcome of preparing a caller-supplied record for storage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Normalized {
    Store(Vec<String>),
    Delete,
    Rejected { expected: usize, found: usize },
}

#[derive(Clone, Debug)]
pub struct Schema {
    codec: Codec,
    strict: bool,
    column_count: Option<usize>,
    defaults: Vec<String>,
}

impl Schema {
    pub fn new(codec: Codec, strict: bool) -> Self {
        Self {
            codec,
            strict,
            column_count: None,
            defaults: vec![DEFAULTS_KEY.to_string()],
        }
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn delimiter(&self) -> Delimiter {
        self.codec.delimiter()
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn column_count(&self) -> Option<usize> {
        self.column_count
    }

    pub fn set_column_count(&mut self, column_count: Option<usize>) {
        self.column_count = column_count;
    }

    /// Full defaults record, key first.
    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }

    pub fn has_defaults(&self) -> bool {
        self.defaults.len() > 1
    }

    pub fn set_defaults(&mut self, fields: Vec<String>) {
        let mut fields: Vec<String> = fields
            .into_iter()
            .map(|field| field.trim_end().to_string())
            .collect();
        if fields.first().map(String::as_str) == Some(DEFAULTS_KEY) {
            fields.remove(0);
        }
        if fields.iter().all(String::is_empty) {
            fields.clear();
        }
        fields.insert(0, DEFAULTS_KEY.to_string());
        if let Some(count) = self.column_count.filter(|_| fields.len() > 1) {
            conform(&mut fields, count);
        }
        self.defaults = fields;
    }

    pub fn clear_defaults(&mut self) {
        self.defaults = vec![DEFAULTS_KEY.to_string()];
    }

    /// Classifies one raw line (with or without its newline), updating the detected
    /// column count and the defaults record as a forward scan would.
    pub fn parse_line(&mut self, raw: &str) -> Parsed {
        let mut line = raw;
        if self.delimiter() != Delimiter::NUL {
            line = line.trim_matches('\0');
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || (line.starts_with(COMMENT_MARKER) && !line.starts_with(DEFAULTS_KEY)) {
            return Parsed::Skipped;
        }
        let mut fields = self.codec.decode(line);
        if fields.first().is_none_or(|key| key.is_empty()) {
            return Parsed::Skipped;
        }
        let column_count = *self.column_count.get_or_insert(if self.has_defaults() {
            self.defaults.len()
        } else {
            fields.len()
        });

        if fields.len() == 1 || fields[1..].iter().all(String::is_empty) {
            if fields[0] == DEFAULTS_KEY {
                self.clear_defaults();
                return Parsed::DefaultsCleared;
            }
            if column_count == 1 {
                return Parsed::Record(fields);
            }
            fields.truncate(1);
            return Parsed::Tombstone(fields.swap_remove(0));
        }
        if fields.len() != column_count {
            if self.strict && !self.has_non_empty_defaults() {
                return Parsed::Rejected {
                    columns: fields.len(),
                    key: fields.swap_remove(0),
                };
            }
            conform(&mut fields, column_count);
        }
        self.apply_defaults(&mut fields);
        if fields[0] == DEFAULTS_KEY {
            self.defaults = fields.clone();
            return Parsed::Defaults(fields);
        }
        Parsed::Record(fields)
    }

    /// Classifies one line without touching the detected column count or the defaults.
    pub fn peek_line(&self, raw: &str) -> Parsed {
        self.clone().parse_line(raw)
    }

    /// Prepares a record for `set`: trims fields, forces `fields[0] == key`, enforces the
    /// column count, and substitutes defaults. A lone key means "delete".
    pub fn normalize(&mut self, key: &str, fields: Vec<String>) -> Normalized {
        let mut fields: Vec<String> = fields
            .into_iter()
            .map(|field| field.trim_end().to_string())
            .collect();
        if fields.first().map(String::as_str) != Some(key) {
            fields.insert(0, key.to_string());
        }
        match self.column_count {
            Some(count) if count != 1 && fields.len() == 1 => return Normalized::Delete,
            None if fields.len() == 1 => return Normalized::Delete,
            Some(count) if fields.len() != count => {
                if self.strict {
                    return Normalized::Rejected {
                        expected: count,
                        found: fields.len(),
                    };
                }
                conform(&mut fields, count);
            }
            Some(_) => {}
            None => self.column_count = Some(fields.len()),
        }
        self.apply_defaults(&mut fields);
        Normalized::Store(fields)
    }

    /// Tombstone line fields for `key`: the key followed by empty columns.
    pub fn tombstone(&self, key: &str, fallback_columns: usize) -> Vec<String> {
        let columns = self.column_count.unwrap_or(fallback_columns).max(1);
        let mut fields = vec![String::new(); columns];
        fields[0] = key.to_string();
        fields
    }

    pub fn apply_defaults(&self, fields: &mut [String]) {
        if !self.has_defaults() {
            return;
        }
        for (idx, field) in fields.iter_mut().enumerate().skip(1) {
            if field.is_empty() {
                if let Some(default) = self.defaults.get(idx).filter(|value| !value.is_empty()) {
                    field.clone_from(default);
                }
            }
        }
    }

    fn has_non_empty_defaults(&self) -> bool {
        self.defaults[1..].iter().any(|value| !value.is_empty())
    }
}

/// Pads with empty strings or truncates to exactly `column_count` fields.
pub fn conform(fields: &mut Vec<String>, column_count: usize) {
    fields.resize(column_count, String::new());
}

/// Splits and trims a header line; an all-empty header means "no header".
pub fn parse_header(line: &str, delimiter: Delimiter) -> Vec<String> {
    header_from_fields(line.split(delimiter.as_char()))
}

pub fn header_from_fields<I, S>(fields: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let header: Vec<String> = fields
        .into_iter()
        .map(|field| field.as_ref().trim_end().to_string())
        .collect();
    if header.iter().all(String::is_empty) {
        return Vec::new();
    }
    header
}

/// Checks that `line` carries `header`: same width and each header name contained in
/// the matching column. Strict mode turns a mismatch into `SchemaMismatch`.
pub fn line_contains_header(
    header: &[String],
    line: &str,
    delimiter: Delimiter,
    strict: bool,
) -> Result<bool, Error> {
    let columns: Vec<&str> = line
        .trim_end_matches(['\r', '\n'])
        .split(delimiter.as_char())
        .map(str::trim_end)
        .collect();
    let matches = header.len() == columns.len()
        && header
            .iter()
            .zip(&columns)
            .all(|(name, column)| column.contains(name.as_str()));
    if matches {
        return Ok(true);
    }
    warn!(expected = ?header, found = ?columns, "header mismatch");
    if strict {
        return Err(Error::new(ErrorKind::SchemaMismatch)
            .with_message("header mismatch")
            .with_hint(format!("expected header {header:?}")));
    }
    Ok(false)
}

/// Ensures the table file exists, creating it with `header` when allowed.
/// Returns `Ok(false)` when the file is missing and the caller may continue without it.
pub fn verify_table_file(
    path: &Path,
    streams: &dyn StreamProvider,
    codec: &Codec,
    header: &[String],
    create_if_missing: bool,
    strict: bool,
) -> Result<bool, Error> {
    let delimiter = codec.delimiter();
    if let Some(expected) = delimiter.canonical_extension() {
        if format::table_extension(path).as_deref() != Some(expected) {
            warn!(path = %path.display(), expected, "file name does not match the delimiter's extension");
        }
    }
    if path.is_file() {
        return Ok(true);
    }
    if !create_if_missing {
        if strict {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("table file not found")
                .with_path(path));
        }
        return Ok(false);
    }
    // Append mode plus the OS lock: a racing creator never truncates another's header or
    // first records.
    let created = streams.open(path, OpenMode::Append).and_then(|mut stream| {
        if let Some(file) = stream.as_file() {
            FileExt::lock_exclusive(file)?;
        }
        if stream.seek(SeekFrom::End(0))? == 0 && !header.is_empty() {
            stream.write_all(codec.encode(header).as_bytes())?;
            stream.write_all(b"\n")?;
        }
        stream.flush()?;
        if let Some(file) = stream.as_file() {
            FileExt::unlock(file)?;
        }
        Ok(())
    });
    match created {
        Ok(()) => {
            info!(path = %path.display(), "created table file");
            Ok(true)
        }
        Err(err) if strict => Err(Error::new(ErrorKind::NotFound)
            .with_message("failed to create table file")
            .with_path(path)
            .with_source(err)),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to create table file");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Normalized, Parsed, Schema, line_contains_header, parse_header, verify_table_file};
    use crate::core::codec::Codec;
    use crate::core::error::ErrorKind;
    use crate::core::format::{DEFAULTS_KEY, Delimiter};
    use crate::core::stream::PlainFiles;

    fn fields(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    fn schema(strict: bool) -> Schema {
        Schema::new(Codec::new(Delimiter::TAB).expect("codec"), strict)
    }

    #[test]
    fn first_line_fixes_column_count() {
        let mut schema = schema(false);
        assert_eq!(schema.parse_line("a\t1\t2\n"), Parsed::Record(fields(&["a", "1", "2"])));
        assert_eq!(schema.column_count(), Some(3));
        assert_eq!(schema.parse_line("b\t1\n"), Parsed::Record(fields(&["b", "1", ""])));
        assert_eq!(schema.parse_line("c\t1\t2\t3\n"), Parsed::Record(fields(&["c", "1", "2"])));
    }

    #[test]
    fn strict_mode_rejects_wrong_width() {
        let mut schema = schema(true);
        schema.set_column_count(Some(3));
        assert_eq!(
            schema.parse_line("b\t1\n"),
            Parsed::Rejected { key: "b".to_string(), columns: 2 }
        );
    }

    #[test]
    fn comments_blank_lines_and_tombstones() {
        let mut schema = schema(false);
        schema.set_column_count(Some(3));
        assert_eq!(schema.parse_line("# a comment\n"), Parsed::Skipped);
        assert_eq!(schema.parse_line("\n"), Parsed::Skipped);
        assert_eq!(schema.parse_line("\tx\ty\n"), Parsed::Skipped);
        assert_eq!(schema.parse_line("u1\t\t\n"), Parsed::Tombstone("u1".to_string()));
        assert_eq!(schema.parse_line("u1\n"), Parsed::Tombstone("u1".to_string()));
    }

    #[test]
    fn single_column_tables_keep_lone_keys() {
        let mut schema = schema(false);
        schema.set_column_count(Some(1));
        assert_eq!(schema.parse_line("u1\n"), Parsed::Record(fields(&["u1"])));
    }

    #[test]
    fn defaults_line_is_tracked_and_substituted() {
        let mut schema = schema(false);
        let parsed = schema.parse_line(&format!("{DEFAULTS_KEY}\t0\tunknown\n"));
        assert_eq!(parsed, Parsed::Defaults(fields(&[DEFAULTS_KEY, "0", "unknown"])));
        assert_eq!(schema.parse_line("u2\t\tbob\n"), Parsed::Record(fields(&["u2", "0", "bob"])));
        assert_eq!(schema.parse_line(&format!("{DEFAULTS_KEY}\t\t\n")), Parsed::DefaultsCleared);
        assert!(!schema.has_defaults());
    }

    #[test]
    fn strict_mode_with_defaults_still_corrects() {
        let mut schema = schema(true);
        schema.set_defaults(fields(&[DEFAULTS_KEY, "0", "unknown"]));
        assert_eq!(schema.parse_line("u3\t5\n"), Parsed::Record(fields(&["u3", "5", "unknown"])));
    }

    #[test]
    fn normalize_pads_and_deletes() {
        let mut schema = schema(false);
        schema.set_column_count(Some(3));
        assert_eq!(
            schema.normalize("u1", fields(&["u1", "Alice"])),
            Normalized::Store(fields(&["u1", "Alice", ""]))
        );
        assert_eq!(
            schema.normalize("u1", fields(&["Alice", "30", "extra"])),
            Normalized::Store(fields(&["u1", "Alice", "30"]))
        );
        assert_eq!(schema.normalize("u1", fields(&["u1"])), Normalized::Delete);
        assert_eq!(schema.normalize("u1", Vec::new()), Normalized::Delete);

        let mut strict = self::schema(true);
        strict.set_column_count(Some(3));
        assert_eq!(
            strict.normalize("u1", fields(&["u1", "Alice"])),
            Normalized::Rejected { expected: 3, found: 2 }
        );
    }

    #[test]
    fn normalize_substitutes_defaults() {
        let mut schema = schema(false);
        schema.set_column_count(Some(3));
        schema.set_defaults(fields(&[DEFAULTS_KEY, "0", "unknown"]));
        assert_eq!(
            schema.normalize("u2", fields(&["u2", "", ""])),
            Normalized::Store(fields(&["u2", "0", "unknown"]))
        );
    }

    #[test]
    fn empty_defaults_mean_no_substitution() {
        let mut schema = schema(false);
        schema.set_defaults(fields(&["", " "]));
        assert_eq!(schema.defaults(), [DEFAULTS_KEY]);
        assert!(!schema.has_defaults());
    }

    #[test]
    fn header_containment_check() {
        let header = parse_header("id\tname\tage", Delimiter::TAB);
        assert!(line_contains_header(&header, "id\tname\tage\n", Delimiter::TAB, true).unwrap());
        assert!(line_contains_header(&header, "user_id\tfull name\tage \n", Delimiter::TAB, true).unwrap());
        assert!(!line_contains_header(&header, "id\tname\n", Delimiter::TAB, false).unwrap());
        let err = line_contains_header(&header, "x\ty\tz", Delimiter::TAB, true).expect_err("strict");
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
        assert!(parse_header(" \t ", Delimiter::TAB).is_empty());
    }

    #[test]
    fn verify_creates_with_header_or_reports_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let codec = Codec::new(Delimiter::TAB).expect("codec");
        let header = fields(&["id", "name"]);

        let path = dir.path().join("made.tsv");
        assert!(verify_table_file(&path, &PlainFiles, &codec, &header, true, true).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "id\tname\n");

        let missing = dir.path().join("missing.tsv");
        assert!(!verify_table_file(&missing, &PlainFiles, &codec, &header, false, false).unwrap());
        let err = verify_table_file(&missing, &PlainFiles, &codec, &header, false, true)
            .expect_err("strict missing");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
