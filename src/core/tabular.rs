//! Purpose: Stateless operations over a whole table file (read, last record, append, clear, scrub).
//! Exports: `TableSnapshot`, `read_table`, `read_last_record`, `append_records`, `clear_table`,
//!          `scrub_table`.
//! Role: Backs the CLI and callers that do not need a long-lived engine.
//! Invariants: Every write goes through one `FileCoordinator` acquisition, so concurrent
//!             appenders in other processes never interleave partial lines.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::lock::FileCoordinator;
use crate::core::options::{FieldsSpec, FileOptions};
use crate::core::ordered::OrderedMap;
use crate::core::scan::TableSource;
use crate::core::schema::{Parsed, Schema, conform, line_contains_header, parse_header, verify_table_file};
use crate::core::stream::{OpenMode, StreamProvider};

/// Live content of a table file after replaying every line.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TableSnapshot {
    pub header: Vec<String>,
    pub records: OrderedMap<Vec<String>>,
    pub column_count: Option<usize>,
    /// Defaults record in effect at the end of the file, key first.
    pub defaults: Vec<String>,
}

impl TableSnapshot {
    /// Records in file order, header first when one is configured.
    pub fn rows(&self) -> Vec<Vec<String>> {
        let header = (!self.header.is_empty()).then(|| self.header.clone());
        header.into_iter().chain(self.records.values().cloned()).collect()
    }
}

pub fn read_table(path: impl AsRef<Path>, options: &FileOptions) -> Result<TableSnapshot, Error> {
    let path = path.as_ref();
    let (mut schema, header) = options.schema_for(path)?;
    let mut snapshot = TableSnapshot {
        header,
        ..TableSnapshot::default()
    };
    if !verify_table_file(
        path,
        options.streams.as_ref(),
        schema.codec(),
        &snapshot.header,
        options.create_if_missing,
        options.strict,
    )? {
        snapshot.defaults = schema.defaults().to_vec();
        return Ok(snapshot);
    }

    let source = TableSource {
        path,
        streams: options.streams.as_ref(),
        header: &snapshot.header,
        verify_header: options.verify_header,
    };
    let records = &mut snapshot.records;
    source.scan_forward(&mut schema, |parsed, offset| match parsed {
        Parsed::Record(fields) => {
            records.insert(fields[0].clone(), fields);
        }
        Parsed::Tombstone(key) => {
            records.remove(&key);
        }
        Parsed::Rejected { key, columns } => {
            warn!(path = %path.display(), %key, columns, offset, "dropping record with wrong column count");
        }
        Parsed::Skipped | Parsed::Defaults(_) | Parsed::DefaultsCleared => {}
    })?;
    snapshot.column_count = schema.column_count();
    snapshot.defaults = schema.defaults().to_vec();
    debug!(path = %path.display(), records = snapshot.records.len(), "table read");
    Ok(snapshot)
}

/// Last valid record of the file, found by scanning backwards from the end.
pub fn read_last_record(path: impl AsRef<Path>, options: &FileOptions) -> Result<Option<Vec<String>>, Error> {
    let path = path.as_ref();
    let (mut schema, header) = options.schema_for(path)?;
    if !verify_table_file(
        path,
        options.streams.as_ref(),
        schema.codec(),
        &header,
        options.create_if_missing,
        options.strict,
    )? {
        return Ok(None);
    }
    let source = TableSource {
        path,
        streams: options.streams.as_ref(),
        header: &header,
        verify_header: options.verify_header,
    };
    Ok(source.scan_last(&mut schema)?.map(|located| located.fields))
}

/// Appends `records` in one locked write. Every record is padded or truncated to the
/// header width when the file carries the expected header, otherwise to the widest record.
pub fn append_records<I, R>(path: impl AsRef<Path>, records: I, options: &FileOptions) -> Result<usize, Error>
where
    I: IntoIterator<Item = R>,
    R: Into<FieldsSpec>,
{
    let path = path.as_ref();
    let (schema, header) = options.schema_for(path)?;
    if !verify_table_file(
        path,
        options.streams.as_ref(),
        schema.codec(),
        &header,
        options.create_if_missing,
        options.strict,
    )? {
        return Ok(0);
    }
    let delimiter = schema.delimiter();
    let mut rows: Vec<Vec<String>> = records
        .into_iter()
        .map(|record| record.into().fields(delimiter))
        .filter(|fields| !fields.is_empty())
        .collect();
    if rows.is_empty() {
        debug!(path = %path.display(), "nothing to append");
        return Ok(0);
    }

    let mut width = rows.iter().map(Vec::len).max().unwrap_or(1);
    if options.verify_header && !header.is_empty() {
        if let Some(line) = first_line(path, options.streams.as_ref())? {
            if line_contains_header(&header, &line, delimiter, options.strict).map_err(|err| err.with_path(path))? {
                width = header.len();
            }
        }
    }
    for row in &mut rows {
        conform(row, width);
    }
    let files = FileCoordinator::new(path, Arc::clone(&options.streams));
    let count = files.append_lines(rows.iter().map(|row| schema.codec().encode(row)))?;
    debug!(path = %path.display(), count, "records appended");
    Ok(count)
}

/// Truncates the file to its header line. When the file's first line does not carry the
/// expected header, the file's own header is kept.
pub fn clear_table(path: impl AsRef<Path>, options: &FileOptions) -> Result<(), Error> {
    let path = path.as_ref();
    let (schema, header) = options.schema_for(path)?;
    let header = kept_header(path, options, &schema, header)?;
    let files = FileCoordinator::new(path, Arc::clone(&options.streams));
    files.replace_lines(header_line(&schema, &header))?;
    info!(path = %path.display(), "table cleared");
    Ok(())
}

/// Rewrites the file with only its live content: header, defaults, then one line per
/// record. Superseded lines, tombstones, and comments are dropped.
pub fn scrub_table(path: impl AsRef<Path>, options: &FileOptions) -> Result<TableSnapshot, Error> {
    let path = path.as_ref();
    let snapshot = read_table(path, options)?;
    if !path.is_file() {
        return Ok(snapshot);
    }
    let (mut schema, header) = options.schema_for(path)?;
    let header = kept_header(path, options, &schema, header)?;
    schema.set_column_count(snapshot.column_count);
    schema.set_defaults(snapshot.defaults.clone());

    let codec = schema.codec();
    let defaults = schema.has_defaults().then(|| codec.encode(schema.defaults()));
    let lines = header_line(&schema, &header)
        .into_iter()
        .chain(defaults)
        .chain(snapshot.records.values().map(|fields| codec.encode(fields)));
    let files = FileCoordinator::new(path, Arc::clone(&options.streams));
    let written = files.replace_lines(lines)?;
    info!(path = %path.display(), records = snapshot.records.len(), lines = written, "table scrubbed");
    Ok(snapshot)
}

fn header_line(schema: &Schema, header: &[String]) -> Option<String> {
    (!header.is_empty()).then(|| schema.codec().encode(header))
}

/// Header to write back when truncating: the configured one, or the file's own first line
/// when header verification is on.
fn kept_header(path: &Path, options: &FileOptions, schema: &Schema, header: Vec<String>) -> Result<Vec<String>, Error> {
    if !verify_table_file(path, options.streams.as_ref(), schema.codec(), &header, true, false)? {
        return Err(Error::new(ErrorKind::NotFound)
            .with_message("table file missing after create")
            .with_path(path));
    }
    if header.is_empty() || !options.verify_header {
        return Ok(header);
    }
    let Some(line) = first_line(path, options.streams.as_ref())? else {
        return Ok(header);
    };
    if !line_contains_header(&header, &line, schema.delimiter(), options.strict).map_err(|err| err.with_path(path))? {
        warn!(path = %path.display(), "header mismatch; keeping the file's header");
    }
    let existing = parse_header(&line, schema.delimiter());
    Ok(if existing.is_empty() { header } else { existing })
}

fn first_line(path: &Path, streams: &dyn StreamProvider) -> Result<Option<String>, Error> {
    let stream = streams.open(path, OpenMode::Read).map_err(|err| Error::io(path, err))?;
    let mut line = Vec::new();
    let read = BufReader::new(stream)
        .read_until(b'\n', &mut line)
        .map_err(|err| Error::io(path, err))?;
    if read == 0 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&line);
    Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
}

#[cfg(test)]
mod tests {
    use super::{append_records, clear_table, read_last_record, read_table, scrub_table};
    use crate::core::error::ErrorKind;
    use crate::core::format::DEFAULTS_KEY;
    use crate::core::options::{FieldsSpec, FileOptions};
    use std::fs;

    #[test]
    fn read_replays_tombstones_and_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.tsv");
        fs::write(
            &path,
            "id\tname\tage\n#_defaults_#\t\t0\nu1\tAlice\t\nu2\tBob\t41\n# note\nu1\t\t\nu3\tCarol\n",
        )
        .expect("seed");
        let snapshot = read_table(&path, &FileOptions::new().with_header("id\tname\tage")).expect("read");
        let keys: Vec<_> = snapshot.records.keys().collect();
        assert_eq!(keys, ["u2", "u3"]);
        assert_eq!(snapshot.records.get("u3"), Some(&vec!["u3".into(), "Carol".into(), "0".into()]));
        assert_eq!(snapshot.column_count, Some(3));
        assert_eq!(snapshot.defaults, [DEFAULTS_KEY, "", "0"]);
        assert_eq!(snapshot.rows()[0], ["id", "name", "age"]);
    }

    #[test]
    fn missing_files_read_empty_unless_strict() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.tsv");
        let options = FileOptions::new().with_create_if_missing(false);
        assert!(read_table(&path, &options).expect("read").records.is_empty());
        assert_eq!(read_last_record(&path, &options).expect("last"), None);
        let err = read_table(&path, &options.with_strict(true)).expect_err("strict");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn last_record_skips_trailing_tombstones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.csv");
        fs::write(&path, "id,v\na,1\nb,2\nc,\n").expect("seed");
        let options = FileOptions::new().with_header("id,v");
        assert_eq!(read_last_record(&path, &options).expect("last"), Some(vec!["b".into(), "2".into()]));
    }

    #[test]
    fn append_conforms_to_header_width() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("users.tsv");
        let options = FileOptions::new().with_header("id\tname\tage");
        let records = [
            FieldsSpec::from("u1\tAlice"),
            FieldsSpec::from(vec!["u2", "Bob", "41", "extra"]),
        ];
        assert_eq!(append_records(&path, records, &options).expect("append"), 2);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "id\tname\tage\nu1\tAlice\t\nu2\tBob\t41\n"
        );
    }

    #[test]
    fn append_without_header_uses_widest_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        let records = [vec!["a"], vec!["b", "1", "2"]];
        append_records(&path, records, &FileOptions::new()).expect("append");
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\t\t\nb\t1\t2\n");
        let none: [Vec<String>; 0] = [];
        assert_eq!(append_records(&path, none, &FileOptions::new()).expect("append"), 0);
    }

    #[test]
    fn clear_keeps_the_files_own_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        fs::write(&path, "key\tvalue\na\t1\n").expect("seed");
        clear_table(&path, &FileOptions::new().with_header("id\tv")).expect("clear");
        assert_eq!(fs::read_to_string(&path).unwrap(), "key\tvalue\n");

        let fresh = dir.path().join("fresh.tsv");
        clear_table(&fresh, &FileOptions::new().with_header("id\tv")).expect("clear");
        assert_eq!(fs::read_to_string(&fresh).unwrap(), "id\tv\n");
    }

    #[test]
    fn scrub_compacts_to_live_records() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        fs::write(
            &path,
            "id\tv\n#_defaults_#\tnone\na\t1\nb\t2\n# comment\na\t3\nb\t\nc\t\n",
        )
        .expect("seed");
        let snapshot = scrub_table(&path, &FileOptions::new().with_header("id\tv")).expect("scrub");
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "id\tv\n#_defaults_#\tnone\na\t3\n");
    }
}
