//! Purpose: Lite engine: a key -> byte-offset index over an append-only table file.
//! Exports: `LiteTable`, `IndexEntry`, `Index`.
//! Role: Low-footprint alternative to `Table` for very large or write-mostly tables.
//! Invariants: Writes only ever append; existing lines are never patched in place.
//! Invariants: The index is advisory. Reads re-check the key stored at the offset and
//!             strict mode turns a mismatch into `KeyNotFound`.
//! Notes: No locking, no sync thread and no external-change detection; one process only.

use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{DEFAULTS_KEY, is_comment_key};
use crate::core::options::FileOptions;
use crate::core::ordered::OrderedMap;
use crate::core::scan::TableSource;
use crate::core::schema::{Normalized, Parsed, Schema, verify_table_file};
use crate::core::stream::{OpenMode, StreamProvider, TableStream};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IndexEntry {
    /// Byte offset of the key's latest line.
    Offset(u64),
    /// Value of an in-memory-only (comment) key.
    Inline(Vec<String>),
}

pub type Index = OrderedMap<IndexEntry>;

pub struct LiteTable {
    path: PathBuf,
    streams: Arc<dyn StreamProvider>,
    stream: Box<dyn TableStream>,
    schema: Schema,
    header: Vec<String>,
    index: Index,
    preset_column_count: Option<usize>,
    verify_header: bool,
    create_if_missing: bool,
}

impl std::fmt::Debug for LiteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiteTable")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("indexed", &self.index.len())
            .field("column_count", &self.schema.column_count())
            .finish_non_exhaustive()
    }
}

impl LiteTable {
    /// Opens `path` and indexes it with a forward scan.
    pub fn open(path: impl AsRef<Path>, options: FileOptions) -> Result<Self, Error> {
        let mut table = Self::with_index(path, options, Index::new())?;
        table.load()?;
        Ok(table)
    }

    /// Opens `path` with a pre-built index; keeping it consistent with the file is up to
    /// the caller.
    pub fn with_index(path: impl AsRef<Path>, options: FileOptions, index: Index) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let (schema, header) = options.schema_for(&path)?;
        verify_table_file(
            &path,
            options.streams.as_ref(),
            schema.codec(),
            &header,
            options.create_if_missing,
            options.strict,
        )?;
        let stream = options
            .streams
            .open(&path, OpenMode::ReadWrite)
            .map_err(|err| Error::io(&path, err))?;
        Ok(Self {
            path,
            streams: options.streams,
            stream,
            schema,
            header,
            index,
            preset_column_count: options.column_count,
            verify_header: options.verify_header,
            create_if_missing: options.create_if_missing,
        })
    }

    fn load(&mut self) -> Result<(), Error> {
        let source = TableSource {
            path: &self.path,
            streams: self.streams.as_ref(),
            header: &self.header,
            verify_header: self.verify_header,
        };
        let index = &mut self.index;
        let path = &self.path;
        source.scan_forward(&mut self.schema, |parsed, offset| match parsed {
            Parsed::Record(fields) => {
                let key = fields.into_iter().next().unwrap_or_default();
                index.insert(key, IndexEntry::Offset(offset));
            }
            Parsed::Tombstone(key) => {
                index.remove(&key);
            }
            Parsed::Rejected { key, columns } => {
                warn!(path = %path.display(), %key, columns, offset, "dropping record with wrong column count");
            }
            Parsed::Skipped | Parsed::Defaults(_) | Parsed::DefaultsCleared => {}
        })?;
        debug!(path = %self.path.display(), indexed = self.index.len(), "lite index built");
        Ok(())
    }

    pub fn reload(&mut self) -> Result<(), Error> {
        self.index.clear();
        self.schema.set_column_count(self.preset_column_count);
        self.load()
    }

    /// Closes the current file and indexes `path` instead.
    pub fn switch_file(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref().to_path_buf();
        verify_table_file(
            &path,
            self.streams.as_ref(),
            self.schema.codec(),
            &self.header,
            self.create_if_missing,
            self.schema.strict(),
        )?;
        self.stream = self
            .streams
            .open(&path, OpenMode::ReadWrite)
            .map_err(|err| Error::io(&path, err))?;
        self.path = path;
        self.reload()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn defaults(&self) -> &[String] {
        self.schema.defaults()
    }

    pub fn column_count(&self) -> Option<usize> {
        self.schema.column_count()
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn into_index(self) -> Index {
        self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key.trim_end())
    }

    pub fn keys(&self) -> Vec<String> {
        self.index.keys().map(str::to_string).collect()
    }

    /// Offsets of every file-backed key, in index order.
    pub fn positions(&self) -> Vec<u64> {
        self.index
            .values()
            .filter_map(|entry| match entry {
                IndexEntry::Offset(offset) => Some(*offset),
                IndexEntry::Inline(_) => None,
            })
            .collect()
    }

    pub fn get(&mut self, key: &str) -> Result<Vec<String>, Error> {
        let key = key.trim_end();
        match self.index.get(key) {
            Some(IndexEntry::Offset(offset)) => {
                let offset = *offset;
                self.read_at(offset, key)
            }
            Some(IndexEntry::Inline(fields)) => Ok(fields.clone()),
            None if key == DEFAULTS_KEY => Ok(self.schema.defaults().to_vec()),
            None => Err(Error::key_not_found(key).with_path(&self.path)),
        }
    }

    /// Appends the record and points the index at it.
    pub fn set<I, S>(&mut self, key: &str, fields: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.trim_end();
        if key.is_empty() {
            error!("refusing to store a record with an empty key");
            return Ok(());
        }
        let fields = fields.into_iter().map(Into::into).collect();
        let record = match self.schema.normalize(key, fields) {
            Normalized::Store(record) => record,
            Normalized::Delete => {
                self.delete(key)?;
                return Ok(());
            }
            Normalized::Rejected { expected, found } => {
                return Err(Error::new(ErrorKind::SchemaMismatch)
                    .with_message(format!("record has {found} columns, table expects {expected}"))
                    .with_key(key)
                    .with_path(&self.path));
            }
        };
        if key == DEFAULTS_KEY {
            self.schema.set_defaults(record);
            let line = self.schema.codec().encode(self.schema.defaults());
            self.append(&line)?;
            return Ok(());
        }
        if is_comment_key(key) {
            self.index.insert(key, IndexEntry::Inline(record));
            return Ok(());
        }
        let line = self.schema.codec().encode(&record);
        let offset = self.append(&line)?;
        self.index.insert(key, IndexEntry::Offset(offset));
        Ok(())
    }

    pub fn set_line(&mut self, key: &str, line: &str) -> Result<(), Error> {
        let delimiter = self.schema.delimiter().as_char();
        self.set(key, line.split(delimiter))
    }

    /// Appends a key-only tombstone and drops the key from the index. Returns whether
    /// the key was present.
    pub fn delete(&mut self, key: &str) -> Result<bool, Error> {
        let key = key.trim_end();
        if key == DEFAULTS_KEY {
            self.schema.clear_defaults();
            self.append(DEFAULTS_KEY)?;
            return Ok(true);
        }
        if self.index.remove(key).is_none() {
            return Ok(false);
        }
        if !is_comment_key(key) {
            let line = self.schema.codec().encode(&[key]);
            self.append(&line)?;
        }
        Ok(true)
    }

    pub fn pop(&mut self, key: &str) -> Result<Vec<String>, Error> {
        let key = key.trim_end();
        if !self.index.contains_key(key) {
            return Err(Error::key_not_found(key).with_path(&self.path));
        }
        let value = self.get(key)?;
        self.delete(key)?;
        Ok(value)
    }

    pub fn pop_item(&mut self, last: bool) -> Result<(String, Vec<String>), Error> {
        let key = if last {
            self.index.keys().next_back()
        } else {
            self.index.keys().next()
        };
        let Some(key) = key.map(str::to_string) else {
            return Err(Error::new(ErrorKind::KeyNotFound)
                .with_message("table is empty")
                .with_path(&self.path));
        };
        let value = self.pop(&key)?;
        Ok((key, value))
    }

    /// Drops the index and truncates the file to its header.
    pub fn clear(&mut self) -> Result<(), Error> {
        self.index.clear();
        self.stream.truncate(0).map_err(|err| Error::io(&self.path, err))?;
        if !self.header.is_empty() {
            let line = self.schema.codec().encode(&self.header);
            self.append(&line)?;
        }
        Ok(())
    }

    fn append(&mut self, line: &str) -> Result<u64, Error> {
        let write = |stream: &mut dyn TableStream| -> std::io::Result<u64> {
            let offset = stream.seek(SeekFrom::End(0))?;
            stream.write_all(line.as_bytes())?;
            stream.write_all(b"\n")?;
            stream.flush()?;
            Ok(offset)
        };
        let offset = write(self.stream.as_mut()).map_err(|err| Error::io(&self.path, err))?;
        debug!(path = %self.path.display(), offset, "line appended");
        Ok(offset)
    }

    fn read_at(&mut self, offset: u64, key: &str) -> Result<Vec<String>, Error> {
        let mut line = Vec::new();
        self.stream
            .seek(SeekFrom::Start(offset))
            .and_then(|_| BufReader::new(&mut self.stream).read_until(b'\n', &mut line))
            .map_err(|err| Error::io(&self.path, err))?;
        let parsed = self.schema.peek_line(&String::from_utf8_lossy(&line));
        let Parsed::Record(fields) = parsed else {
            warn!(path = %self.path.display(), %key, offset, "no record at indexed offset");
            return Err(Error::key_not_found(key).with_path(&self.path).with_offset(offset));
        };
        if fields[0] != key {
            warn!(path = %self.path.display(), expected = %key, found = %fields[0], offset, "key mismatch at indexed offset");
            if self.schema.strict() {
                return Err(Error::key_not_found(key).with_path(&self.path).with_offset(offset));
            }
        }
        Ok(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::{Index, IndexEntry, LiteTable};
    use crate::core::error::ErrorKind;
    use crate::core::format::DEFAULTS_KEY;
    use crate::core::options::FileOptions;
    use std::fs;

    #[test]
    fn indexes_offsets_and_reads_lazily() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        fs::write(&path, "id\tv\na\t1\nb\t2\na\t3\n").expect("seed");
        let mut lite = LiteTable::open(&path, FileOptions::new().with_header("id\tv")).expect("open");
        assert_eq!(lite.keys(), ["a", "b"]);
        assert_eq!(lite.positions(), [13, 9]);
        assert_eq!(lite.get("a").expect("get"), ["a", "3"]);
        assert_eq!(lite.get("zz").expect_err("absent").kind(), ErrorKind::KeyNotFound);
    }

    #[test]
    fn writes_append_and_deletes_leave_tombstones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        let mut lite = LiteTable::open(&path, FileOptions::new().with_header("id\tname\tage")).expect("open");
        lite.set("u1", ["u1", "Alice"]).expect("set");
        lite.set("u1", ["u1", "Alice", "31"]).expect("set");
        assert_eq!(lite.get("u1").expect("get"), ["u1", "Alice", "31"]);
        assert!(lite.delete("u1").expect("delete"));
        assert!(!lite.delete("u1").expect("delete again"));
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "id\tname\tage\nu1\tAlice\t\nu1\tAlice\t31\nu1\n"
        );
        lite.reload().expect("reload");
        assert!(lite.is_empty());
    }

    #[test]
    fn strict_mode_rejects_stale_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        fs::write(&path, "a\t1\nb\t2\n").expect("seed");
        let mut index = Index::new();
        index.insert("a", IndexEntry::Offset(4));

        let options = FileOptions::new().with_strict(true);
        let mut lite = LiteTable::with_index(&path, options, index.clone()).expect("open");
        let err = lite.get("a").expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
        assert_eq!(err.offset(), Some(4));

        let mut lenient = LiteTable::with_index(&path, FileOptions::new(), index).expect("open");
        assert_eq!(lenient.get("a").expect("lenient"), ["b", "2"]);
    }

    #[test]
    fn stale_offset_on_the_defaults_line_leaves_defaults_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        fs::write(&path, "#_defaults_#\t0\tunknown\nu2\t5\tbob\n").expect("seed");
        let mut index = Index::new();
        index.insert("u2", IndexEntry::Offset(0));

        let options = FileOptions::new().with_column_count(3);
        let mut lite = LiteTable::with_index(&path, options, index).expect("open");
        let err = lite.get("u2").expect_err("defaults line is not a record");
        assert_eq!(err.kind(), ErrorKind::KeyNotFound);
        assert_eq!(err.offset(), Some(0));
        assert_eq!(lite.defaults(), [DEFAULTS_KEY]);
    }

    #[test]
    fn comment_keys_and_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        let mut lite = LiteTable::open(&path, FileOptions::new().with_column_count(3)).expect("open");
        lite.set("#note", ["#note", "x", "y"]).expect("set");
        lite.set(DEFAULTS_KEY, ["0", "unknown"]).expect("defaults");
        lite.set("u2", ["u2", "", ""]).expect("set");
        assert_eq!(lite.get("#note").expect("inline"), ["#note", "x", "y"]);
        assert_eq!(lite.get(DEFAULTS_KEY).expect("defaults"), [DEFAULTS_KEY, "0", "unknown"]);
        assert_eq!(lite.get("u2").expect("get"), ["u2", "0", "unknown"]);
        assert_eq!(lite.positions().len(), 1);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "#_defaults_#\t0\tunknown\nu2\t0\tunknown\n"
        );
    }

    #[test]
    fn pop_clear_and_switch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = dir.path().join("a.tsv");
        let second = dir.path().join("b.tsv");
        fs::write(&second, "id\tv\nx\t9\n").expect("seed");

        let mut lite = LiteTable::open(&first, FileOptions::new().with_header("id\tv")).expect("open");
        for key in ["a", "b", "c"] {
            lite.set(key, [key, "1"]).expect("set");
        }
        assert_eq!(lite.pop("b").expect("pop"), ["b", "1"]);
        assert_eq!(lite.pop_item(true).expect("pop").0, "c");
        assert_eq!(lite.pop("b").expect_err("absent").kind(), ErrorKind::KeyNotFound);
        lite.clear().expect("clear");
        assert!(lite.is_empty());
        assert_eq!(fs::read_to_string(&first).unwrap(), "id\tv\n");

        lite.switch_file(&second).expect("switch");
        assert_eq!(lite.get("x").expect("get"), ["x", "9"]);
        let index = lite.into_index();
        assert_eq!(index.get("x"), Some(&IndexEntry::Offset(5)));
    }
}
