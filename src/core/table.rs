//! Purpose: Ordered map engine: a fully materialized table kept in sync with its file.
//! Exports: `Table`, `RewriteStats`.
//! Role: Foreground calls mutate memory and queue serialized lines; a dedicated sync
//!       thread drains the queue, watches for external edits, and compacts the file.
//! Invariants: Lock order is the sync lock, then table state, then the coordinator's file lock.
//! Invariants: Table state is never held across file I/O. Sync passes copy what they write
//!             (queued lines or a `FileImage`) under the state lock and write after releasing it.
//! Invariants: Every queued line is already reflected in memory; a rewrite image therefore
//!             supersedes (and clears) the queue.
//! Invariants: Keys starting with the comment marker never reach the file.
//! Notes: The diff rewrite patches lines in place while their byte length is unchanged
//!        and switches to sequential writes for the rest of the pass once it is not.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bstr::ByteSlice;
use tracing::{debug, error, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::{DEFAULTS_KEY, Delimiter, is_comment_key, is_compressed};
use crate::core::lock::{FileCoordinator, file_age};
use crate::core::options::{MIN_POLL_DELAY, TableOptions};
use crate::core::ordered::OrderedMap;
use crate::core::scan::TableSource;
use crate::core::schema::{Normalized, Parsed, Schema, line_contains_header, verify_table_file};
use crate::core::stream::{OpenMode, TableStream};

const READ_AHEAD_BYTES: usize = 64 * 1024;

/// What one file rewrite did.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RewriteStats {
    pub unchanged: usize,
    pub patched: usize,
    pub appended: usize,
    pub full_rewrite: bool,
}

#[derive(Clone, Debug)]
struct SyncPolicy {
    verify_header: bool,
    create_if_missing: bool,
    preset_column_count: Option<usize>,
    rewrite_on_exit: bool,
    rewrite_interval: Duration,
    monitor_external_changes: bool,
}

#[derive(Debug)]
struct TableState {
    schema: Schema,
    header: Vec<String>,
    records: OrderedMap<Vec<String>>,
    queue: VecDeque<String>,
    dirty: bool,
    desynced: bool,
    memory_only: bool,
    policy: SyncPolicy,
}

/// Records read from the file, ready to replace the in-memory view.
struct Loaded {
    schema: Schema,
    records: OrderedMap<Vec<String>>,
    mtime: u64,
}

fn load_records(
    files: &FileCoordinator,
    mut schema: Schema,
    header: &[String],
    policy: &SyncPolicy,
) -> Result<Loaded, Error> {
    let path = files.path();
    schema.set_column_count(policy.preset_column_count);
    let exists = verify_table_file(
        path,
        files.streams(),
        schema.codec(),
        header,
        policy.create_if_missing,
        schema.strict(),
    )?;
    let mtime = files.current_mtime();

    let mut records = OrderedMap::new();
    if exists {
        let source = TableSource {
            path,
            streams: files.streams(),
            header,
            verify_header: policy.verify_header,
        };
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
    }

    let from_header = (policy.verify_header && !header.is_empty()).then_some(header.len());
    let column_count = policy
        .preset_column_count
        .or(from_header)
        .or_else(|| records.first().map(|(_, fields)| fields.len()));
    schema.set_column_count(column_count);
    info!(path = %path.display(), records = records.len(), ?column_count, "table loaded");
    Ok(Loaded { schema, records, mtime })
}

impl TableState {
    /// Replaces the in-memory view with `loaded`. `dirty` survives so a pending
    /// compaction or reorder still reaches the file.
    fn install(&mut self, loaded: Loaded, files: &FileCoordinator) {
        let Loaded {
            mut schema,
            mut records,
            mtime,
        } = loaded;
        // Lines queued while the file was read are not in it yet.
        for line in &self.queue {
            match schema.parse_line(line) {
                Parsed::Record(fields) => {
                    records.insert(fields[0].clone(), fields);
                }
                Parsed::Tombstone(key) => {
                    records.remove(&key);
                }
                _ => {}
            }
        }
        self.schema = schema;
        self.records = records;
        self.desynced = false;
        files.set_observed_mtime(mtime);
    }

    fn set(&mut self, key: &str, fields: Vec<String>) -> Result<(), Error> {
        let key = key.trim_end();
        if key.is_empty() {
            error!("refusing to store a record with an empty key");
            return Ok(());
        }
        if key == DEFAULTS_KEY {
            self.set_defaults(fields);
            return Ok(());
        }
        let record = match self.schema.normalize(key, fields) {
            Normalized::Store(record) => record,
            Normalized::Delete => {
                self.delete(key);
                return Ok(());
            }
            Normalized::Rejected { expected, found } => {
                return Err(Error::new(ErrorKind::SchemaMismatch)
                    .with_message(format!("record has {found} columns, table expects {expected}"))
                    .with_key(key));
            }
        };
        if let Some(existing) = self.records.get(key) {
            if *existing == record {
                return Ok(());
            }
            self.dirty = true;
        }
        if !self.memory_only && !is_comment_key(key) {
            self.queue.push_back(self.schema.codec().encode(&record));
        }
        self.records.insert(key, record);
        Ok(())
    }

    fn set_defaults(&mut self, fields: Vec<String>) {
        self.schema.set_defaults(fields);
        debug!(defaults = ?self.schema.defaults(), "defaults replaced");
        if !self.memory_only {
            let line = self.schema.codec().encode(self.schema.defaults());
            self.queue.push_back(line);
        }
    }

    fn delete(&mut self, key: &str) -> Option<Vec<String>> {
        let key = key.trim_end();
        if key == DEFAULTS_KEY {
            self.schema.clear_defaults();
            if !self.memory_only {
                self.queue.push_back(DEFAULTS_KEY.to_string());
            }
            return None;
        }
        let removed = self.records.remove(key)?;
        if !self.memory_only && !is_comment_key(key) {
            self.enqueue_tombstone(key, removed.len());
        }
        Some(removed)
    }

    fn pop_item(&mut self, last: bool) -> Result<(String, Vec<String>), Error> {
        let popped = if last {
            self.records.pop_last()
        } else {
            self.records.pop_first()
        };
        let (key, fields) = popped.ok_or_else(|| Error::new(ErrorKind::KeyNotFound).with_message("table is empty"))?;
        if !self.memory_only && !is_comment_key(&key) {
            self.enqueue_tombstone(&key, fields.len());
        }
        Ok((key, fields))
    }

    fn enqueue_tombstone(&mut self, key: &str, width: usize) {
        let tombstone = self.schema.tombstone(key, width);
        self.queue.push_back(self.schema.codec().encode(&tombstone));
        self.dirty = true;
    }

    fn move_to_end(&mut self, key: &str, last: bool) -> Result<(), Error> {
        let key = key.trim_end();
        if !self.records.move_to_end(key, last) {
            return Err(Error::key_not_found(key));
        }
        self.dirty = true;
        if !self.policy.rewrite_on_exit {
            self.policy.rewrite_on_exit = true;
            warn!(%key, "record order changed; the file is rewritten on close to keep it");
        }
        Ok(())
    }

    fn list_view(&self) -> Vec<Vec<String>> {
        let mut rows: Vec<Vec<String>> = self.records.values().cloned().collect();
        if !self.header.is_empty() && rows.first() != Some(&self.header) {
            rows.insert(0, self.header.clone());
        }
        rows
    }

    fn header_line(&self) -> Option<String> {
        (!self.header.is_empty()).then(|| self.schema.codec().encode(&self.header))
    }

    /// Defaults record (when set) followed by every persisted record, in order.
    fn persisted_lines(&self) -> impl Iterator<Item = String> + '_ {
        let codec = self.schema.codec();
        let defaults = self
            .schema
            .has_defaults()
            .then(|| codec.encode(self.schema.defaults()));
        let records = self
            .records
            .iter()
            .filter(|(key, _)| !is_comment_key(key))
            .map(move |(_, fields)| codec.encode(fields));
        defaults.into_iter().chain(records)
    }

    /// Serializes the table for a rewrite. The image covers every queued line, so the
    /// queue is dropped; mutations made while it is written queue up again.
    fn take_image(&mut self) -> FileImage {
        let image = FileImage {
            header: self.header.clone(),
            header_line: self.header_line(),
            delimiter: self.schema.delimiter(),
            lines: self.persisted_lines().collect(),
            monitor_external_changes: self.policy.monitor_external_changes,
        };
        self.queue.clear();
        self.dirty = false;
        image
    }

    fn check_external_changes(&mut self, files: &FileCoordinator, current: u64) -> bool {
        if self.desynced || !self.policy.monitor_external_changes {
            return self.desynced;
        }
        let observed = files.observed_mtime();
        if observed < current {
            self.desynced = true;
            info!(path = %files.path().display(), "external changes detected");
        } else if observed > current {
            warn!(path = %files.path().display(), observed, current, "file mtime went backwards; resetting");
            files.set_observed_mtime(current);
        }
        self.desynced
    }
}

/// Durable write failures surface as `Desync`; the cause stays attached as the source.
fn desync(err: Error, path: &Path) -> Error {
    match err.kind() {
        ErrorKind::Io | ErrorKind::Busy | ErrorKind::Permission => Error::new(ErrorKind::Desync)
            .with_message("table is out of sync with its file")
            .with_hint("call reload() or rewrite(true, ..) once the file is writable again")
            .with_path(path)
            .with_source(err),
        _ => err,
    }
}

/// Copy of everything a rewrite puts in the file.
struct FileImage {
    header: Vec<String>,
    header_line: Option<String>,
    delimiter: Delimiter,
    lines: Vec<String>,
    monitor_external_changes: bool,
}

impl FileImage {
    fn write(&self, files: &FileCoordinator, hard: bool) -> Result<RewriteStats, Error> {
        let path = files.path();
        if !self.monitor_external_changes && files.observed_mtime() < files.current_mtime() {
            warn!(path = %path.display(), "overwriting external changes");
        }
        if hard || is_compressed(path) {
            return self.write_full(files);
        }
        self.write_diff(files).or_else(|err| {
            warn!(path = %path.display(), %err, "in-place rewrite failed; rewriting the whole file");
            self.write_full(files)
        })
    }

    fn write_full(&self, files: &FileCoordinator) -> Result<RewriteStats, Error> {
        let count = files.replace_lines(self.header_line.iter().chain(&self.lines))?;
        Ok(RewriteStats {
            appended: count,
            full_rewrite: true,
            ..RewriteStats::default()
        })
    }

    fn write_diff(&self, files: &FileCoordinator) -> Result<RewriteStats, Error> {
        let path = files.path();
        let io_error = |err: io::Error| Error::io(path, err);
        let mut guard = files.acquire(OpenMode::ReadWrite)?;
        let stream = guard.stream();

        let mut patch = LinePatch::default();
        if let Some(header) = &self.header_line {
            let matches = match patch.line_end(stream).map_err(io_error)? {
                Some(end) => {
                    let line = patch.window[..end].to_str_lossy();
                    line_contains_header(&self.header, &line, self.delimiter, false)?
                }
                None => false,
            };
            if matches {
                patch.skip_line(stream).map_err(io_error)?;
            } else {
                patch.put_line(stream, header.as_bytes()).map_err(io_error)?;
            }
        }
        for line in &self.lines {
            patch.put_line(stream, line.as_bytes()).map_err(io_error)?;
        }
        stream.truncate(patch.cursor).map_err(io_error)?;
        guard.release()?;
        Ok(patch.stats)
    }
}

/// Cursor over the previous file content that rewrites only lines that changed.
///
/// The old content is read ahead in chunks while lines are still being compared; once a
/// line changes length nothing further is read.
#[derive(Default)]
struct LinePatch {
    /// Unconsumed on-disk bytes starting at `cursor`.
    window: Vec<u8>,
    /// File offset just past `window`.
    read_pos: u64,
    eof: bool,
    cursor: u64,
    append_only: bool,
    stats: RewriteStats,
}

impl LinePatch {
    /// Length of the on-disk line at the cursor, including its newline when present.
    fn line_end(&mut self, stream: &mut dyn TableStream) -> io::Result<Option<usize>> {
        let mut searched = 0;
        loop {
            if let Some(idx) = self.window[searched..].find_byte(b'\n') {
                return Ok(Some(searched + idx + 1));
            }
            searched = self.window.len();
            if self.eof {
                return Ok((!self.window.is_empty()).then_some(self.window.len()));
            }
            self.read_ahead(stream)?;
        }
    }

    fn read_ahead(&mut self, stream: &mut dyn TableStream) -> io::Result<()> {
        let start = self.window.len();
        self.window.resize(start + READ_AHEAD_BYTES, 0);
        stream.seek(SeekFrom::Start(self.read_pos))?;
        let read = loop {
            match stream.read(&mut self.window[start..]) {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                other => break other,
            }
        };
        let read = match read {
            Ok(read) => read,
            Err(err) => {
                self.window.truncate(start);
                return Err(err);
            }
        };
        self.window.truncate(start + read);
        self.read_pos += read as u64;
        self.eof = read == 0;
        Ok(())
    }

    fn skip_line(&mut self, stream: &mut dyn TableStream) -> io::Result<()> {
        if let Some(end) = self.line_end(stream)? {
            self.window.drain(..end);
            self.cursor += end as u64;
        }
        Ok(())
    }

    fn put_line(&mut self, stream: &mut dyn TableStream, line: &[u8]) -> io::Result<()> {
        let mut bytes = line.to_vec();
        if !self.append_only {
            match self.line_end(stream)? {
                Some(old_len) => {
                    let old = &self.window[..old_len];
                    let content_len = old.strip_suffix(b"\n").unwrap_or(old).len();
                    if bytes.len() < content_len {
                        bytes.resize(content_len, b' ');
                    }
                    bytes.push(b'\n');
                    if bytes == old {
                        self.window.drain(..old_len);
                        self.cursor += old_len as u64;
                        self.stats.unchanged += 1;
                        return Ok(());
                    }
                    self.window.drain(..old_len);
                    self.write_at_cursor(stream, &bytes)?;
                    self.stats.patched += 1;
                    if bytes.len() != old_len {
                        self.append_only = true;
                        self.window.clear();
                    }
                    return Ok(());
                }
                None => self.append_only = true,
            }
        }
        bytes.push(b'\n');
        self.write_at_cursor(stream, &bytes)?;
        self.stats.appended += 1;
        Ok(())
    }

    fn write_at_cursor(&mut self, stream: &mut dyn TableStream, bytes: &[u8]) -> io::Result<()> {
        stream.seek(SeekFrom::Start(self.cursor))?;
        stream.write_all(bytes)?;
        self.cursor += bytes.len() as u64;
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    files: FileCoordinator,
    state: Mutex<TableState>,
    /// Serializes sync work (flushes, rewrites, reloads) across the worker and callers.
    sync: Mutex<()>,
    stop: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sync_lock(&self) -> MutexGuard<'_, ()> {
        self.sync.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // The methods below expect the caller to hold `sync_lock`.

    fn load_from_file(&self) -> Result<(), Error> {
        let (schema, header, policy) = {
            let state = self.lock();
            (state.schema.clone(), state.header.clone(), state.policy.clone())
        };
        let loaded = load_records(&self.files, schema, &header, &policy)?;
        self.lock().install(loaded, &self.files);
        Ok(())
    }

    fn detect_external_changes(&self) -> bool {
        let current = self.files.current_mtime();
        self.lock().check_external_changes(&self.files, current)
    }

    fn flush_queue(&self) -> Result<usize, Error> {
        let lines = {
            let mut state = self.lock();
            if state.queue.is_empty() {
                return Ok(0);
            }
            if state.memory_only {
                debug!(dropped = state.queue.len(), "memory-only mode; append queue cleared");
                state.queue.clear();
                return Ok(0);
            }
            mem::take(&mut state.queue)
        };
        match self.files.append_lines(&lines) {
            Ok(count) => {
                debug!(path = %self.files.path().display(), count, "appends committed");
                Ok(count)
            }
            Err(err) => {
                let mut state = self.lock();
                state.desynced = true;
                let newer = mem::replace(&mut state.queue, lines);
                state.queue.extend(newer);
                Err(desync(err, self.files.path()))
            }
        }
    }

    fn write_image(&self, image: FileImage, hard: bool) -> Result<RewriteStats, Error> {
        let written = image.write(&self.files, hard);
        let mut state = self.lock();
        match &written {
            Ok(_) => state.desynced = false,
            Err(_) => {
                state.dirty = true;
                state.desynced = true;
            }
        }
        written
    }

    fn sync(&self, force: bool, reload: Option<bool>) -> Result<bool, Error> {
        self.try_sync(force, reload).map_err(|err| {
            self.lock().desynced = true;
            desync(err, self.files.path())
        })
    }

    fn try_sync(&self, force: bool, reload: Option<bool>) -> Result<bool, Error> {
        let path = self.files.path();
        let current = self.files.current_mtime();
        let age = file_age(path);
        let reload = {
            let state = self.lock();
            if !state.desynced && !force {
                if !state.dirty {
                    return Ok(false);
                }
                let interval = state.policy.rewrite_interval;
                if !interval.is_zero() && age < interval {
                    return Ok(false);
                }
            }
            reload.unwrap_or(state.policy.monitor_external_changes)
        };
        if reload && self.files.observed_mtime() < current {
            self.flush_queue()?;
            self.load_from_file()?;
        }
        let image = {
            let mut state = self.lock();
            if state.memory_only {
                debug!(path = %path.display(), "memory-only mode; rewrite skipped");
                return Ok(false);
            }
            (state.dirty || state.desynced).then(|| state.take_image())
        };
        if let Some(image) = image {
            let stats = self.write_image(image, false)?;
            debug!(path = %path.display(), ?stats, "table rewritten");
        }
        self.flush_queue()?;
        Ok(true)
    }

    fn clear(&self) -> Result<(), Error> {
        let header_line = {
            let mut state = self.lock();
            state.records.clear();
            state.queue.clear();
            if state.memory_only {
                return Ok(());
            }
            state.dirty = false;
            state.header_line()
        };
        let cleared = self.files.replace_lines(header_line);
        self.lock().desynced = cleared.is_err();
        cleared.map(drop)
    }

    fn sync_pass(&self) {
        let path = self.files.path();
        let _sync = self.sync_lock();
        if self.lock().memory_only {
            return;
        }
        self.detect_external_changes();
        if let Err(err) = self.sync(false, None) {
            error!(path = %path.display(), %err, "background rewrite failed");
        }
        if let Err(err) = self.flush_queue() {
            error!(path = %path.display(), %err, "background append failed");
        }
    }
}

fn run_sync_worker(shared: Arc<Shared>, poll_delay: Duration) {
    loop {
        thread::park_timeout(poll_delay);
        if shared.stop.load(Ordering::Acquire) {
            break;
        }
        shared.sync_pass();
    }
    let _sync = shared.sync_lock();
    if let Err(err) = shared.flush_queue() {
        error!(path = %shared.files.path().display(), %err, "final append failed");
    }
    debug!(path = %shared.files.path().display(), "sync worker stopped");
}

/// A delimiter-separated file exposed as an insertion-ordered map of records.
///
/// Mutations apply to memory immediately and reach the file through the sync thread, or
/// synchronously through [`Table::commit_appends`], [`Table::rewrite`] and [`Table::close`].
/// Foreground reads and writes never wait on file I/O done by the sync thread.
#[derive(Debug)]
pub struct Table {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Table {
    pub fn open(path: impl AsRef<Path>, options: TableOptions) -> Result<Self, Error> {
        let path = path.as_ref();
        let (schema, header) = options.file.schema_for(path)?;
        if !options.monitor_external_changes {
            warn!(path = %path.display(), "external change monitoring disabled; external edits will be overwritten");
        }
        let state = TableState {
            schema,
            header,
            records: OrderedMap::new(),
            queue: VecDeque::new(),
            dirty: false,
            desynced: false,
            memory_only: false,
            policy: SyncPolicy {
                verify_header: options.file.verify_header,
                create_if_missing: options.file.create_if_missing,
                preset_column_count: options.file.column_count,
                rewrite_on_exit: options.rewrite_on_exit,
                rewrite_interval: options.rewrite_interval,
                monitor_external_changes: options.monitor_external_changes,
            },
        };
        let shared = Arc::new(Shared {
            files: FileCoordinator::new(path, Arc::clone(&options.file.streams)),
            state: Mutex::new(state),
            sync: Mutex::new(()),
            stop: AtomicBool::new(false),
        });
        {
            let _sync = shared.sync_lock();
            shared.load_from_file()?;
            if options.rewrite_on_load && path.is_file() {
                shared.lock().dirty = true;
                shared.sync(true, Some(false))?;
            }
        }

        let poll_delay = options.poll_delay.max(MIN_POLL_DELAY);
        let worker = thread::Builder::new()
            .name("tabstore-sync".to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_sync_worker(shared, poll_delay)
            })
            .map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to start sync worker")
                    .with_path(path)
                    .with_source(err)
            })?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn path(&self) -> &Path {
        self.shared.files.path()
    }

    fn state(&self) -> MutexGuard<'_, TableState> {
        self.shared.lock()
    }

    pub fn get(&self, key: &str) -> Result<Vec<String>, Error> {
        let key = key.trim_end();
        self.state()
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| Error::key_not_found(key).with_path(self.path()))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.state().records.contains_key(key.trim_end())
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state().records.keys().map(str::to_string).collect()
    }

    pub fn values(&self) -> Vec<Vec<String>> {
        self.state().records.values().cloned().collect()
    }

    /// Snapshot of every record in order.
    pub fn iter(&self) -> std::vec::IntoIter<(String, Vec<String>)> {
        let state = self.state();
        let entries: Vec<_> = state
            .records
            .iter()
            .map(|(key, fields)| (key.to_string(), fields.clone()))
            .collect();
        entries.into_iter()
    }

    /// Stores a record. `fields` may omit the key; a lone key deletes the record unless
    /// the table has a single column.
    pub fn set<I, S>(&self, key: &str, fields: I) -> Result<(), Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let fields = fields.into_iter().map(Into::into).collect();
        self.state().set(key, fields).map_err(|err| err.with_path(self.path()))
    }

    /// Like [`Table::set`], with the record given as one delimited line.
    pub fn set_line(&self, key: &str, line: &str) -> Result<(), Error> {
        let delimiter = self.delimiter().as_char();
        self.set(key, line.split(delimiter))
    }

    /// Removes a record; absent keys are a no-op.
    pub fn delete(&self, key: &str) -> Option<Vec<String>> {
        self.state().delete(key)
    }

    pub fn pop(&self, key: &str) -> Result<Vec<String>, Error> {
        let key = key.trim_end();
        let mut state = self.state();
        if !state.records.contains_key(key) {
            return Err(Error::key_not_found(key).with_path(self.path()));
        }
        state
            .delete(key)
            .ok_or_else(|| Error::key_not_found(key).with_path(self.path()))
    }

    pub fn pop_item(&self, last: bool) -> Result<(String, Vec<String>), Error> {
        self.state().pop_item(last).map_err(|err| err.with_path(self.path()))
    }

    /// Reorders a record. The new order reaches the file on the next full sync, which
    /// this forces to happen at close.
    pub fn move_to_end(&self, key: &str, last: bool) -> Result<(), Error> {
        self.state()
            .move_to_end(key, last)
            .map_err(|err| err.with_path(self.path()))
    }

    pub fn defaults(&self) -> Vec<String> {
        self.state().schema.defaults().to_vec()
    }

    pub fn set_defaults<I, S>(&self, fields: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().set_defaults(fields.into_iter().map(Into::into).collect());
    }

    pub fn header(&self) -> Vec<String> {
        self.state().header.clone()
    }

    pub fn delimiter(&self) -> Delimiter {
        self.state().schema.delimiter()
    }

    pub fn column_count(&self) -> Option<usize> {
        self.state().schema.column_count()
    }

    /// Header row (unless it is already the first record) followed by every record.
    pub fn list_view(&self) -> Vec<Vec<String>> {
        self.state().list_view()
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn is_desynced(&self) -> bool {
        self.state().desynced
    }

    pub fn pending_appends(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_memory_only(&self) -> bool {
        self.state().memory_only
    }

    /// Suspends (or resumes) every durable write. Queued lines are dropped on the next flush
    /// while suspended.
    pub fn set_memory_only(&self, memory_only: bool) {
        self.state().memory_only = memory_only;
    }

    /// Rebuilds the table from its file. Lines still queued are re-applied on top.
    pub fn reload(&self) -> Result<(), Error> {
        let _sync = self.shared.sync_lock();
        self.shared.load_from_file()
    }

    /// Sync entry point. Returns whether a sync pass ran.
    pub fn rewrite(&self, force: bool, reload: Option<bool>) -> Result<bool, Error> {
        let _sync = self.shared.sync_lock();
        self.shared.sync(force, reload)
    }

    /// Minimal in-place rewrite of the file from memory; falls back to a full rewrite.
    pub fn map_to_file(&self) -> Result<RewriteStats, Error> {
        let _sync = self.shared.sync_lock();
        let image = self.state().take_image();
        let stats = self.shared.write_image(image, false)?;
        self.shared.flush_queue()?;
        Ok(stats)
    }

    /// Unconditional full rewrite of the file from memory.
    pub fn hard_map_to_file(&self) -> Result<RewriteStats, Error> {
        let _sync = self.shared.sync_lock();
        let image = self.state().take_image();
        self.shared.write_image(image, true)
    }

    /// Returns whether the table is out of sync with its file.
    pub fn check_external_changes(&self) -> bool {
        let _sync = self.shared.sync_lock();
        self.shared.detect_external_changes()
    }

    pub fn commit_appends(&self) -> Result<usize, Error> {
        let _sync = self.shared.sync_lock();
        self.shared.flush_queue()
    }

    /// Removes every record and truncates the file to its header.
    pub fn clear(&self) -> Result<(), Error> {
        let _sync = self.shared.sync_lock();
        self.shared.clear()
    }

    /// Stops the sync thread after a final sync pass and flush.
    pub fn close(mut self) -> Result<(), Error> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), Error> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let synced = {
            let _sync = self.shared.sync_lock();
            let force = {
                let mut state = self.state();
                let force = state.policy.rewrite_on_exit;
                if force {
                    state.dirty = true;
                }
                force
            };
            self.shared.sync(force, None).map(drop)
        };
        self.shared.stop.store(true, Ordering::Release);
        worker.thread().unpark();
        let joined = worker.join().map_err(|_| {
            Error::new(ErrorKind::Internal)
                .with_message("sync worker panicked")
                .with_path(self.path())
        });
        let flushed = self.commit_appends().map(drop);
        debug!(path = %self.path().display(), "table closed");
        synced.and(joined).and(flushed)
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            error!(path = %self.path().display(), %err, "failed to close table");
        }
    }
}
