//! Purpose: Serialize durable file access within the process and cooperate across processes.
//! Exports: `FileCoordinator`, `FileGuard`, `mtime_ns`, `file_age`.
//! Role: Shared write discipline for the ordered map engine and the one-shot table ops.
//! Invariants: Acquire order is in-process mutex, then open stream, then OS exclusive lock.
//! Invariants: `Truncate` files are emptied only once the OS lock is held.
//! Invariants: Release flushes and fsyncs before unlocking, then records the new mtime.
//! Invariants: The OS lock is advisory; processes that skip it are not excluded.

use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use tracing::{debug, error};

use crate::core::error::{Error, ErrorKind};
use crate::core::stream::{OpenMode, StreamProvider, TableStream};

const WRITE_BUFFER_BYTES: usize = 1024 * 1024;

#[derive(Debug)]
pub struct FileCoordinator {
    path: PathBuf,
    streams: Arc<dyn StreamProvider>,
    io_lock: Mutex<()>,
    observed_mtime: AtomicU64,
}

impl FileCoordinator {
    pub fn new(path: impl Into<PathBuf>, streams: Arc<dyn StreamProvider>) -> Self {
        let path = path.into();
        let observed_mtime = AtomicU64::new(mtime_ns(&path));
        Self {
            path,
            streams,
            io_lock: Mutex::new(()),
            observed_mtime,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn streams(&self) -> &dyn StreamProvider {
        self.streams.as_ref()
    }

    /// Last mtime this process observed for the file, in nanoseconds.
    pub fn observed_mtime(&self) -> u64 {
        self.observed_mtime.load(Ordering::Acquire)
    }

    pub fn set_observed_mtime(&self, mtime: u64) {
        self.observed_mtime.store(mtime, Ordering::Release);
    }

    pub fn current_mtime(&self) -> u64 {
        mtime_ns(&self.path)
    }

    /// Records the file's current mtime as the last known value.
    pub fn observe(&self) {
        self.set_observed_mtime(self.current_mtime());
    }

    pub fn acquire(&self, mode: OpenMode) -> Result<FileGuard<'_>, Error> {
        let io_guard = self.io_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stream = self
            .streams
            .open(&self.path, mode)
            .map_err(|err| Error::io(&self.path, err))?;
        if let Some(file) = stream.as_file() {
            FileExt::lock_exclusive(file).map_err(|err| {
                Error::new(lock_error_kind(&err))
                    .with_message("failed to lock table file")
                    .with_path(&self.path)
                    .with_source(err)
            })?;
            if mode == OpenMode::Truncate {
                stream
                    .truncate(0)
                    .and_then(|()| stream.seek(SeekFrom::Start(0)))
                    .map_err(|err| Error::io(&self.path, err))?;
            }
        }
        debug!(path = %self.path.display(), ?mode, "table file locked");
        Ok(FileGuard {
            coordinator: self,
            stream,
            released: false,
            _io_guard: io_guard,
        })
    }

    /// Appends `lines` in one locked write, each terminated by a newline.
    pub fn append_lines<I, S>(&self, lines: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.write_lines(OpenMode::Append, lines)
    }

    /// Replaces the file content with `lines`.
    pub fn replace_lines<I, S>(&self, lines: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.write_lines(OpenMode::Truncate, lines)
    }

    fn write_lines<I, S>(&self, mode: OpenMode, lines: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut guard = self.acquire(mode)?;
        let mut count = 0;
        {
            let mut writer = BufWriter::with_capacity(WRITE_BUFFER_BYTES, guard.stream());
            for line in lines {
                writer
                    .write_all(line.as_ref().as_bytes())
                    .and_then(|()| writer.write_all(b"\n"))
                    .map_err(|err| Error::io(&self.path, err))?;
                count += 1;
            }
            writer.flush().map_err(|err| Error::io(&self.path, err))?;
        }
        guard.release()?;
        Ok(count)
    }
}

/// Exclusive handle on the table file for one logical write.
pub struct FileGuard<'a> {
    coordinator: &'a FileCoordinator,
    stream: Box<dyn TableStream>,
    released: bool,
    _io_guard: MutexGuard<'a, ()>,
}

impl FileGuard<'_> {
    pub fn stream(&mut self) -> &mut dyn TableStream {
        self.stream.as_mut()
    }

    pub fn release(mut self) -> Result<(), Error> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), Error> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let path = self.coordinator.path();
        let synced = self.stream.flush().and_then(|()| match self.stream.as_file() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        });
        if let Some(file) = self.stream.as_file() {
            if let Err(err) = FileExt::unlock(file) {
                error!(path = %path.display(), %err, "failed to unlock table file");
            }
        }
        self.coordinator.observe();
        debug!(path = %path.display(), "table file released");
        synced.map_err(|err| Error::io(path, err))
    }
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// File modification time in nanoseconds since the epoch; 0 when the file is missing.
pub fn mtime_ns(path: &Path) -> u64 {
    match std::fs::metadata(path) {
        Ok(meta) => meta
            .modified()
            .map(system_time_ns)
            .unwrap_or_else(|_| system_time_ns(SystemTime::now())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
        Err(err) => {
            error!(path = %path.display(), %err, "failed to read file mtime");
            system_time_ns(SystemTime::now())
        }
    }
}

/// Time since the file was last modified; zero when it is missing or in the future.
pub fn file_age(path: &Path) -> Duration {
    let now = system_time_ns(SystemTime::now());
    Duration::from_nanos(now.saturating_sub(mtime_ns(path)))
}

fn system_time_ns(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or_default()
}

pub(crate) fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}
