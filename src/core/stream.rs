//! Purpose: Byte-stream provider seam between the engines and the filesystem.
//! Exports: `OpenMode`, `TableStream`, `StreamProvider`, `PlainFiles`.
//! Role: Engines ask for "a seekable byte stream for this path and mode"; compression
//!       wrappers plug in here without the engines knowing about them.
//! Invariants: `Truncate` and `Append` create the file when it is missing.
//! Invariants: `PlainFiles` opens `Truncate` without emptying the file; `FileCoordinator`
//!             truncates it after taking the OS lock. Other providers return an empty stream.
//! Invariants: Only streams backed by a real `File` take part in OS advisory locking.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::Path;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    Truncate,
    Append,
    ReadWrite,
}

pub trait TableStream: Read + Write + Seek + Send {
    /// Underlying file, when there is one to lock and fsync.
    fn as_file(&self) -> Option<&File> {
        None
    }

    fn truncate(&mut self, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stream does not support truncation",
        ))
    }
}

impl TableStream for File {
    fn as_file(&self) -> Option<&File> {
        Some(self)
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

pub trait StreamProvider: Send + Sync + fmt::Debug {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn TableStream>>;
}

/// Uncompressed files opened straight from the filesystem.
#[derive(Clone, Copy, Debug, Default)]
pub struct PlainFiles;

impl StreamProvider for PlainFiles {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn TableStream>> {
        let mut options = OpenOptions::new();
        match mode {
            OpenMode::Read => options.read(true),
            OpenMode::Truncate => options.write(true).create(true).truncate(false),
            OpenMode::Append => options.append(true).create(true),
            OpenMode::ReadWrite => options.read(true).write(true),
        };
        let file = options.open(path)?;
        Ok(Box::new(file))
    }
}
