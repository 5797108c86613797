//! Purpose: Forward and reverse line scanning of table files through the codec and validator.
//! Exports: `TableSource`, `ScanSummary`, `LocatedRecord`, `scan_lines`, `last_record`, `CHUNK_SIZE`.
//! Role: The only place that turns file bytes into classified lines with exact byte offsets.
//! Invariants: Offsets are byte positions of the first byte of a line in the file.
//! Invariants: The reverse scan only classifies complete lines; a prefix that may continue
//!             into the previous chunk is carried over, except at the scan floor.
//! Invariants: Bytes before the floor (the header line) are never read by the reverse scan.

use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use bstr::ByteSlice;
use tracing::debug;

use crate::core::error::Error;
use crate::core::schema::{Parsed, Schema, line_contains_header};
use crate::core::stream::{OpenMode, StreamProvider};

/// Backward read size of the reverse scanner.
pub const CHUNK_SIZE: usize = 1024;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LocatedRecord {
    pub offset: u64,
    pub fields: Vec<String>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanSummary {
    /// The file's first line carried the expected header.
    pub header_matched: bool,
    /// Offset of the first line after the header (0 when no header line was consumed).
    pub data_start: u64,
    /// Offset just past the last byte read.
    pub end: u64,
}

/// A table file plus the header expectations used to open it.
#[derive(Clone, Copy, Debug)]
pub struct TableSource<'a> {
    pub path: &'a Path,
    pub streams: &'a dyn StreamProvider,
    pub header: &'a [String],
    pub verify_header: bool,
}

impl TableSource<'_> {
    fn checks_header(&self) -> bool {
        self.verify_header && !self.header.is_empty()
    }

    /// Full forward scan. `visit` sees every classified line with its offset.
    pub fn scan_forward<F>(&self, schema: &mut Schema, visit: F) -> Result<ScanSummary, Error>
    where
        F: FnMut(Parsed, u64),
    {
        let stream = self
            .streams
            .open(self.path, OpenMode::Read)
            .map_err(|err| Error::io(self.path, err))?;
        let mut reader = BufReader::new(stream);
        let mut summary = ScanSummary::default();
        if self.checks_header() {
            let (matched, consumed) = self.read_header(&mut reader, schema)?;
            summary.header_matched = matched;
            summary.data_start = consumed;
        }
        summary.end = scan_lines(&mut reader, schema, summary.data_start, visit)
            .map_err(|err| Error::io(self.path, err))?;
        debug!(path = %self.path.display(), bytes = summary.end, "forward scan complete");
        Ok(summary)
    }

    /// Locates the last valid record without reading the file from the start.
    pub fn scan_last(&self, schema: &mut Schema) -> Result<Option<LocatedRecord>, Error> {
        let stream = self
            .streams
            .open(self.path, OpenMode::Read)
            .map_err(|err| Error::io(self.path, err))?;
        let mut reader = BufReader::new(stream);
        let mut floor = 0;
        if self.checks_header() {
            floor = self.read_header(&mut reader, schema)?.1;
        }
        let mut stream = reader.into_inner();
        last_record(&mut stream, schema, floor).map_err(|err| Error::io(self.path, err))
    }

    /// Reads and checks the first line. Returns whether it matched and its byte length.
    fn read_header<R: BufRead>(&self, reader: &mut R, schema: &mut Schema) -> Result<(bool, u64), Error> {
        let mut line = Vec::new();
        let consumed = reader
            .read_until(b'\n', &mut line)
            .map_err(|err| Error::io(self.path, err))? as u64;
        if consumed == 0 {
            return Ok((false, 0));
        }
        let text = String::from_utf8_lossy(&line);
        let matched = line_contains_header(self.header, &text, schema.delimiter(), schema.strict())
            .map_err(|err| err.with_path(self.path))?;
        if matched && schema.column_count().is_none() {
            schema.set_column_count(Some(self.header.len()));
        }
        Ok((matched, consumed))
    }
}

/// Classifies every line from the reader's position, which must be byte `start` of the file.
/// Returns the offset just past the last line.
pub fn scan_lines<R, F>(reader: &mut R, schema: &mut Schema, start: u64, mut visit: F) -> io::Result<u64>
where
    R: BufRead,
    F: FnMut(Parsed, u64),
{
    let mut offset = start;
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            return Ok(offset);
        }
        let parsed = schema.parse_line(&String::from_utf8_lossy(&line));
        visit(parsed, offset);
        offset += read as u64;
    }
}

/// Reverse chunked scan for the last line that parses as a record. Lines at or before
/// `floor` are never considered.
pub fn last_record<S>(stream: &mut S, schema: &mut Schema, floor: u64) -> io::Result<Option<LocatedRecord>>
where
    S: Read + Seek + ?Sized,
{
    let end = stream.seek(SeekFrom::End(0))?;
    let mut position = end;
    let mut buffer: Vec<u8> = Vec::new();
    while position > floor {
        let read_size = (position - floor).min(CHUNK_SIZE as u64);
        position -= read_size;
        stream.seek(SeekFrom::Start(position))?;
        let mut chunk = vec![0; read_size as usize];
        stream.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buffer);
        buffer = chunk;

        let complete_from = if position == floor {
            0
        } else {
            match buffer.find_byte(b'\n') {
                Some(idx) => idx + 1,
                None => continue,
            }
        };

        let region = &buffer[complete_from..];
        let mut line_end = region.len();
        loop {
            let line_start = region[..line_end].rfind_byte(b'\n').map_or(0, |idx| idx + 1);
            let line = &region[line_start..line_end];
            if !line.trim().is_empty() {
                if let Parsed::Record(fields) = schema.parse_line(&line.to_str_lossy()) {
                    let offset = position + (complete_from + line_start) as u64;
                    return Ok(Some(LocatedRecord { offset, fields }));
                }
            }
            if line_start == 0 {
                break;
            }
            line_end = line_start - 1;
        }
        buffer.truncate(complete_from);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::{CHUNK_SIZE, LocatedRecord, TableSource, last_record, scan_lines};
    use crate::core::codec::Codec;
    use crate::core::error::ErrorKind;
    use crate::core::format::Delimiter;
    use crate::core::schema::{Parsed, Schema};
    use crate::core::stream::PlainFiles;
    use std::io::Cursor;

    fn schema(strict: bool) -> Schema {
        Schema::new(Codec::new(Delimiter::TAB).expect("codec"), strict)
    }

    fn forward_last(bytes: &[u8]) -> Option<LocatedRecord> {
        let mut schema = schema(false);
        let mut last = None;
        scan_lines(&mut Cursor::new(bytes), &mut schema, 0, |parsed, offset| {
            if let Parsed::Record(fields) = parsed {
                last = Some(LocatedRecord { offset, fields });
            }
        })
        .expect("scan");
        last
    }

    fn reverse_last(bytes: &[u8], floor: u64) -> Option<LocatedRecord> {
        last_record(&mut Cursor::new(bytes), &mut schema(false), floor).expect("scan")
    }

    #[test]
    fn reverse_matches_forward_on_large_file() {
        let mut text = String::new();
        for idx in 0..5000 {
            text.push_str(&format!("key{idx}\tvalue number {idx}\t{}\n", "x".repeat(idx % 7)));
        }
        // Longer than one chunk, so it always straddles a chunk boundary.
        let last_line = format!("tail\t{}\tend\n", "y".repeat(CHUNK_SIZE + 100));
        assert!(last_line.len() > CHUNK_SIZE);
        text.push_str(&last_line);
        let len = text.len();

        let forward = forward_last(text.as_bytes()).expect("forward");
        let reverse = reverse_last(text.as_bytes(), 0).expect("reverse");
        assert_eq!(reverse, forward);
        assert_eq!(reverse.fields[0], "tail");
        assert_eq!(reverse.offset as usize, len - last_line.len());
    }

    #[test]
    fn skips_trailing_comments_tombstones_and_blanks() {
        let text = b"a\t1\nb\t2\n# note\n\nb\t\n\n";
        let found = reverse_last(text, 0).expect("record");
        assert_eq!(found.fields, ["b", "2"]);
        assert_eq!(found.offset, 4);
    }

    #[test]
    fn short_file_without_trailing_newline() {
        let found = reverse_last(b"only\tone", 0).expect("record");
        assert_eq!(found, LocatedRecord { offset: 0, fields: vec!["only".into(), "one".into()] });
    }

    #[test]
    fn no_valid_line_and_floor() {
        assert_eq!(reverse_last(b"", 0), None);
        assert_eq!(reverse_last(b"# c\n\n", 0), None);
        // Header-only file: the header sits below the floor.
        assert_eq!(reverse_last(b"id\tname\n", 8), None);
    }

    #[test]
    fn source_scans_with_header_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("t.tsv");
        std::fs::write(&path, "id\tname\tage\nu1\tAlice\t30\nu2\tBob\n").expect("seed");
        let header = vec!["id".to_string(), "name".to_string(), "age".to_string()];
        let source = TableSource {
            path: &path,
            streams: &PlainFiles,
            header: &header,
            verify_header: true,
        };

        let mut schema = self::schema(false);
        let mut seen = Vec::new();
        let summary = source
            .scan_forward(&mut schema, |parsed, offset| seen.push((parsed, offset)))
            .expect("scan");
        assert!(summary.header_matched);
        assert_eq!(summary.data_start, 12);
        assert_eq!(schema.column_count(), Some(3));
        assert_eq!(seen[1].0, Parsed::Record(vec!["u2".into(), "Bob".into(), "".into()]));
        assert_eq!(seen[1].1, 24);

        let last = source.scan_last(&mut self::schema(false)).expect("scan").expect("record");
        assert_eq!(last.fields, ["u2", "Bob", ""]);

        let other = vec!["key".to_string(), "value".to_string()];
        let strict = TableSource { header: &other, ..source };
        let err = strict.scan_forward(&mut self::schema(true), |_, _| {}).expect_err("mismatch");
        assert_eq!(err.kind(), ErrorKind::SchemaMismatch);
    }
}
