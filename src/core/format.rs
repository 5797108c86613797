//! Purpose: Centralize the on-disk table conventions shared by every engine.
//! Exports: `Delimiter`, `DEFAULTS_KEY`, `COMMENT_MARKER`, extension helpers.
//! Role: Single source for delimiter inference, reserved keys, and compression detection.
//! Invariants: A table's delimiter is fixed per instance; there is no process-wide default.
//! Invariants: Compression suffixes are ignored when inferring the table extension.

use std::fmt;
use std::path::Path;

use crate::core::error::{Error, ErrorKind};

/// Key of the record that carries per-column default values.
pub const DEFAULTS_KEY: &str = "#_defaults_#";
/// Keys (and lines) starting with this marker are never persisted.
pub const COMMENT_MARKER: char = '#';

pub const COMPRESSED_EXTENSIONS: &[&str] = &["gz", "gzip", "bz2", "bzip2", "xz", "lzma"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Delimiter(char);

impl Delimiter {
    pub const TAB: Delimiter = Delimiter('\t');
    pub const COMMA: Delimiter = Delimiter(',');
    pub const PIPE: Delimiter = Delimiter('|');
    pub const NUL: Delimiter = Delimiter('\0');

    pub fn new(ch: char) -> Result<Self, Error> {
        if ch == '\n' || ch == '\r' {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("line terminators cannot be used as a delimiter"));
        }
        Ok(Self(ch))
    }

    pub fn as_char(self) -> char {
        self.0
    }

    /// Infers the delimiter from the file name: `.csv`, `.nsv`, `.psv`, else tab.
    pub fn for_path(path: &Path) -> Self {
        match table_extension(path).as_deref() {
            Some("csv") => Self::COMMA,
            Some("nsv") => Self::NUL,
            Some("psv") => Self::PIPE,
            _ => Self::TAB,
        }
    }

    /// Parses a delimiter name (`tab`, `comma`, `pipe`, `null`), a raw character,
    /// or a backslash escape such as `\t`, `\0` or `\x1f`.
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "tab" => return Ok(Self::TAB),
            "comma" => return Ok(Self::COMMA),
            "pipe" => return Ok(Self::PIPE),
            "null" | "nul" => return Ok(Self::NUL),
            _ => {}
        }
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(ch), None) => Self::new(ch),
            (Some('\\'), Some(escape)) => {
                let rest: String = chars.collect();
                let ch = match (escape, rest.as_str()) {
                    ('t', "") => '\t',
                    ('0', "") => '\0',
                    ('\\', "") => '\\',
                    ('x', hex) | ('u', hex) if !hex.is_empty() => u32::from_str_radix(hex, 16)
                        .ok()
                        .and_then(char::from_u32)
                        .ok_or_else(|| invalid_delimiter(value))?,
                    _ => return Err(invalid_delimiter(value)),
                };
                Self::new(ch)
            }
            _ => Err(invalid_delimiter(value)),
        }
    }

    /// Extension conventionally paired with this delimiter, if any.
    pub fn canonical_extension(self) -> Option<&'static str> {
        match self.0 {
            '\t' => Some("tsv"),
            ',' => Some("csv"),
            '\0' => Some("nsv"),
            '|' => Some("psv"),
            _ => None,
        }
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self::TAB
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            '\t' => f.write_str("tab"),
            '\0' => f.write_str("null"),
            ch => write!(f, "{ch}"),
        }
    }
}

fn invalid_delimiter(value: &str) -> Error {
    Error::new(ErrorKind::Usage)
        .with_message(format!("invalid delimiter {value:?}"))
        .with_hint("Use tab, comma, pipe, null, a single character, or an escape like \\t.")
}

/// Table extension of `path`, skipping one trailing compression suffix.
pub fn table_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let mut parts = name.rsplit('.');
    let last = parts.next()?;
    let ext = if COMPRESSED_EXTENSIONS.contains(&last) {
        parts.next()?
    } else {
        last
    };
    if ext == name {
        return None;
    }
    Some(ext.to_string())
}

pub fn is_compressed(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| COMPRESSED_EXTENSIONS.contains(&ext))
}

pub fn is_comment_key(key: &str) -> bool {
    key.starts_with(COMMENT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::{Delimiter, is_comment_key, is_compressed, table_extension, DEFAULTS_KEY};
    use crate::core::error::ErrorKind;
    use std::path::Path;

    #[test]
    fn delimiter_is_inferred_from_extension() {
        assert_eq!(Delimiter::for_path(Path::new("a.csv")), Delimiter::COMMA);
        assert_eq!(Delimiter::for_path(Path::new("a.nsv")), Delimiter::NUL);
        assert_eq!(Delimiter::for_path(Path::new("a.psv")), Delimiter::PIPE);
        assert_eq!(Delimiter::for_path(Path::new("a.tsv")), Delimiter::TAB);
        assert_eq!(Delimiter::for_path(Path::new("a.txt")), Delimiter::TAB);
        assert_eq!(Delimiter::for_path(Path::new("a.csv.gz")), Delimiter::COMMA);
    }

    #[test]
    fn delimiter_names_and_escapes_parse() {
        assert_eq!(Delimiter::parse("comma").unwrap(), Delimiter::COMMA);
        assert_eq!(Delimiter::parse("null").unwrap(), Delimiter::NUL);
        assert_eq!(Delimiter::parse("\\t").unwrap(), Delimiter::TAB);
        assert_eq!(Delimiter::parse("\\0").unwrap(), Delimiter::NUL);
        assert_eq!(Delimiter::parse("\\x1f").unwrap().as_char(), '\u{1f}');
        assert_eq!(Delimiter::parse(";").unwrap().as_char(), ';');
        let err = Delimiter::parse("ab").expect_err("multi-char");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert!(Delimiter::parse("\n").is_err());
    }

    #[test]
    fn extension_skips_compression_suffix() {
        assert_eq!(table_extension(Path::new("/d/t.tsv.xz")).as_deref(), Some("tsv"));
        assert_eq!(table_extension(Path::new("/d/t.csv")).as_deref(), Some("csv"));
        assert_eq!(table_extension(Path::new("/d/table")), None);
        assert!(is_compressed(Path::new("t.tsv.gz")));
        assert!(!is_compressed(Path::new("t.tsv")));
    }

    #[test]
    fn defaults_key_is_a_comment_key() {
        assert!(is_comment_key(DEFAULTS_KEY));
        assert!(!is_comment_key("user"));
    }
}
