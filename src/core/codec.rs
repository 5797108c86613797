//! Purpose: Reversible escaping of field values and record line <-> field list conversion.
//! Exports: `Codec`.
//! Role: Leaf of the storage stack; every engine serializes and parses through it.
//! Invariants: `decode(encode(fields)) == fields` for fields without trailing whitespace.
//! Invariants: An encoded line never contains the delimiter inside a field or a raw newline.
//! Invariants: Literal `</sep/>` / `</LF/>` input is ambiguous; it is kept and a warning is logged.

use std::borrow::Cow;

use regex::{Captures, Regex};
use tracing::warn;

use crate::core::error::{Error, ErrorKind};
use crate::core::format::Delimiter;

const SEP: &str = "<sep>";
const LF: &str = "<LF>";
const SEP_ESCAPED: &str = "</sep/>";
const LF_ESCAPED: &str = "</LF/>";

#[derive(Clone, Debug)]
pub struct Codec {
    delimiter: Delimiter,
    delimiter_str: String,
    tokens: Regex,
}

impl Codec {
    pub fn new(delimiter: Delimiter) -> Result<Self, Error> {
        let pattern = format!(
            r"({SEP_ESCAPED}|{LF_ESCAPED}|{SEP}|{LF}|\n|\x{{{:x}}})",
            delimiter.as_char() as u32
        );
        let tokens = Regex::new(&pattern).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to build escape pattern")
                .with_source(err)
        })?;
        Ok(Self {
            delimiter,
            delimiter_str: delimiter.as_char().to_string(),
            tokens,
        })
    }

    pub fn delimiter(&self) -> Delimiter {
        self.delimiter
    }

    pub fn encode_field<'a>(&self, field: &'a str) -> Cow<'a, str> {
        self.tokens.replace_all(field, |caps: &Captures<'_>| {
            let token = &caps[0];
            if token == self.delimiter_str {
                return SEP.to_string();
            }
            match token {
                SEP => SEP_ESCAPED.to_string(),
                LF => LF_ESCAPED.to_string(),
                "\n" => LF.to_string(),
                other => {
                    warn!(token = other, "escaped marker found in field value; it will not round-trip");
                    other.to_string()
                }
            }
        })
    }

    /// Decodes one field. Trailing whitespace is insignificant and stripped.
    pub fn decode_field(&self, field: &str) -> String {
        let field = field.trim_end();
        self.tokens
            .replace_all(field, |caps: &Captures<'_>| match &caps[0] {
                SEP => self.delimiter_str.clone(),
                SEP_ESCAPED => SEP.to_string(),
                LF_ESCAPED => LF.to_string(),
                LF => "\n".to_string(),
                other => other.to_string(),
            })
            .into_owned()
    }

    /// Serializes a record into one line, without the trailing newline.
    pub fn encode<S: AsRef<str>>(&self, fields: &[S]) -> String {
        let mut line = String::new();
        for (idx, field) in fields.iter().enumerate() {
            if idx > 0 {
                line.push_str(&self.delimiter_str);
            }
            line.push_str(&self.encode_field(field.as_ref()));
        }
        line
    }

    /// Parses one line (without its newline) into decoded fields.
    pub fn decode(&self, line: &str) -> Vec<String> {
        line.split(self.delimiter.as_char())
            .map(|field| self.decode_field(field))
            .collect()
    }
}
