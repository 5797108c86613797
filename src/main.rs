//! Purpose: `tabstore` CLI entry point.
//! Role: Binary crate root; parses args, installs logging, runs one file operation.
//! Invariants: Command results are JSON on stdout; diagnostics and logs go to stderr.
//! Invariants: Non-interactive errors are emitted as JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
#![allow(clippy::result_large_err)]
use std::io::{self, IsTerminal};
use std::path::PathBuf;

use clap::error::ErrorKind as ClapErrorKind;
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand, ValueHint};
use clap_complete::aot::Shell;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;
mod notice;

use notice::{Notice, notice_json};
use tabstore::api::{
    DEFAULTS_KEY, Delimiter, Error, ErrorKind, FieldsSpec, FileOptions, to_exit_code,
};

struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    Error::new(ErrorKind::Io)
                        .with_message("failed to write help")
                        .with_source(io_err)
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message(clap_error_summary(&err))
                    .with_hint(clap_error_hint(&err)));
            }
        },
    };

    init_tracing(cli.global.verbose);
    command_dispatch::dispatch_command(cli.command, &cli.global)
}

#[derive(Parser)]
#[command(
    name = "tabstore",
    version,
    about = "Ordered key-value tables in plain TSV / CSV / PSV / NSV files",
    help_template = r#"{about-with-newline}
{before-help}USAGE
  {usage}

COMMANDS
{subcommands}

OPTIONS
{options}

{after-help}
"#,
    long_about = None,
    before_help = r#"Every line is a record; the first field is its key. Later lines win.
A key with no values is a tombstone and deletes the key.
"#,
    after_help = r#"EXAMPLES
  $ tabstore append users.tsv u1 Alice 30
  $ tabstore append users.tsv u1 Alice 31      # supersedes the first line
  $ tabstore delete users.tsv u1               # appends a tombstone
  $ tabstore read users.tsv
  $ tabstore scrub users.tsv                   # drops superseded lines and comments

LEARN MORE
  $ tabstore <command> --help"#,
    arg_required_else_help = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct GlobalArgs {
    #[arg(
        short = 'd',
        long,
        global = true,
        help = "Field delimiter: tab, comma, pipe, null, a character, or an escape like \\t (default: from file extension)"
    )]
    delimiter: Option<String>,
    #[arg(
        short = 'c',
        long,
        global = true,
        help = "Expected header, fields separated by the delimiter"
    )]
    header: Option<String>,
    #[arg(
        long,
        global = true,
        help = "Defaults record, key first (the key is ignored), separated by the delimiter"
    )]
    defaults: Option<String>,
    #[arg(
        short = 's',
        long,
        global = true,
        conflicts_with = "force",
        help = "Reject malformed records and header mismatches"
    )]
    strict: bool,
    #[arg(
        short = 'f',
        long,
        global = true,
        help = "Ignore column count and header checks (default)"
    )]
    force: bool,
    #[arg(
        short = 'v',
        long,
        global = true,
        action = ArgAction::Count,
        help = "Log more (-v debug, -vv trace); RUST_LOG overrides"
    )]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    #[command(
        about = "Print the live records of a table",
        after_help = r#"EXAMPLES
  $ tabstore read users.tsv
  $ tabstore read users.tsv --last"#
    )]
    Read {
        #[arg(help = "Table file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(long, help = "Only the last valid record, found by scanning from the end")]
        last: bool,
    },
    #[command(
        about = "Append one record",
        long_about = r#"Append one record.

Values are padded or truncated to the header width when the file carries the
expected header. A key without values appends a tombstone."#
    )]
    Append {
        #[arg(help = "Table file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(help = "Record key")]
        key: String,
        #[arg(help = "Record values")]
        values: Vec<String>,
    },
    #[command(about = "Delete a key by appending a tombstone")]
    Delete {
        #[arg(help = "Table file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
        #[arg(help = "Record key")]
        key: String,
    },
    #[command(about = "Truncate a table to its header line")]
    Clear {
        #[arg(help = "Table file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    #[command(about = "Rewrite a table with only its live records (drops comments)")]
    Scrub {
        #[arg(help = "Table file", value_hint = ValueHint::FilePath)]
        file: PathBuf,
    },
    #[command(
        arg_required_else_help = true,
        about = "Generate shell completions",
        after_help = r#"EXAMPLES
  $ tabstore completion bash > ~/.local/share/bash-completion/completions/tabstore
  $ tabstore completion zsh > ~/.zfunc/_tabstore
  $ tabstore completion fish > ~/.config/fish/completions/tabstore.fish"#
    )]
    Completion {
        #[arg(help = "Shell to generate completions for")]
        shell: Shell,
    },
}

#[derive(Serialize)]
struct ReadOutput {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    header: Vec<String>,
    records: Vec<Vec<String>>,
}

#[derive(Serialize)]
struct LastOutput {
    record: Option<Vec<String>>,
}

#[derive(Serialize)]
struct WriteOutput {
    path: String,
    op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    records: Option<usize>,
}

fn init_tracing(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

impl GlobalArgs {
    /// File options for `path`, with header and defaults split on the effective delimiter.
    fn file_options(&self, path: &std::path::Path) -> Result<FileOptions, Error> {
        let mut options = FileOptions::new().with_strict(self.strict && !self.force);
        if let Some(value) = &self.delimiter {
            options = options.with_delimiter(Delimiter::parse(value)?);
        }
        let delimiter = options.delimiter_for(path);
        if let Some(header) = &self.header {
            options = options.with_header(unescape_arg(header));
        }
        if let Some(defaults) = &self.defaults {
            let mut fields = FieldsSpec::from(unescape_arg(defaults)).fields(delimiter);
            if let Some(key) = fields.first_mut() {
                *key = DEFAULTS_KEY.to_string();
            }
            options = options.with_defaults(fields);
        }
        Ok(options)
    }
}

/// Expands `\t`, `\n`, `\r`, `\0` and `\\` in header/defaults arguments.
fn unescape_arg(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') | None => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    out
}

fn emit_json(value: Value) {
    let json = if io::stdout().is_terminal() {
        serde_json::to_string_pretty(&value)
    } else {
        serde_json::to_string(&value)
    }
    .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn emit_serialized<T: Serialize>(output: &T) -> Result<(), Error> {
    let value = serde_json::to_value(output).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("failed to encode output")
            .with_source(err)
    })?;
    emit_json(value);
    Ok(())
}

fn emit_notice(notice: &Notice) {
    if io::stderr().is_terminal() {
        eprintln!("notice: {} ({})", notice.message, notice.path);
        return;
    }
    let json = serde_json::to_string(&notice_json(notice)).unwrap_or_else(|_| {
        "{\"notice\":{\"kind\":\"internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn emit_error(err: &Error) {
    if io::stderr().is_terminal() {
        eprintln!("{}", error_text(err));
        return;
    }
    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error".to_string(),
        ErrorKind::Usage => "usage error".to_string(),
        ErrorKind::NotFound => "not found".to_string(),
        ErrorKind::SchemaMismatch => "schema mismatch".to_string(),
        ErrorKind::KeyNotFound => "key not found".to_string(),
        ErrorKind::Desync => "table out of sync".to_string(),
        ErrorKind::Busy => "resource is busy".to_string(),
        ErrorKind::Permission => "permission denied".to_string(),
        ErrorKind::Io => "i/o error".to_string(),
    }
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(path) = err.path() {
        inner.insert("path".to_string(), json!(path.display().to_string()));
    }
    if let Some(key) = err.key() {
        inner.insert("key".to_string(), json!(key));
    }
    if let Some(offset) = err.offset() {
        inner.insert("offset".to_string(), json!(offset));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error) -> String {
    let mut lines = vec![format!("error: {}", error_message(err))];
    if let Some(hint) = err.hint() {
        lines.push(format!("hint: {hint}"));
    }
    if let Some(path) = err.path() {
        lines.push(format!("path: {}", path.display()));
    }
    if let Some(key) = err.key() {
        lines.push(format!("key: {key}"));
    }
    for cause in error_causes(err) {
        lines.push(format!("caused by: {cause}"));
    }
    lines.join("\n")
}

fn clap_error_summary(err: &clap::Error) -> String {
    for line in err.to_string().lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(rest) = trimmed.strip_prefix("error:") {
            return rest.trim().to_string();
        }
        return trimmed.to_string();
    }
    "invalid arguments".to_string()
}

fn clap_error_hint(err: &clap::Error) -> String {
    let rendered = err.to_string();
    let subcommand = rendered
        .lines()
        .find_map(|line| line.trim().strip_prefix("Usage: "))
        .and_then(|usage| {
            usage
                .split_whitespace()
                .skip_while(|token| *token != "tabstore")
                .nth(1)
                .filter(|token| !token.starts_with(['-', '<', '[']))
                .map(str::to_string)
        });
    match subcommand {
        Some(name) => format!("Try `tabstore {name} --help`."),
        None => "Try `tabstore --help`.".to_string(),
    }
}
