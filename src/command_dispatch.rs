//! Purpose: Hold top-level CLI command dispatch for `tabstore`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command touches exactly one table file through the one-shot API.

use super::*;
use tabstore::api::{append_records, clear_table, read_last_record, read_table, scrub_table};

pub(super) fn dispatch_command(command: Command, global: &GlobalArgs) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "tabstore", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Read { file, last } => {
            if !file.is_file() {
                emit_notice(&Notice::file_not_found("read", &file));
                return Ok(RunOutcome::ok());
            }
            // Without an explicit header the first line is just another record.
            let options = global
                .file_options(&file)?
                .with_create_if_missing(false)
                .with_verify_header(global.header.is_some());
            if last {
                let record = read_last_record(&file, &options)?;
                emit_serialized(&LastOutput { record })?;
            } else {
                let snapshot = read_table(&file, &options)?;
                emit_serialized(&ReadOutput {
                    header: snapshot.header.clone(),
                    records: snapshot.records.values().cloned().collect(),
                })?;
            }
            Ok(RunOutcome::ok())
        }
        Command::Append { file, key, values } => {
            let options = global.file_options(&file)?;
            let record: Vec<String> = std::iter::once(key).chain(values).collect();
            let count = append_records(&file, [record], &options)?;
            emit_write(&file, "append", Some(count))
        }
        Command::Delete { file, key } => {
            let options = global.file_options(&file)?;
            let count = append_records(&file, [vec![key]], &options)?;
            emit_write(&file, "delete", Some(count))
        }
        Command::Clear { file } => {
            let options = global.file_options(&file)?.with_verify_header(global.strict);
            clear_table(&file, &options)?;
            emit_write(&file, "clear", None)
        }
        Command::Scrub { file } => {
            let options = global
                .file_options(&file)?
                .with_create_if_missing(false)
                .with_verify_header(global.header.is_some());
            let snapshot = scrub_table(&file, &options)?;
            emit_write(&file, "scrub", Some(snapshot.records.len()))
        }
    }
}

fn emit_write(file: &std::path::Path, op: &'static str, records: Option<usize>) -> Result<RunOutcome, Error> {
    emit_serialized(&WriteOutput {
        path: file.display().to_string(),
        op,
        records,
    })?;
    Ok(RunOutcome::ok())
}
