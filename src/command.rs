// ABOUTME: Groonga command serialization
// ABOUTME: Formats load and delete commands onto an output sink

use std::io::Write;

use serde_json::{Map, Value};

use crate::error::ReplicateError;

/// Writes a `load` command: header line, then the records as a JSON array
/// with one record per line.
pub fn write_load<W: Write>(
    out: &mut W,
    table: &str,
    records: &[Map<String, Value>],
) -> Result<(), ReplicateError> {
    writeln!(out, "load --table {table}")?;
    out.write_all(b"[\n")?;
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            out.write_all(b",\n")?;
        }
        serde_json::to_writer(&mut *out, record)
            .map_err(|e| ReplicateError::Parse(format!("unserializable record: {e}")))?;
    }
    out.write_all(b"\n]\n")?;
    Ok(())
}

/// Writes a `delete` command for one key.
pub fn write_delete<W: Write>(
    out: &mut W,
    table: &str,
    key: &str,
) -> Result<(), ReplicateError> {
    writeln!(
        out,
        "delete --key \"{}\" --table \"{}\"",
        quote(key),
        quote(table)
    )?;
    Ok(())
}

/// The `_key` of a generated record, rendered the way `delete --key` expects
/// it. A record without a key deletes nothing useful, but the command is
/// still emitted so the anomaly is visible downstream.
pub fn key_of(record: &Map<String, Value>) -> String {
    match record.get("_key") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
