// ABOUTME: Error taxonomy for the replication pipeline
// ABOUTME: Distinguishes fatal configuration/data errors from retryable transport errors

use thiserror::Error;

/// Errors raised while streaming binlog events into Groonga commands.
///
/// The server loop uses [`ReplicateError::is_retryable`] to decide whether a
/// failed pass aborts the process or is retried on the next polling tick.
#[derive(Debug, Error)]
pub enum ReplicateError {
    /// Invalid configuration: unknown mapping type tag, malformed template,
    /// unparsable config file, missing tooling.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A typed mapping column received a value it cannot cast.
    #[error("cannot cast {value:?} to {type_tag} for column {column:?}")]
    Cast {
        column: String,
        type_tag: String,
        value: String,
    },

    /// Source table metadata could not be resolved.
    #[error("schema lookup failed for {database}.{table}: {reason}")]
    SchemaLookup {
        database: String,
        table: String,
        reason: String,
    },

    /// Replication connection failed to open or dropped mid-stream.
    #[error("replication connection error: {0}")]
    Connection(String),

    /// The binlog dump subprocess exited before the run was cancelled.
    #[error("mysqlbinlog exited with status {status}: {stderr}")]
    Subprocess { status: i32, stderr: String },

    /// Truncated or malformed binlog segment.
    #[error("binlog parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ReplicateError {
    /// Transport failures are retried in server mode, resuming from the last
    /// committed offset. Everything else aborts the run: retrying a cast or
    /// configuration error would just re-fail, and silently skipping it would
    /// corrupt the index.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReplicateError::Connection(_) | ReplicateError::Subprocess { .. }
        )
    }

    pub(crate) fn connection(err: impl std::fmt::Display) -> Self {
        ReplicateError::Connection(err.to_string())
    }

    pub(crate) fn schema_lookup(
        database: &str,
        table: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        ReplicateError::SchemaLookup {
            database: database.to_string(),
            table: table.to_string(),
            reason: reason.to_string(),
        }
    }
}
