// ABOUTME: Event source abstraction over the two binlog acquisition strategies
// ABOUTME: Normalizes raw binlog events into canonical rotate/rows events

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mysql_async::binlog::events::{RowsEventData, TableMapEvent};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::Value;
use tokio::sync::{mpsc, Notify};

use crate::config::{Backend, MysqlConfig};
use crate::error::ReplicateError;
use crate::state::BinlogPosition;

mod mysqlbinlog;
mod replication;

/// Canonical row change kind. Every binlog rows-event revision (v1, v2,
/// partial) collapses to one of these at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// One changed row: column values by binlog ordinal, rendered to strings.
/// Inserts carry only `after`, deletes only `before`, updates both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowImage {
    pub before: Option<Vec<Option<String>>>,
    pub after: Option<Vec<Option<String>>>,
}

/// A normalized rows event: all rows of one change to one table, plus the
/// binlog position immediately after the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowsEvent {
    pub kind: EventKind,
    pub database: String,
    pub table: String,
    pub rows: Vec<RowImage>,
    pub next_position: u64,
}

/// An event the importer consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEvent {
    Rotate { file: String, position: u64 },
    Rows(RowsEvent),
}

/// A stream of binlog events. `next_event` returning `None` means the stream
/// ended cleanly (only after cancellation); errors end the stream too.
#[allow(async_fn_in_trait)]
pub trait EventSource {
    async fn next_event(&mut self) -> Option<Result<RawEvent, ReplicateError>>;
    fn cancel(&self);
}

/// Shared cancellation handle between a stream consumer and its producer
/// task.
#[derive(Debug, Clone, Default)]
pub(crate) struct CancelFlag {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelFlag {
    pub(crate) fn new() -> Self {
        CancelFlag::default()
    }

    pub(crate) fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Channel-backed event stream fed by a producer task. Dropping the stream
/// cancels the producer, which tears down its connection or subprocess.
pub struct EventStream {
    rx: mpsc::Receiver<Result<RawEvent, ReplicateError>>,
    cancel: CancelFlag,
}

impl EventStream {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<RawEvent, ReplicateError>>,
        cancel: CancelFlag,
    ) -> Self {
        EventStream { rx, cancel }
    }
}

impl EventSource for EventStream {
    async fn next_event(&mut self) -> Option<Result<RawEvent, ReplicateError>> {
        self.rx.recv().await
    }

    fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens the configured event source strategy, positioned at `start`.
pub async fn open(
    mysql: &MysqlConfig,
    binlog_dir: &Path,
    start: &BinlogPosition,
) -> Result<EventStream, ReplicateError> {
    match mysql.backend {
        Backend::Replication => replication::start(mysql, start).await,
        Backend::Mysqlbinlog => mysqlbinlog::start(mysql, binlog_dir, start),
    }
}

pub(crate) type TableMaps = HashMap<u64, TableMapEvent<'static>>;

pub(crate) fn normalize_rows_event(
    data: &RowsEventData<'_>,
    table_map: &TableMapEvent<'_>,
    next_position: u64,
) -> Result<RowsEvent, ReplicateError> {
    let kind = match data {
        RowsEventData::WriteRowsEventV1(_) | RowsEventData::WriteRowsEvent(_) => {
            EventKind::Insert
        }
        RowsEventData::UpdateRowsEventV1(_)
        | RowsEventData::UpdateRowsEvent(_)
        | RowsEventData::PartialUpdateRowsEvent(_) => EventKind::Update,
        RowsEventData::DeleteRowsEventV1(_) | RowsEventData::DeleteRowsEvent(_) => {
            EventKind::Delete
        }
        #[allow(unreachable_patterns)]
        other => {
            return Err(ReplicateError::Parse(format!(
                "unsupported rows event revision: {other:?}"
            )))
        }
    };
    let mut rows = Vec::new();
    for row in data.rows(table_map) {
        let (before, after) = row.map_err(|e| {
            ReplicateError::Parse(format!(
                "undecodable row in {}.{}: {e}",
                table_map.database_name(),
                table_map.table_name()
            ))
        })?;
        rows.push(RowImage {
            before: before.as_ref().map(image_values),
            after: after.as_ref().map(image_values),
        });
    }
    Ok(RowsEvent {
        kind,
        database: table_map.database_name().into_owned(),
        table: table_map.table_name().into_owned(),
        rows,
        next_position,
    })
}

fn image_values(row: &BinlogRow) -> Vec<Option<String>> {
    (0..row.len())
        .map(|i| row.as_ref(i).and_then(binlog_value_to_string))
        .collect()
}

/// Renders a binlog value the way it would appear in SQL text, without
/// quoting. NULL and non-plain values (JSON diffs) render as `None`.
fn binlog_value_to_string(value: &BinlogValue<'_>) -> Option<String> {
    match value {
        BinlogValue::Value(Value::NULL) => None,
        BinlogValue::Value(Value::Bytes(bytes)) => {
            Some(String::from_utf8_lossy(bytes).into_owned())
        }
        BinlogValue::Value(Value::Int(i)) => Some(i.to_string()),
        BinlogValue::Value(Value::UInt(u)) => Some(u.to_string()),
        BinlogValue::Value(Value::Float(f)) => Some(f.to_string()),
        BinlogValue::Value(Value::Double(d)) => Some(d.to_string()),
        BinlogValue::Value(other) => {
            Some(other.as_sql(true).trim_matches('\'').to_string())
        }
        _ => None,
    }
}
