// ABOUTME: Core event processor turning normalized rows events into Groonga commands
// ABOUTME: Tracks the current binlog file and commits the offset after each emitted batch

use std::collections::HashMap;
use std::io::Write;

use mysql_async::prelude::Queryable;
use mysql_async::Conn;
use tracing::{debug, info};

use crate::command;
use crate::config::{MysqlConfig, Role};
use crate::error::ReplicateError;
use crate::mapping::Mapping;
use crate::schema::SchemaCache;
use crate::source::{EventKind, EventSource, RawEvent, RowsEvent};
use crate::state::{BinlogPosition, ReplicationState};

/// Where to begin streaming: the committed offset if one exists, otherwise
/// the source's current write position from `SHOW MASTER STATUS`.
pub async fn resolve_start_position(
    mysql: &MysqlConfig,
    state: &ReplicationState,
) -> Result<BinlogPosition, ReplicateError> {
    if let Some(position) = state.position() {
        return Ok(position.clone());
    }
    let mut conn = Conn::new(mysql.opts(Role::ReplicationClient))
        .await
        .map_err(ReplicateError::connection)?;
    let row: Option<mysql_async::Row> = conn
        .query_first("SHOW MASTER STATUS")
        .await
        .map_err(ReplicateError::connection)?;
    let _ = conn.disconnect().await;
    let mut row = row.ok_or_else(|| {
        ReplicateError::Connection(
            "SHOW MASTER STATUS returned nothing (is binary logging enabled?)"
                .to_string(),
        )
    })?;
    let file: Option<String> = row.take("File");
    let position: Option<u64> = row.take("Position");
    match (file, position) {
        (Some(file), Some(position)) => Ok(BinlogPosition { file, position }),
        _ => Err(ReplicateError::Connection(
            "SHOW MASTER STATUS row is missing File/Position".to_string(),
        )),
    }
}

/// Consumes normalized binlog events and writes Groonga `load`/`delete`
/// commands to the output sink.
///
/// The offset is committed once per emitted batch, strictly after the
/// commands reached the sink. A crash between emission and commit replays
/// the batch on restart; `load` is an upsert on `_key` and `delete` of an
/// absent key is a no-op, so replay converges.
pub struct Importer<W: Write> {
    mapping: Mapping,
    schema: SchemaCache,
    state: ReplicationState,
    output: W,
}

impl<W: Write> Importer<W> {
    pub fn new(
        mapping: Mapping,
        schema: SchemaCache,
        state: ReplicationState,
        output: W,
    ) -> Self {
        Importer {
            mapping,
            schema,
            state,
            output,
        }
    }

    /// Releases the output sink, mainly so tests can inspect it.
    pub fn into_output(self) -> W {
        self.output
    }

    /// Processes events in log order until the source ends.
    pub async fn run<S: EventSource>(
        &mut self,
        start: BinlogPosition,
        source: &mut S,
    ) -> Result<(), ReplicateError> {
        let mut current_file = start.file;
        while let Some(event) = source.next_event().await {
            match event? {
                RawEvent::Rotate { file, position } => {
                    if file != current_file {
                        info!(from = %current_file, to = %file, position, "binlog rotated");
                        current_file = file;
                    }
                }
                RawEvent::Rows(rows) => {
                    self.apply_rows(&current_file, rows).await?;
                }
            }
        }
        Ok(())
    }

    async fn apply_rows(
        &mut self,
        current_file: &str,
        event: RowsEvent,
    ) -> Result<(), ReplicateError> {
        let Some(groonga_table) = self.mapping.groonga_table(&event.table) else {
            debug!(
                table = %format!("{}.{}", event.database, event.table),
                "no mapping entry, skipping"
            );
            return Ok(());
        };
        let groonga_table = groonga_table.to_string();
        let columns = self.schema.resolve(&event.database, &event.table).await?;

        let mut records = Vec::new();
        for image in &event.rows {
            let values = match event.kind {
                EventKind::Insert | EventKind::Update => image.after.as_ref(),
                EventKind::Delete => image.before.as_ref(),
            };
            let values = values.ok_or_else(|| {
                ReplicateError::Parse(format!(
                    "{:?} row for {}.{} is missing its row image",
                    event.kind, event.database, event.table
                ))
            })?;
            if values.len() != columns.len() {
                return Err(ReplicateError::schema_lookup(
                    &event.database,
                    &event.table,
                    format!(
                        "row has {} values but the table has {} columns",
                        values.len(),
                        columns.len()
                    ),
                ));
            }
            let row: HashMap<String, String> = columns
                .iter()
                .zip(values)
                .filter_map(|(column, value)| {
                    value
                        .as_ref()
                        .map(|value| (column.name.clone(), value.clone()))
                })
                .collect();
            if let Some(record) = self.mapping.generate_record(&event.table, &row)? {
                records.push(record);
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        match event.kind {
            EventKind::Insert | EventKind::Update => {
                command::write_load(&mut self.output, &groonga_table, &records)?;
            }
            EventKind::Delete => {
                for record in &records {
                    command::write_delete(
                        &mut self.output,
                        &groonga_table,
                        &command::key_of(record),
                    )?;
                }
            }
        }
        self.output.flush()?;
        debug!(
            table = %groonga_table,
            kind = ?event.kind,
            rows = records.len(),
            position = event.next_position,
            "batch emitted"
        );
        self.state.commit(&BinlogPosition {
            file: current_file.to_string(),
            position: event.next_position,
        })
    }
}
