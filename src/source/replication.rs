// ABOUTME: Event source strategy streaming the binlog over a replication connection
// ABOUTME: Registers as a replica with the configured server id and decodes in-process

use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData};
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::{MysqlConfig, Role};
use crate::error::ReplicateError;
use crate::source::{normalize_rows_event, CancelFlag, EventStream, RawEvent};
use crate::state::BinlogPosition;

pub(crate) async fn start(
    mysql: &MysqlConfig,
    start: &BinlogPosition,
) -> Result<EventStream, ReplicateError> {
    let mut conn = Conn::new(mysql.opts(Role::ReplicationSlave))
        .await
        .map_err(ReplicateError::connection)?;
    // Announce the configured checksum algorithm, as a replica would.
    conn.query_drop(format!(
        "SET @master_binlog_checksum = '{}'",
        mysql.checksum.master_value()
    ))
    .await
    .map_err(ReplicateError::connection)?;
    let request = BinlogStreamRequest::new(mysql.server_id)
        .with_filename(start.file.as_bytes())
        .with_pos(start.position);
    let stream = conn
        .get_binlog_stream(request)
        .await
        .map_err(ReplicateError::connection)?;
    info!(
        file = %start.file,
        position = start.position,
        server_id = mysql.server_id,
        "binlog replication stream opened"
    );

    let (tx, rx) = mpsc::channel(64);
    let cancel = CancelFlag::new();
    tokio::spawn(pump(stream, cancel.clone(), tx));
    Ok(EventStream::new(rx, cancel))
}

async fn pump(
    mut stream: BinlogStream,
    cancel: CancelFlag,
    tx: mpsc::Sender<Result<RawEvent, ReplicateError>>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            event = stream.next() => match event {
                Some(Ok(event)) => match decode_event(&event, &stream) {
                    Ok(Some(raw)) => {
                        if tx.send(Ok(raw)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                },
                Some(Err(e)) => {
                    let _ = tx.send(Err(ReplicateError::connection(e))).await;
                    return;
                }
                None => {
                    if !cancel.is_cancelled() {
                        let _ = tx
                            .send(Err(ReplicateError::Connection(
                                "binlog stream closed by server".to_string(),
                            )))
                            .await;
                    }
                    return;
                }
            },
        }
    }
}

fn decode_event(
    event: &Event,
    stream: &BinlogStream,
) -> Result<Option<RawEvent>, ReplicateError> {
    let data = match event
        .read_data()
        .map_err(|e| ReplicateError::Parse(e.to_string()))?
    {
        Some(data) => data,
        None => return Ok(None),
    };
    match data {
        EventData::RotateEvent(rotate) => {
            let file = rotate.name().to_string();
            if file.is_empty() {
                return Ok(None);
            }
            Ok(Some(RawEvent::Rotate {
                file,
                position: rotate.position(),
            }))
        }
        EventData::RowsEvent(rows) => {
            // The stream tracks table map events internally.
            let table_map = stream.get_tme(rows.table_id()).ok_or_else(|| {
                ReplicateError::Parse(format!(
                    "rows event without table map (table id {})",
                    rows.table_id()
                ))
            })?;
            let next_position = u64::from(event.header().log_pos());
            Ok(Some(RawEvent::Rows(normalize_rows_event(
                &rows,
                table_map,
                next_position,
            )?)))
        }
        _ => Ok(None),
    }
}
