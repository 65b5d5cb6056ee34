// ABOUTME: Event source strategy that spawns mysqlbinlog and tails its output
// ABOUTME: Resumes from the highest contiguous local segment, decodes with EventStreamReader

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mysql_async::binlog::events::EventData;
use mysql_common::binlog::consts::BinlogVersion;
use mysql_common::binlog::EventStreamReader;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{MysqlConfig, Role};
use crate::error::ReplicateError;
use crate::source::{
    normalize_rows_event, CancelFlag, EventStream, RawEvent, TableMaps,
};
use crate::state::BinlogPosition;

const BINLOG_MAGIC: [u8; 4] = [0xfe, 0x62, 0x69, 0x6e];
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

pub(crate) fn start(
    mysql: &MysqlConfig,
    binlog_dir: &Path,
    start: &BinlogPosition,
) -> Result<EventStream, ReplicateError> {
    let binary = which::which("mysqlbinlog").map_err(|_| {
        ReplicateError::Configuration("mysqlbinlog not found in PATH".to_string())
    })?;
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancelFlag::new();
    let producer = Producer {
        binary,
        mysql: mysql.clone(),
        binlog_dir: binlog_dir.to_path_buf(),
        start: start.clone(),
        cancel: cancel.clone(),
    };
    tokio::task::spawn_blocking(move || producer.run(tx));
    Ok(EventStream::new(rx, cancel))
}

struct Producer {
    binary: PathBuf,
    mysql: MysqlConfig,
    binlog_dir: PathBuf,
    start: BinlogPosition,
    cancel: CancelFlag,
}

impl Producer {
    fn run(self, tx: mpsc::Sender<Result<RawEvent, ReplicateError>>) {
        if let Err(e) = self.dump_and_decode(&tx) {
            let _ = tx.blocking_send(Err(e));
        }
    }

    fn dump_and_decode(
        &self,
        tx: &mpsc::Sender<Result<RawEvent, ReplicateError>>,
    ) -> Result<(), ReplicateError> {
        fs::create_dir_all(&self.binlog_dir)?;
        let dump_start = resume_file(&self.binlog_dir, &self.start.file);
        info!(file = %dump_start, "starting mysqlbinlog dump");
        let process = DumpProcess::spawn(
            &self.binary,
            &self.mysql,
            &self.binlog_dir,
            &dump_start,
        )?;

        let mut table_maps = TableMaps::new();
        // The dump skips segments already downloaded, but decoding must
        // restart at the committed file and walk the local copies forward
        // through their rotate events, or everything between the committed
        // offset and the newest segment would be lost.
        let mut current = self.start.file.clone();
        'files: loop {
            let path = self.binlog_dir.join(&current);
            self.wait_for_file(&path, &process)?;
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            debug!(file = %current, "tailing binlog segment");
            let mut reader = TailReader {
                file: File::open(&path)?,
                cancel: self.cancel.clone(),
                child: process.child(),
                child_done: false,
            };
            check_magic(&mut reader, &process, &self.cancel)?;
            let mut reader = io::BufReader::new(reader);
            let mut events = EventStreamReader::new(BinlogVersion::Version4);
            loop {
                let event = match events.read(&mut reader) {
                    Ok(Some(event)) => event,
                    // EOF only happens after cancellation stops the tail
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        if e.kind() == io::ErrorKind::BrokenPipe {
                            return Err(process.failure());
                        }
                        return Err(ReplicateError::Parse(format!(
                            "while reading {current}: {e}"
                        )));
                    }
                };
                let next_position = u64::from(event.header().log_pos());
                let data = match event.read_data() {
                    Ok(Some(data)) => data,
                    Ok(None) => continue,
                    Err(e) => {
                        return Err(ReplicateError::Parse(format!(
                            "while decoding {current}: {e}"
                        )))
                    }
                };
                match data {
                    EventData::TableMapEvent(map) => {
                        table_maps.insert(map.table_id(), map.into_owned());
                    }
                    EventData::RotateEvent(rotate) => {
                        let file = rotate.name().to_string();
                        if file.is_empty() {
                            continue;
                        }
                        if tx
                            .blocking_send(Ok(RawEvent::Rotate {
                                file: file.clone(),
                                position: rotate.position(),
                            }))
                            .is_err()
                        {
                            return Ok(());
                        }
                        // A rotate naming a new segment means the dump is now
                        // writing that local file; switch the tail over.
                        if file != current {
                            current = file;
                            continue 'files;
                        }
                    }
                    EventData::RowsEvent(rows) => {
                        // Resuming mid-file: the dump replays the segment from
                        // its start, so drop everything at or before the
                        // committed offset.
                        if current == self.start.file
                            && next_position <= self.start.position
                        {
                            continue;
                        }
                        let table_map =
                            table_maps.get(&rows.table_id()).ok_or_else(|| {
                                ReplicateError::Parse(format!(
                                    "rows event without table map (table id {})",
                                    rows.table_id()
                                ))
                            })?;
                        let normalized =
                            normalize_rows_event(&rows, table_map, next_position)?;
                        if tx.blocking_send(Ok(RawEvent::Rows(normalized))).is_err() {
                            return Ok(());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    fn wait_for_file(
        &self,
        path: &Path,
        process: &DumpProcess,
    ) -> Result<(), ReplicateError> {
        loop {
            if path.exists() || self.cancel.is_cancelled() {
                return Ok(());
            }
            if process.exited() {
                // one last check: the file may have appeared just before exit
                if path.exists() {
                    return Ok(());
                }
                return Err(process.failure());
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

fn check_magic(
    reader: &mut TailReader,
    process: &DumpProcess,
    cancel: &CancelFlag,
) -> Result<(), ReplicateError> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic) {
        Ok(()) => {
            if magic == BINLOG_MAGIC {
                Ok(())
            } else {
                Err(ReplicateError::Parse(format!(
                    "bad binlog magic: {magic:02x?}"
                )))
            }
        }
        Err(_) if cancel.is_cancelled() => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Err(process.failure()),
        Err(e) => Err(ReplicateError::Io(e)),
    }
}

/// The running `mysqlbinlog --stop-never` child. Dropping the guard sends
/// SIGTERM, waits briefly, then SIGKILLs, so the remote dump connection is
/// released on every exit path.
struct DumpProcess {
    child: Arc<Mutex<Child>>,
}

impl DumpProcess {
    fn spawn(
        binary: &Path,
        mysql: &MysqlConfig,
        binlog_dir: &Path,
        file: &str,
    ) -> Result<Self, ReplicateError> {
        let mut command = Command::new(binary);
        command
            .env("LC_ALL", "C")
            .arg("--host")
            .arg(&mysql.host)
            .arg("--port")
            .arg(mysql.port.to_string());
        if let Some(socket) = &mysql.socket {
            command.arg("--socket").arg(socket);
        }
        let credentials = mysql.credentials(Role::ReplicationSlave);
        if let Some(user) = &credentials.user {
            command.arg("--user").arg(user);
        }
        if let Some(password) = &credentials.password {
            command.arg(format!("--password={password}"));
        }
        command
            .arg("--read-from-remote-server")
            .arg("--stop-never")
            .arg("--raw")
            .arg(format!("--result-file={}/", binlog_dir.display()))
            .arg(file)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        let child = command.spawn()?;
        Ok(DumpProcess {
            child: Arc::new(Mutex::new(child)),
        })
    }

    fn child(&self) -> Arc<Mutex<Child>> {
        Arc::clone(&self.child)
    }

    fn lock(&self) -> MutexGuard<'_, Child> {
        match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn exited(&self) -> bool {
        matches!(self.lock().try_wait(), Ok(Some(_)))
    }

    fn failure(&self) -> ReplicateError {
        let mut child = self.lock();
        let status = child
            .try_wait()
            .ok()
            .flatten()
            .and_then(|status| status.code())
            .unwrap_or(-1);
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }
        ReplicateError::Subprocess {
            status,
            stderr: stderr.trim().to_string(),
        }
    }
}

impl Drop for DumpProcess {
    fn drop(&mut self) {
        let mut child = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        #[cfg(unix)]
        {
            let pid = child.id() as i32;
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
            let deadline = std::time::Instant::now() + TERMINATE_GRACE;
            while std::time::Instant::now() < deadline {
                if matches!(child.try_wait(), Ok(Some(_))) {
                    return;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            info!("mysqlbinlog did not exit after SIGTERM, killing");
        }
        let _ = child.kill();
        let _ = child.wait();
    }
}

/// Blocking reader over a binlog file the dump process is still appending
/// to. At end of data it polls for growth instead of reporting EOF; real EOF
/// (`Ok(0)`) is reported only after cancellation, and a dead writer surfaces
/// as `BrokenPipe` once the trailing bytes are drained.
struct TailReader {
    file: File,
    cancel: CancelFlag,
    child: Arc<Mutex<Child>>,
    child_done: bool,
}

impl TailReader {
    fn child_exited(&self) -> bool {
        let mut child = match self.child.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        matches!(child.try_wait(), Ok(Some(_)))
    }
}

impl Read for TailReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = self.file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if self.cancel.is_cancelled() {
                return Ok(0);
            }
            if self.child_done {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "binlog dump process exited",
                ));
            }
            if self.child_exited() {
                // drain whatever was flushed before the writer died
                self.child_done = true;
                continue;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// The binlog segment to hand to the dump tool: walk forward from the
/// committed file through segments already downloaded, so a restart does not
/// re-fetch files it has.
fn resume_file(binlog_dir: &Path, start_file: &str) -> String {
    let mut current = start_file.to_string();
    while let Some(next) = next_binlog_file(&current) {
        if !binlog_dir.join(&next).exists() {
            break;
        }
        current = next;
    }
    current
}

/// `mysql-bin.000012` → `mysql-bin.000013`, preserving the suffix width.
fn next_binlog_file(file: &str) -> Option<String> {
    let (base, suffix) = file.rsplit_once('.')?;
    let number: u64 = suffix.parse().ok()?;
    Some(format!(
        "{base}.{:0width$}",
        number + 1,
        width = suffix.len()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_next_binlog_file_preserves_width() {
        assert_eq!(
            next_binlog_file("mysql-bin.000012").as_deref(),
            Some("mysql-bin.000013")
        );
        assert_eq!(
            next_binlog_file("mysql-bin.000999").as_deref(),
            Some("mysql-bin.001000")
        );
        assert_eq!(next_binlog_file("mysql-bin").as_deref(), None);
        assert_eq!(next_binlog_file("mysql-bin.index").as_deref(), None);
    }

    #[tokio::test]
    async fn test_tail_restarts_at_committed_file_not_newest_segment() {
        let binlog_dir = tempdir().unwrap();
        // committed segment is damaged, a newer contiguous segment looks fine
        fs::write(binlog_dir.path().join("mysql-bin.000001"), b"XXXX").unwrap();
        fs::write(binlog_dir.path().join("mysql-bin.000002"), BINLOG_MAGIC).unwrap();

        let config_dir = tempdir().unwrap();
        fs::write(config_dir.path().join("config.yaml"), "mysql: {}\n").unwrap();
        let config = crate::config::Config::load(config_dir.path()).unwrap();

        // a stand-in child that exits immediately, so the tail drains what is
        // on disk instead of waiting for growth
        let producer = Producer {
            binary: which::which("true").unwrap(),
            mysql: config.mysql,
            binlog_dir: binlog_dir.path().to_path_buf(),
            start: BinlogPosition {
                file: "mysql-bin.000001".into(),
                position: 4,
            },
            cancel: CancelFlag::new(),
        };
        let (tx, mut rx) = mpsc::channel(8);
        tokio::task::spawn_blocking(move || producer.run(tx));

        // decoding must begin with the committed segment, so its bad magic
        // is what surfaces; reading the newer segment first would not fail
        // this way
        match rx.recv().await.expect("producer reports an error") {
            Err(ReplicateError::Parse(message)) => {
                assert!(message.contains("bad binlog magic"), "got {message}");
            }
            other => panic!("expected a bad-magic error, got {other:?}"),
        }
    }

    #[test]
    fn test_resume_file_walks_contiguous_segments() {
        let dir = tempdir().unwrap();
        for name in ["mysql-bin.000002", "mysql-bin.000003", "mysql-bin.000005"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        // walks 2 -> 3, stops at missing 4
        assert_eq!(
            resume_file(dir.path(), "mysql-bin.000002"),
            "mysql-bin.000003"
        );
        // nothing after 5 exists
        assert_eq!(
            resume_file(dir.path(), "mysql-bin.000005"),
            "mysql-bin.000005"
        );
        // start segment itself need not exist locally yet
        assert_eq!(
            resume_file(dir.path(), "mysql-bin.000009"),
            "mysql-bin.000009"
        );
    }
}
