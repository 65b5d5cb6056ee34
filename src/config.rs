// ABOUTME: Configuration loading for config.yaml and secret.yaml
// ABOUTME: Resolves per-role MySQL credentials, checksum mode and backend selection

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mysql_async::{Opts, OptsBuilder};
use serde::Deserialize;

use crate::error::ReplicateError;
use crate::mapping::{Mapping, MappingSpec};

const CONFIG_FILE: &str = "config.yaml";
const SECRET_FILE: &str = "secret.yaml";
const DEFAULT_POLLING_INTERVAL: u64 = 60;
const DEFAULT_SERVER_ID: u32 = 65535;

/// Which credential set a connection should authenticate with. The three
/// roles are independent so each can be granted only the privileges it needs:
/// `ReplicationClient` runs the status query that bootstraps the offset,
/// `ReplicationSlave` opens the binlog stream, `Select` reads
/// `information_schema` for schema lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    ReplicationClient,
    ReplicationSlave,
    Select,
}

/// Event source strategy. `Replication` streams the binlog straight off a
/// replication-protocol connection; `Mysqlbinlog` spawns the dump tool and
/// tails its local output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    Replication,
    Mysqlbinlog,
}

impl Backend {
    fn parse(value: &str) -> Result<Self, ReplicateError> {
        match value {
            "replication" => Ok(Backend::Replication),
            "mysqlbinlog" => Ok(Backend::Mysqlbinlog),
            other => Err(ReplicateError::Configuration(format!(
                "unknown backend: {other} (expected \"replication\" or \"mysqlbinlog\")"
            ))),
        }
    }
}

/// Checksum algorithm the source appends to each binlog event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumMode {
    #[default]
    None,
    Crc32,
}

impl ChecksumMode {
    /// Value announced through the `@master_binlog_checksum` session
    /// variable before the binlog stream is requested.
    pub fn master_value(&self) -> &'static str {
        match self {
            ChecksumMode::None => "NONE",
            ChecksumMode::Crc32 => "CRC32",
        }
    }

    fn parse(value: &str) -> Result<Self, ReplicateError> {
        match value {
            "none" => Ok(ChecksumMode::None),
            "crc32" => Ok(ChecksumMode::Crc32),
            other => Err(ReplicateError::Configuration(format!(
                "unknown checksum mode: {other} (expected \"none\" or \"crc32\")"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Resolved MySQL connection settings.
#[derive(Debug, Clone)]
pub struct MysqlConfig {
    pub host: String,
    pub port: u16,
    pub socket: Option<String>,
    pub checksum: ChecksumMode,
    pub server_id: u32,
    pub backend: Backend,
    replication_client: Credentials,
    replication_slave: Credentials,
    select: Credentials,
}

impl MysqlConfig {
    pub fn credentials(&self, role: Role) -> &Credentials {
        match role {
            Role::ReplicationClient => &self.replication_client,
            Role::ReplicationSlave => &self.replication_slave,
            Role::Select => &self.select,
        }
    }

    /// Connection options for the given credential role.
    pub fn opts(&self, role: Role) -> Opts {
        let credentials = self.credentials(role);
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(credentials.user.clone())
            .pass(credentials.password.clone());
        if let Some(socket) = &self.socket {
            builder = builder.socket(Some(socket.clone()));
        }
        Opts::from(builder)
    }

    fn resolve(config: RawMysql, secret: RawMysql) -> Result<Self, ReplicateError> {
        let checksum = match config.checksum.as_deref() {
            Some(value) => ChecksumMode::parse(value)?,
            None => ChecksumMode::None,
        };
        let backend = match config.backend.as_deref() {
            Some(value) => Backend::parse(value)?,
            None => Backend::Replication,
        };
        let server_id = config.server_id.unwrap_or(DEFAULT_SERVER_ID);
        if server_id == 0 {
            return Err(ReplicateError::Configuration(
                "server_id must not be 0".into(),
            ));
        }
        let role = |section: &Option<RawCredentials>, fallback: &RawMysql| {
            let section = section.as_ref();
            Credentials {
                user: section
                    .and_then(|c| c.user.clone())
                    .or_else(|| fallback.user.clone()),
                password: section
                    .and_then(|c| c.password.clone())
                    .or_else(|| fallback.password.clone()),
            }
        };
        // Passwords from secret.yaml take precedence over config.yaml.
        let merge = |from_config: &Option<RawCredentials>,
                     from_secret: &Option<RawCredentials>| {
            let public = role(from_config, &config);
            let hidden = role(from_secret, &secret);
            Credentials {
                user: public.user,
                password: hidden.password.or(public.password),
            }
        };
        let replication_client =
            merge(&config.replication_client, &secret.replication_client);
        let replication_slave =
            merge(&config.replication_slave, &secret.replication_slave);
        let select = merge(&config.select, &secret.select);
        Ok(MysqlConfig {
            host: config.host.unwrap_or_else(|| "localhost".to_string()),
            port: config.port.unwrap_or(3306),
            socket: config.socket,
            checksum,
            server_id,
            backend,
            replication_client,
            replication_slave,
            select,
        })
    }
}

/// Fully loaded and validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mysql: MysqlConfig,
    pub mapping: Mapping,
    pub binlog_dir: PathBuf,
    pub polling_interval: Duration,
}

impl Config {
    /// Loads `config.yaml` (required) and `secret.yaml` (optional) from
    /// `dir`, compiles the mapping, and validates every selector.
    pub fn load(dir: &Path) -> Result<Self, ReplicateError> {
        let config_path = dir.join(CONFIG_FILE);
        let raw = read_document(&config_path)?.ok_or_else(|| {
            ReplicateError::Configuration(format!("{} not found", config_path.display()))
        })?;
        let secret = read_document(&dir.join(SECRET_FILE))?.unwrap_or_default();

        let mysql = MysqlConfig::resolve(
            raw.mysql.unwrap_or_default(),
            secret.mysql.unwrap_or_default(),
        )?;
        let mapping = Mapping::from_spec(&raw.mapping.unwrap_or_default())?;
        let binlog_dir = dir.join(raw.binlog_dir.as_deref().unwrap_or("binlog"));
        let polling_interval = Duration::from_secs(
            raw.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL),
        );
        Ok(Config {
            mysql,
            mapping,
            binlog_dir,
            polling_interval,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    mysql: Option<RawMysql>,
    mapping: Option<MappingSpec>,
    binlog_dir: Option<String>,
    polling_interval: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMysql {
    host: Option<String>,
    port: Option<u16>,
    socket: Option<String>,
    user: Option<String>,
    password: Option<String>,
    replication_client: Option<RawCredentials>,
    replication_slave: Option<RawCredentials>,
    select: Option<RawCredentials>,
    checksum: Option<String>,
    server_id: Option<u32>,
    backend: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCredentials {
    user: Option<String>,
    password: Option<String>,
}

fn read_document(path: &Path) -> Result<Option<RawConfig>, ReplicateError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    let raw = serde_yaml::from_str(&contents).map_err(|e| {
        ReplicateError::Configuration(format!("unreadable {}: {e}", path.display()))
    })?;
    Ok(Some(raw))
}
