// ABOUTME: CLI entry point for the binlog to Groonga replicator
// ABOUTME: Runs one import pass, or loops forever in server mode retrying transport failures

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use mysql_async::Pool;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use groonga_replicator::config::{Config, Role};
use groonga_replicator::importer::{self, Importer};
use groonga_replicator::schema::SchemaCache;
use groonga_replicator::source::{self, EventSource};
use groonga_replicator::state::ReplicationState;
use groonga_replicator::ReplicateError;

#[derive(Parser)]
#[command(
    name = "groonga-replicator",
    about = "Streams MySQL binlog row changes as Groonga load/delete commands"
)]
struct Cli {
    /// Directory holding config.yaml, secret.yaml, status.yaml and binlog files
    #[arg(long, default_value = ".")]
    dir: PathBuf,

    /// Keep running: retry transport failures after the polling interval
    #[arg(long)]
    server: bool,

    /// Log level filter, used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands go to stdout, so all diagnostics go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&cli.log)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load(&cli.dir)
        .with_context(|| format!("loading configuration from {}", cli.dir.display()))?;

    loop {
        match run_import_pass(&cli.dir, &config).await {
            Ok(()) => {
                if !cli.server {
                    return Ok(());
                }
                info!("import pass ended");
            }
            Err(e) if cli.server && e.is_retryable() => {
                warn!(error = %e, interval = ?config.polling_interval, "import pass failed, retrying");
            }
            Err(e) => return Err(e).context("import pass failed"),
        }
        tokio::time::sleep(config.polling_interval).await;
    }
}

async fn run_import_pass(dir: &Path, config: &Config) -> Result<(), ReplicateError> {
    let state = ReplicationState::load(dir)?;
    let start = importer::resolve_start_position(&config.mysql, &state).await?;
    info!(file = %start.file, position = start.position, "import pass starting");

    let mut events = source::open(&config.mysql, &config.binlog_dir, &start).await?;
    let pool = Pool::new(config.mysql.opts(Role::Select));
    let schema = SchemaCache::new(pool.clone());
    let mut importer = Importer::new(
        config.mapping.clone(),
        schema,
        state,
        std::io::stdout().lock(),
    );

    let result = importer.run(start, &mut events).await;
    events.cancel();
    let _ = pool.disconnect().await;
    result
}
