//! # quire-sync server
//!
//! ```text
//! quire-sync --config quire.toml
//! quire-sync --bind 0.0.0.0:9090 --storage ./data
//! quire-sync --config quire.toml --issue-token alice --ttl 3600
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use quire_sync::auth::HmacTokenVerifier;
use quire_sync::server::ServerError;
use quire_sync::{HealthStatus, ServerConfig, SyncServer, UserId};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "quire-sync")]
#[command(about = "Real-time collaborative document sync server")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    bind: Option<String>,

    /// RocksDB directory, overrides the config file
    #[arg(long)]
    storage: Option<PathBuf>,

    /// Print a token for this user and exit
    #[arg(long, value_name = "USER")]
    issue_token: Option<String>,

    /// Token lifetime in seconds, used with --issue-token
    #[arg(long, default_value_t = 24 * 3600)]
    ttl: u64,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(storage) = cli.storage {
        config.storage_path = Some(storage);
    }

    if let Some(user) = cli.issue_token {
        let verifier = HmacTokenVerifier::new(&config.token_secret)?;
        println!("{}", verifier.issue_for(&UserId::new(user), cli.ttl));
        return Ok(());
    }

    let server = Arc::new(SyncServer::new(config)?);
    let mut serving = tokio::spawn(server.clone().run());
    let mut health = tokio::time::interval(HEALTH_LOG_INTERVAL);

    loop {
        tokio::select! {
            result = &mut serving => {
                return match result {
                    Ok(result) => result,
                    Err(e) => {
                        log::error!("Server task failed: {e}");
                        Ok(())
                    }
                };
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Interrupt received");
                break;
            }
            _ = health.tick() => {
                let report = server.health().await;
                let line = format!(
                    "{} documents, {} sessions, up {}s, {} saves ({} failed)",
                    report.active_document_count,
                    report.total_session_count,
                    report.uptime.as_secs(),
                    report.persistence.saves,
                    report.persistence.failed_saves,
                );
                match report.status {
                    HealthStatus::Ok => log::info!("Healthy: {line}"),
                    HealthStatus::Degraded => log::warn!("Degraded: {line}"),
                    HealthStatus::ShuttingDown => log::info!("Shutting down: {line}"),
                }
            }
        }
    }

    let report = server.shutdown().await;
    log::info!(
        "Flushed {} documents ({} clean, {} failed)",
        report.flushed,
        report.clean,
        report.failed.len()
    );
    match serving.await {
        Ok(result) => result,
        Err(e) => {
            log::error!("Server task failed: {e}");
            Ok(())
        }
    }
}
