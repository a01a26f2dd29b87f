//! # doco-cd daemon
//!
//! Startup wiring: configuration, tracing, metrics, the engine connection,
//! the poll loops, and the two HTTP servers (triggers + metrics). The
//! `healthcheck` subcommand exists for container HEALTHCHECK directives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use doco_cd::config::{load_poll_configs, AppConfig};
use doco_cd::constants;
use doco_cd::engine::docker::DockerCli;
use doco_cd::engine::ContainerEngine;
use doco_cd::observability::metrics;
use doco_cd::reconciler::Reconciler;
use doco_cd::secrets::{EnvResolver, NoopResolver, SecretResolver};
use doco_cd::server::{self, AppState};

#[derive(Parser)]
#[command(name = "doco-cd", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Probe the local daemon's health endpoint (for container healthchecks)
    Healthcheck {
        #[arg(long, env = "HTTP_PORT", default_value_t = constants::DEFAULT_HTTP_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Healthcheck { port }) = cli.command {
        return healthcheck(port).await;
    }

    let config = AppConfig::from_env().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(format!("doco_cd={}", config.log_level))
            }),
        )
        .init();

    info!(
        version = constants::APP_VERSION,
        build = env!("BUILD_GIT_HASH"),
        built_at = env!("BUILD_DATETIME"),
        "starting doco-cd"
    );

    metrics::register_metrics(constants::APP_VERSION).context("failed to register metrics")?;

    let engine = Arc::new(
        DockerCli::connect()
            .await
            .context("failed to connect to the container engine")?,
    );
    let swarm = engine.swarm_manager().await.unwrap_or(false);
    info!(swarm, "container engine connected");

    let resolver: Arc<dyn SecretResolver> = match config.external_secrets_provider.as_str() {
        "env" => Arc::new(EnvResolver),
        _ => Arc::new(NoopResolver),
    };

    let cancel = CancellationToken::new();
    let reconciler = Arc::new(Reconciler::new(
        config.clone(),
        engine,
        resolver,
        cancel.clone(),
    ));

    // Periodic cleanup of idle locks and limiter entries
    {
        let reconciler = Arc::clone(&reconciler);
        let cancel = cancel.clone();
        let ttl = Duration::from_secs(config.lock_timeout_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ttl);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        reconciler.locks.cleanup();
                        reconciler.limiter.cleanup();
                    }
                    () = cancel.cancelled() => return,
                }
            }
        });
    }

    if let Some(path) = &config.poll_config_file {
        let poll_configs = load_poll_configs(path).context("failed to load poll config")?;
        info!(count = poll_configs.len(), "poll configs loaded");
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(doco_cd::poll::run_poll_loops(reconciler, poll_configs));
    }

    {
        let cancel = cancel.clone();
        let port = config.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = server::serve_metrics(cancel, port).await {
                error!(error = %e, "metrics server failed");
            }
        });
    }

    // Shutdown: first signal cancels in-flight work and stops the servers
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    let state = Arc::new(AppState {
        reconciler: Arc::clone(&reconciler),
    });
    server::serve(state, config.http_port).await?;

    reconciler.resolver.close().await;
    info!("daemon stopped");
    Ok(())
}

async fn healthcheck(port: u16) -> Result<()> {
    let url = format!("http://127.0.0.1:{port}/v1/health");
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .with_context(|| format!("health request to {url} failed"))?;
    if response.status().is_success() {
        println!("healthy");
        Ok(())
    } else {
        anyhow::bail!("unhealthy: {}", response.status())
    }
}
