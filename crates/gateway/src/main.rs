use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use tm_domain::config::{Config, ConfigSeverity, DispatchMode};
use tm_executor::manager::{manager_router, ExecutorService, ManagerState};
use tm_executor::{DockerExecutor, HeartbeatChecker, QueueConsumer, Scheduler, TaskApiClient};
use tm_gateway::api;
use tm_gateway::api::internal::LocalStatusSink;
use tm_gateway::bootstrap::run_bootstrap;
use tm_gateway::data::{DataService, HttpDataService};
use tm_gateway::push;
use tm_gateway::state::AppState;
use tm_state::QueueType;

#[derive(Parser)]
#[command(name = "taskmesh", about = "Control plane for an AI-agent platform")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "taskmesh.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Validate the configuration and exit.
    ConfigValidate,
    /// Print the effective configuration and exit.
    ConfigShow,
    /// Print the version and exit.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = Config::load(&cli.config).context("loading configuration")?;
            run_server(Arc::new(config)).await
        }
        Some(Command::ConfigValidate) => {
            let config = Config::load(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                println!("{:?}: {issue}", issue.severity);
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::ConfigShow) => {
            let config = Config::load(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("taskmesh {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve command.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tm_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("taskmesh starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Data service ─────────────────────────────────────────────────
    let data: Arc<dyn DataService> = Arc::new(
        HttpDataService::new(
            &config.executors.data_service_url,
            &config.auth.internal_token,
        )
        .context("creating data service client")?,
    );
    tracing::info!(url = %config.executors.data_service_url, "data service client ready");

    // ── Application state ────────────────────────────────────────────
    let state = AppState::build(config.clone(), data).context("building application state")?;
    match state.store.ping().await {
        Ok(()) => tracing::info!("redis reachable"),
        Err(e) => tracing::warn!(error = %e, "redis unreachable at startup"),
    }

    // ── Startup bootstrap (one replica only) ─────────────────────────
    if let Err(e) = run_bootstrap(&state.store, &state.locks, || async { Ok(()) }).await {
        tracing::warn!(error = %e, "startup bootstrap incomplete");
    }

    let shutdown = CancellationToken::new();

    // ── Push-mode dispatcher ─────────────────────────────────────────
    if config.queue.dispatch_mode == DispatchMode::Push {
        let push_state = state.clone();
        let push_shutdown = shutdown.clone();
        tokio::spawn(async move { push::run_push_dispatcher(push_state, push_shutdown).await });
    }

    // ── Embedded executor manager ────────────────────────────────────
    let mut router = api::router(state.clone());
    if config.executors.embedded_manager {
        let manager = start_embedded_manager(&state, &config, shutdown.clone())
            .context("starting embedded executor manager")?;
        router = router.nest("/executor-manager", manager);
        tracing::info!("embedded executor manager ready");
    }

    // ── Serve ────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "gateway listening");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            serve_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    Ok(())
}

/// Wire the worker-side components into this process: Docker executor,
/// queue consumers, heartbeat scanner, scheduler, and the manager API.
fn start_embedded_manager(
    state: &AppState,
    config: &Arc<Config>,
    shutdown: CancellationToken,
) -> anyhow::Result<axum::Router> {
    let executor = Arc::new(
        DockerExecutor::connect(config.docker.clone(), config.executors.clone())
            .context("connecting to docker")?,
    );
    let service = Arc::new(ExecutorService::new(executor, state.tracker.clone()));
    let sink = Arc::new(LocalStatusSink::new(state.clone()));

    // Queue consumers (push mode drains; pull mode fetches instead).
    if config.queue.dispatch_mode == DispatchMode::Push {
        for (queue, queue_type) in [
            (state.online_queue.clone(), QueueType::Online),
            (state.offline_queue.clone(), QueueType::Offline),
        ] {
            let consumer = QueueConsumer::new(
                queue,
                queue_type,
                service.clone(),
                sink.clone(),
                config.queue.clone(),
            );
            let consumer_shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(consumer_shutdown).await });
        }
    }

    // Heartbeat scanner + pull-mode fetcher.
    let checker = Arc::new(HeartbeatChecker::new(
        state.tracker.clone(),
        state.heartbeats.clone(),
        state.locks.clone(),
        service.clone(),
        sink.clone(),
        config.heartbeat.clone(),
    ));
    let api_client = Arc::new(TaskApiClient::new(
        &config.executors.task_api_domain,
        &config.auth.internal_token,
    )?);
    Arc::new(Scheduler::new(
        config.queue.clone(),
        service.clone(),
        api_client,
        checker,
    ))
    .start(shutdown);

    Ok(manager_router(ManagerState {
        service,
        dispatch_mode: config.queue.dispatch_mode,
        online_queue: state.online_queue.clone(),
        offline_queue: state.offline_queue.clone(),
        internal_token: config.auth.internal_token.clone(),
    }))
}
