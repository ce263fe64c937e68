use anyhow::Context as _;
use clap::Parser;
use stagehand_core::config::OrchestratorConfig;
use stagehand_core::context::Context;
use stagehand_server::controller::{Controller, WorkQueue};
use stagehand_server::state::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "stagehand",
    about = "Run test workflows against a system under test and watch it through Grafana",
    version
)]
struct Cli {
    /// Orchestrator config file (YAML). Defaults apply when omitted.
    #[arg(long, env = "STAGEHAND_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding `server.bind`.
    #[arg(long)]
    bind: Option<String>,

    /// Namespace to resync at startup, overriding `namespace`.
    #[arg(long)]
    namespace: Option<String>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long, short = 'v')]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::load(path)
            .with_context(|| format!("cannot load config from {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let bind = config.server.bind.clone();
        let ctx = Arc::new(Context::in_memory(config, shutdown_rx.clone())?);
        let queue = WorkQueue::new();

        let controller = tokio::spawn(Controller::new(ctx.clone(), queue.clone()).run());

        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("cannot bind {bind}"))?;

        let mut server_shutdown = shutdown_rx;
        let served = stagehand_server::serve_on(listener, AppState::new(ctx, queue), async move {
            let _ = server_shutdown.changed().await;
        });
        tokio::pin!(served);

        let finished = tokio::select! {
            res = &mut served => Some(res),
            _ = tokio::signal::ctrl_c() => None,
        };
        let result = match finished {
            Some(res) => res,
            None => {
                tracing::info!("shutting down");
                let _ = shutdown_tx.send(true);
                served.await
            }
        };
        let _ = shutdown_tx.send(true);
        controller.await??;
        result?;
        Ok::<(), anyhow::Error>(())
    })
}
