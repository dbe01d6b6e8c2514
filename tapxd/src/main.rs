use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tapx_core::config::{load_config, Config, SessionMode};
use tapx_core::models::Mock;
use tapx_core::observability::{init_logging, start_metrics};
use tapx_core::storage::{InMemoryMockStore, MockReader, MockWriter, SessionWriter};
use tapxd::{conn, net, proxy, runtime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tapxd", about = "tapx record/replay proxy daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run {
        #[arg(short, long)]
        config: PathBuf,
    },
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config } => run_with_runtime(config),
        Command::Check { config } => check(config),
    }
}

fn run_with_runtime(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder
        .worker_threads(net::worker_threads(&config.runtime))
        .max_blocking_threads(net::max_blocking_threads(&config.runtime))
        .enable_all();
    let rt = builder.build()?;
    rt.block_on(run(config))
}

/// Writer used by `check`: state construction needs one, nothing is written.
struct DiscardMockWriter;

#[async_trait]
impl MockWriter for DiscardMockWriter {
    async fn write(&self, _mock: Mock) -> Result<()> {
        Ok(())
    }
}

fn check(path: PathBuf) -> Result<()> {
    let config = load_config(&path)?;
    runtime::RuntimeState::build(config, Arc::new(DiscardMockWriter))?;
    println!("config ok");
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    init_logging(&config.system_log)?;
    if let Some(metrics) = &config.metrics {
        start_metrics(metrics)?;
    }

    let token = CancellationToken::new();
    let session = config.session.name.clone();
    let store = Arc::new(InMemoryMockStore::new());
    let (mock_tx, mut mock_rx) = mpsc::channel(256);
    let writer = Arc::new(SessionWriter::new(session.clone(), mock_tx));
    let state = Arc::new(runtime::RuntimeState::build(config, writer)?);

    if state.mode == SessionMode::Replay {
        // The storage collaborator feeds the store through the MockReader
        // seam; a fresh process starts empty.
        let mocks = store.load(&session).await?;
        if mocks.is_empty() {
            warn!(session = %session, "replay session has no mocks preloaded");
        } else {
            info!(session = %session, count = mocks.len(), "mocks loaded for replay");
        }
        state.mock_db.set_mocks(mocks, Vec::new());
    }

    let collector_store = store.clone();
    let collector_session = session.clone();
    let recorded_metric = state.metric_names.mocks_recorded_total.clone();
    tokio::spawn(async move {
        while let Some(mock) = mock_rx.recv().await {
            metrics::counter!(recorded_metric.clone()).increment(1);
            info!(name = %mock.name, kind = %mock.kind, "mock recorded");
            collector_store.append(&collector_session, mock);
        }
    });

    if let Some(listen) = state.config.factory.event_listen.as_deref() {
        let listen: std::net::SocketAddr = listen.parse()?;
        let (event_tx, event_rx) = mpsc::channel(1_024);
        let (case_tx, mut case_rx) = mpsc::channel(256);
        let settings = conn::FactorySettings {
            mailbox_capacity: state.config.factory.mailbox_capacity,
            silence_flush: std::time::Duration::from_millis(state.config.factory.silence_flush_ms),
            dropped_events_metric: state.metric_names.factory_dropped_events_total.clone(),
            test_cases_metric: state.metric_names.test_cases_emitted_total.clone(),
        };
        tokio::spawn(conn::run_factory(event_rx, case_tx, settings, token.clone()));
        let ingest_token = token.clone();
        tokio::spawn(async move {
            if let Err(err) = conn::ingest::run_event_ingest(listen, event_tx, ingest_token).await {
                warn!(error = format!("{err:#}"), "event ingest failed");
            }
        });
        tokio::spawn(async move {
            while let Some(case) = case_rx.recv().await {
                info!(
                    name = %case.name,
                    method = %case.request.method,
                    path = %case.request.path,
                    status = case.response.status,
                    "test case captured"
                );
            }
        });
    }

    let proxy_state = state.clone();
    let proxy_token = token.clone();
    let mut proxy_task = tokio::spawn(async move { proxy::run(proxy_state, proxy_token).await });

    info!("tapxd started");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            token.cancel();
        }
        joined = &mut proxy_task => {
            token.cancel();
            return match joined {
                Ok(Ok(())) => Err(anyhow!("proxy exited unexpectedly")),
                Ok(Err(err)) => Err(err).context("proxy failed"),
                Err(err) => Err(anyhow!("proxy task failed: {err}")),
            };
        }
    }

    match proxy_task.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(err).context("proxy failed during shutdown"),
        Err(err) => return Err(anyhow!("proxy task failed: {err}")),
    }

    if state.mode == SessionMode::Replay {
        let consumed = state.mock_db.consumed_names();
        info!(count = consumed.len(), consumed = ?consumed, "mocks consumed this run");
    }
    info!("tapxd stopped");
    Ok(())
}
