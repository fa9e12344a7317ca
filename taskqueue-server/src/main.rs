//! taskqueue dispatcher daemon.
//!
//! Loads the INI configuration, connects the configured broker backend,
//! runs one supervised dispatch loop per queue, and serves the
//! administrative HTTP surface with `/metrics`.

mod api;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use prometheus::Registry;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use taskqueue::{
    Backend, BackendKind, DispatchLoop, EventSink, QueueConfig, ServerConfig, TaskQueueError,
};
use taskqueue_amqp::AmqpBackend;
use taskqueue_prometheus::PrometheusSink;
use taskqueue_redis::RedisBackend;

/// Admin surface and metrics listen here.
const LISTEN_ADDR: &str = "0.0.0.0:12345";

/// Breather between a dispatch loop dying and its restart.
const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "taskqueue-server", about = "Rate-limited, retrying webhook dispatcher")]
struct Args {
    /// Path to the INI configuration file.
    #[arg(
        long,
        env = "TASKQUEUE_CONFIG_FILE",
        default_value = "/etc/taskqueue/taskqueue.ini"
    )]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), TaskQueueError> {
    let config = ServerConfig::load(&args.config)?;

    let registry = Arc::new(Registry::new());
    let sink: Arc<dyn EventSink> = Arc::new(
        PrometheusSink::new(registry.clone())
            .map_err(|e| TaskQueueError::Config(format!("cannot register metrics: {e}")))?,
    );

    let mut sweepers = Vec::new();
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Amqp => {
            let mut backend = AmqpBackend::new(&config.server);
            backend.connect().await?;
            Arc::new(backend)
        }
        BackendKind::Redis => {
            let mut backend =
                RedisBackend::new(&config.server, config.tombstone_duration());
            backend.connect().await?;
            for queue in &config.queues {
                sweepers.push(backend.spawn_sweeper(&queue.name)?);
            }
            Arc::new(backend)
        }
    };
    tracing::info!(
        backend = config.backend.as_str(),
        queues = config.queues.len(),
        "connected to broker"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisors = Vec::new();
    for queue in config.queues.clone() {
        supervisors.push(tokio::spawn(supervise(
            queue,
            Arc::clone(&backend),
            Arc::clone(&sink),
            shutdown_rx.clone(),
        )));
    }

    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR)
        .await
        .map_err(|e| TaskQueueError::Config(format!("cannot bind {LISTEN_ADDR}: {e}")))?;
    tracing::info!(addr = LISTEN_ADDR, "admin surface listening");

    axum::serve(listener, api::router(registry))
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .map_err(|e| TaskQueueError::Unavailable(format!("admin surface failed: {e}")))?;

    for supervisor in supervisors {
        let _ = supervisor.await;
    }
    for sweeper in sweepers {
        sweeper.abort();
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
}

/// Keep one queue's dispatch loop alive: a loop whose channel dies gets a
/// fresh channel after a short delay, until shutdown.
async fn supervise(
    queue: QueueConfig,
    backend: Arc<dyn Backend>,
    sink: Arc<dyn EventSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        match backend.get_channel().await {
            Ok(channel) => {
                let dispatch =
                    DispatchLoop::new(queue.clone(), channel).with_sink(Arc::clone(&sink));
                tokio::select! {
                    result = dispatch.run() => match result {
                        Ok(()) => {
                            tracing::warn!(queue = %queue.name, "consumer stream ended");
                        }
                        Err(e) => {
                            tracing::error!(queue = %queue.name, error = %e, "dispatch loop failed");
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            }
            Err(e) => {
                tracing::error!(queue = %queue.name, error = %e, "cannot open channel");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RESTART_DELAY) => {}
        }
    }
}
