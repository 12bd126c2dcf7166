//! Run command implementation

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};
use anyhow::Context;
use dsc_common::types::TransferId;
use dsc_transfer::config::USER_AGENT;
use dsc_transfer::{
    DefaultAdapters, HttpCallbackObserver, LogObserver, Observers, SessionOutcome,
    TransferDescriptor, TransferError, TransferObserver, TransferWorkerPool,
};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What one `run` invocation did.
#[derive(Debug, Default)]
pub struct RunReport {
    /// Transfers resumed by startup reconciliation
    pub recovered: Vec<TransferId>,
    /// Transfers admitted from descriptor files
    pub started: Vec<TransferId>,
    /// Descriptors naming an already admitted transfer
    pub skipped: Vec<TransferId>,
    pub rejected: Vec<(PathBuf, String)>,
    pub outcomes: Vec<(TransferId, dsc_transfer::Result<SessionOutcome>)>,
    /// A shutdown signal arrived before all transfers finished
    pub interrupted: bool,
}

pub async fn run(config: &ConnectorConfig, descriptors: &[PathBuf]) -> Result<()> {
    let report = execute(config, descriptors, shutdown_signal()).await?;

    for (path, reason) in &report.rejected {
        eprintln!("Rejected {}: {}", path.display(), reason);
    }
    for (id, outcome) in &report.outcomes {
        println!("{}: {}", id, describe(outcome));
    }
    if report.interrupted {
        println!("Interrupted; paused transfers resume on the next run.");
    }

    if !report.rejected.is_empty() {
        return Err(anyhow::anyhow!(
            "{} descriptor file(s) could not be started",
            report.rejected.len()
        )
        .into());
    }
    Ok(())
}

/// Reconcile, start `descriptors` and wait for every worker. `shutdown`
/// resolving pauses all transfers at their next chunk boundary.
pub async fn execute<F>(
    config: &ConnectorConfig,
    descriptors: &[PathBuf],
    shutdown: F,
) -> Result<RunReport>
where
    F: Future<Output = ()> + Send + 'static,
{
    let client = reqwest::Client::builder()
        .connect_timeout(config.transfer.http_connect_timeout())
        .user_agent(USER_AGENT)
        .build()
        .context("Failed to build callback HTTP client")?;

    let mut observers: Vec<Arc<dyn TransferObserver>> = vec![Arc::new(LogObserver)];
    if let Some(ref url) = config.callback_url {
        info!(url = %url, "Forwarding transfer events to control plane");
        observers.push(Arc::new(HttpCallbackObserver::new(client, url.clone())));
    }

    let (store, manager) = super::open_manager(config, Arc::new(Observers(observers))).await?;
    let adapters = DefaultAdapters::new(&config.transfer)?;
    let pool = TransferWorkerPool::new(manager, Arc::new(adapters), &config.transfer);

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let watcher = tokio::spawn({
        let pool = pool.clone();
        async move {
            shutdown.await;
            stop_tx.send_replace(true);
            pool.pause_all().await;
        }
    });

    let mut report = RunReport::default();

    let delay = config.reconcile_delay();
    if !delay.is_zero() {
        info!(delay_secs = delay.as_secs(), "Waiting before startup reconciliation");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = stop_rx.changed() => {},
        }
    }

    if !*stop_rx.borrow() {
        report.recovered = pool.recover().await?;

        for path in descriptors {
            match start(&pool, path).await {
                Ok(id) => report.started.push(id),
                Err(ConnectorError::Transfer(TransferError::AlreadyExists(id))) => {
                    info!(transfer_id = %id, path = %path.display(), "Transfer already admitted");
                    report.skipped.push(id);
                },
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Failed to start transfer");
                    report.rejected.push((path.clone(), e.to_string()));
                },
            }
        }

        // Workers spawned after the watcher fired have not seen the pause.
        if *stop_rx.borrow() {
            pool.pause_all().await;
        }
    }

    report.outcomes = pool.join_all().await;
    report.interrupted = *stop_rx.borrow();
    watcher.abort();
    store.close().await;

    let resumable = report
        .outcomes
        .iter()
        .filter(|(_, outcome)| matches!(outcome, Ok(o) if o.is_resumable()))
        .count();
    info!(
        finished = report.outcomes.len(),
        resumable,
        interrupted = report.interrupted,
        "All transfer workers finished"
    );

    Ok(report)
}

async fn start(pool: &TransferWorkerPool, path: &Path) -> Result<TransferId> {
    let descriptor: TransferDescriptor = super::read_json(path).await?;
    Ok(pool.start(descriptor).await?)
}

fn describe(outcome: &dsc_transfer::Result<SessionOutcome>) -> String {
    match outcome {
        Ok(SessionOutcome::Completed { bytes }) => format!("completed ({bytes} bytes)"),
        Ok(SessionOutcome::Paused { offset }) => format!("paused at offset {offset}"),
        Ok(SessionOutcome::Abandoned { offset }) => format!("abandoned at offset {offset}"),
        Ok(SessionOutcome::Failed(cause)) => format!("failed: {cause}"),
        Ok(SessionOutcome::AwaitingEndpoint) => {
            "waiting for an endpoint reference refresh".to_string()
        },
        Err(e) => format!("error: {e}"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, pausing transfers");
        },
        _ = terminate => {
            info!("Received terminate signal, pausing transfers");
        },
    }
}
