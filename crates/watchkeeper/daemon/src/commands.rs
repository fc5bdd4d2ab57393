//! Subcommand implementations

use std::sync::Arc;

use serde_json::json;
use watchkeeper_kernel::{MonitorAgent, MonitorAgentBuilder, SnapshotSource, Subscription};
use watchkeeper_storage::sqlite::SqliteAuditMemory;
use watchkeeper_storage::{AuditMemory, InMemoryAuditMemory};
use watchkeeper_types::EventType;

use crate::collaborators::{
    FileSnapshotSource, HttpAnalysisProvider, HttpNarrativeProvider, HttpSnapshotSource,
};
use crate::config::DaemonConfig;
use crate::error::{DaemonError, DaemonResult};

/// Open the configured audit memory.
pub async fn open_memory(config: &DaemonConfig) -> DaemonResult<Arc<dyn AuditMemory>> {
    match config.storage.database_url.as_deref() {
        Some(url) => {
            tracing::info!(database_url = %url, "Opening SQLite audit memory");
            Ok(Arc::new(SqliteAuditMemory::connect(url).await?))
        }
        None => {
            tracing::warn!("No database configured; audit trail is kept in memory only");
            Ok(Arc::new(InMemoryAuditMemory::new()))
        }
    }
}

fn build_source(config: &DaemonConfig) -> DaemonResult<Arc<dyn SnapshotSource>> {
    let source_id = config.kernel.detector.source_id.clone();
    if let Some(url) = &config.source.url {
        let source = HttpSnapshotSource::new(
            source_id,
            url.clone(),
            config.source.bearer_token.clone(),
            config.kernel.detector.fetch_timeout(),
        )?;
        return Ok(Arc::new(source));
    }
    if let Some(file) = &config.source.file {
        return Ok(Arc::new(FileSnapshotSource::new(source_id, file)));
    }
    Err(DaemonError::Config(
        "no snapshot source configured (set source.url or source.file)".into(),
    ))
}

/// Wire the agent from configuration.
pub fn build_agent(config: &DaemonConfig, memory: Arc<dyn AuditMemory>) -> DaemonResult<MonitorAgent> {
    let analysis_url = config.analysis.url.as_deref().ok_or_else(|| {
        DaemonError::Config("no analysis provider configured (set analysis.url)".into())
    })?;

    let mut builder = MonitorAgentBuilder::new(config.kernel.clone())
        .with_memory(memory)
        .with_source(build_source(config)?)
        .with_analysis(Arc::new(HttpAnalysisProvider::from_endpoint(
            analysis_url,
            &config.analysis,
        )?));

    if let Some(url) = config.narrative.url.as_deref() {
        builder = builder.with_narrative(Arc::new(HttpNarrativeProvider::from_endpoint(
            url,
            &config.narrative,
        )?));
    }

    Ok(builder.build()?)
}

/// Log every lifecycle event until the broadcaster drops the subscription.
async fn log_events(mut subscription: Subscription) {
    while let Some(event) = subscription.recv().await {
        match event.event_type {
            EventType::RunCompleted | EventType::RunSkipped | EventType::DecisionRecorded => {
                tracing::info!(
                    event = %event.event_type,
                    payload = %event.payload,
                    "Lifecycle event"
                );
            }
            EventType::Connected | EventType::RunStarted => {
                tracing::debug!(
                    event = %event.event_type,
                    payload = %event.payload,
                    "Lifecycle event"
                );
            }
        }
    }
}

/// Run the agent until a shutdown signal arrives.
pub async fn run(config: DaemonConfig) -> DaemonResult<()> {
    let memory = open_memory(&config).await?;
    let agent = build_agent(&config, memory)?;

    let logger = tokio::spawn(log_events(agent.subscribe()));

    agent.start().await?;
    tracing::info!(
        source_id = %config.kernel.detector.source_id,
        poll_interval_ms = config.kernel.detector.poll_interval_ms,
        "Watchkeeper running"
    );

    shutdown_signal().await;

    agent.stop().await?;
    let status = agent.status().await?;
    tracing::info!(
        pending_actions = status.pending_actions,
        "Watchkeeper stopped"
    );

    logger.abort();
    Ok(())
}

/// Print the most recent runs, newest first.
pub async fn history(memory: &dyn AuditMemory, limit: usize) -> DaemonResult<()> {
    let runs = memory.get_history(limit).await?;
    println!("{}", serde_json::to_string_pretty(&runs)?);
    Ok(())
}

/// Print table counts and intelligence metrics.
pub async fn stats(memory: &dyn AuditMemory) -> DaemonResult<()> {
    let statistics = memory.get_statistics().await?;
    let metrics = memory.compute_intelligence_metrics().await?;
    let report = json!({
        "statistics": statistics,
        "intelligence": metrics,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Drop all but the `keep` most recent runs.
pub async fn prune(memory: &dyn AuditMemory, keep: usize) -> DaemonResult<()> {
    let removed = memory.prune(keep).await?;
    tracing::info!(removed, keep, "Pruned run history");
    println!("{}", json!({ "removed": removed, "kept": keep }));
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
