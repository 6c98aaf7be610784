//! The serve runtime.
//!
//! Builds every component over one store, wires the front-ends to the
//! routing table, and runs until SIGINT/SIGTERM. Shutdown stops the
//! listeners first, signals every live stay, flushes what is pending,
//! and closes the stay rows so a restart finds nothing open.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::audit::{AuditSink, LocalAuditLog};
use crate::config::Config;
use crate::core::errors::GatewayError;
use crate::core::expiry::ExpiryTicker;
use crate::core::registry::SessionRegistry;
use crate::policy::PolicyEngine;
use crate::rdp::RdpFrontend;
use crate::routing::RoutingTable;
use crate::ssh::SshFrontend;
use crate::store::SqliteStore;
use crate::transcode::{JobLimits, TranscodeQueue};

/// How long shutdown waits for tasks to drain before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Run the gateway until a termination signal arrives.
///
/// # Errors
///
/// [`GatewayError::Config`] for unusable configuration; store errors
/// during startup. Runtime faults are handled per-connection and do not
/// surface here.
pub async fn run(config: Config) -> Result<(), GatewayError> {
    config.ensure_dirs()?;
    let config = Arc::new(config);

    let store = Arc::new(SqliteStore::open(&config.db_url).await?);
    let fallback = LocalAuditLog::new(config.audit_fallback_path()).map_err(|e| {
        GatewayError::Config {
            what: "audit fallback log".to_owned(),
            source: e,
        }
    })?;
    let audit = Arc::new(AuditSink::new(Arc::clone(&store), fallback));
    let routing = Arc::new(RoutingTable::new(Arc::clone(&store)));
    let engine = Arc::new(PolicyEngine::new(
        Arc::clone(&store),
        Arc::clone(&routing),
        config.decision_budget,
    ));
    let registry = SessionRegistry::new(Arc::clone(&store)).await?;

    let ssh = SshFrontend::new(
        Arc::clone(&config),
        Arc::clone(&engine),
        Arc::clone(&registry),
        Arc::clone(&audit),
    )?;
    let rdp = RdpFrontend::new(
        Arc::clone(&config),
        Arc::clone(&engine),
        Arc::clone(&registry),
        Arc::clone(&audit),
    )?;
    let transcode = TranscodeQueue::new(
        Arc::clone(&store),
        Arc::clone(&config),
        JobLimits::default(),
    );
    let ticker = ExpiryTicker::new(Arc::clone(&registry), Arc::clone(&engine));

    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    tasks.push(tokio::spawn(
        ssh.listener_set(Arc::clone(&routing)).run(cancel.clone()),
    ));
    tasks.push(tokio::spawn(
        rdp.listener_set(Arc::clone(&routing)).run(cancel.clone()),
    ));
    tasks.push(tokio::spawn(
        Arc::clone(&registry).run_counter_flush(cancel.clone()),
    ));
    tasks.push(tokio::spawn(transcode.run_workers(cancel.clone())));
    tasks.push(tokio::spawn(ticker.run(cancel.clone())));

    tracing::info!(
        data_dir = %config.data_dir.display(),
        ssh_port = config.ssh_port,
        rdp_port = config.rdp_port,
        "gateway serving"
    );

    wait_for_signal().await;
    tracing::info!("shutdown signal received");

    cancel.cancel();
    registry.shutdown().await;

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        tracing::warn!("some tasks did not drain within the shutdown grace");
    }

    tracing::info!("gateway stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::warn!(error = %err, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
