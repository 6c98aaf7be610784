//! The RDP front-end.
//!
//! RDP's protocol-level target is opaque at accept time, so routing is
//! deferred: the driver reads the connection request while the local
//! socket address tells us which proxy IP (and therefore backend) the
//! client meant. Only after admission is the driver allowed to open its
//! outbound leg; a deny closes the inbound TCP with exactly one
//! `admitted=false` audit row.

/// Driver interface the front-end talks to.
pub mod driver;
/// The in-tree TLS MITM driver.
pub mod mitm;
/// Gateway TLS material.
pub mod tls;
/// TPKT / X.224 connection-sequence codec.
pub mod x224;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::audit::AuditSink;
use crate::config::Config;
use crate::core::errors::GatewayError;
use crate::core::registry::SessionRegistry;
use crate::core::stay::{Protocol, SessionKind};
use crate::policy::{Decision, PolicyEngine};
use crate::routing::{ConnHandler, ListenerSet, RoutingTable, SuspendHandle};
use crate::store::{AuditKind, NewAudit};

pub use driver::{RdpMitmDriver, RdpMitmSession};
pub use mitm::TlsMitmDriver;

/// The RDP front-end: admission wiring around a swappable MITM driver.
pub struct RdpFrontend {
    config: Arc<Config>,
    engine: Arc<PolicyEngine>,
    registry: Arc<SessionRegistry>,
    audit: Arc<AuditSink>,
    driver: Arc<dyn RdpMitmDriver>,
}

impl std::fmt::Debug for RdpFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdpFrontend").finish_non_exhaustive()
    }
}

impl RdpFrontend {
    /// Build the front-end with the in-tree TLS MITM driver.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when TLS material cannot be prepared.
    pub fn new(
        config: Arc<Config>,
        engine: Arc<PolicyEngine>,
        registry: Arc<SessionRegistry>,
        audit: Arc<AuditSink>,
    ) -> Result<Arc<Self>, GatewayError> {
        let driver = Arc::new(TlsMitmDriver::new(
            &config.tls_dir(),
            config.backend_connect_timeout,
            config.rdp_idle_timeout,
        )?);
        Ok(Arc::new(Self {
            config,
            engine,
            registry,
            audit,
            driver,
        }))
    }

    /// Build the front-end around a custom driver.
    #[must_use]
    pub fn with_driver(
        config: Arc<Config>,
        engine: Arc<PolicyEngine>,
        registry: Arc<SessionRegistry>,
        audit: Arc<AuditSink>,
        driver: Arc<dyn RdpMitmDriver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            registry,
            audit,
            driver,
        })
    }

    /// The listener set serving this front-end on every proxy IP.
    #[must_use]
    pub fn listener_set(self: &Arc<Self>, routing: Arc<RoutingTable>) -> Arc<ListenerSet> {
        let (suspend_tx, suspend_rx) = tokio::sync::mpsc::unbounded_channel();
        let frontend = Arc::clone(self);
        let handler: ConnHandler = Arc::new(move |stream, peer, local| {
            let frontend = Arc::clone(&frontend);
            let suspend = suspend_tx.clone();
            tokio::spawn(async move {
                frontend.handle_connection(stream, peer, local, suspend).await;
            });
        });
        Arc::new(ListenerSet::new(
            "rdp",
            self.config.rdp_port,
            routing,
            handler,
            suspend_rx,
        ))
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        local: SocketAddr,
        suspend: SuspendHandle,
    ) {
        tracing::debug!(%peer, %local, "RDP connection accepted");

        // Let the MITM hold the client while we decide.
        let mut session = match self.driver.accept(stream).await {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(%peer, error = %err, "RDP handshake failed before routing");
                return;
            }
        };

        let decision = match self
            .engine
            .decide(peer.ip(), local.ip(), Protocol::Rdp, None)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                if let GatewayError::InvariantViolation { proxy_ip, .. } = &err {
                    let _ = suspend.send(proxy_ip.unwrap_or_else(|| local.ip()));
                }
                tracing::warn!(%peer, error = %err, "RDP admission errored");
                return;
            }
        };

        let admission = match decision {
            Decision::Admit(admission) => admission,
            Decision::Deny(reason) => {
                tracing::info!(src = %peer.ip(), proxy_ip = %local.ip(), %reason, "RDP connection denied");
                self.audit.deny(
                    peer.ip(),
                    None,
                    Protocol::Rdp,
                    reason,
                    format!("rdp on {}", local.ip()),
                );
                // Dropping the session closes the inbound TCP; the
                // outbound leg was never opened.
                return;
            }
        };

        let (host, port) = admission.backend.target_for(Protocol::Rdp);
        let target = match tokio::net::lookup_host((host.as_str(), port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(_) => None,
        };
        let Some(target) = target else {
            tracing::warn!(backend = %admission.backend.name, "backend address does not resolve");
            self.audit_backend_failure(peer, &admission.backend.name, "address does not resolve");
            return;
        };
        session.set_target(target);

        if let Err(err) = session.open_backend().await {
            tracing::info!(backend = %admission.backend.name, error = %err, "RDP backend leg failed");
            self.audit_backend_failure(peer, &admission.backend.name, &err.to_string());
            return;
        }

        let stay = match self
            .registry
            .open(
                &admission,
                Protocol::Rdp,
                peer.ip(),
                local.ip(),
                None,
                &admission.person_id.to_string(),
            )
            .await
        {
            Ok(stay) => stay,
            Err(err) => {
                tracing::warn!(error = %err, "failed to open RDP stay");
                return;
            }
        };

        let replay_path = self.config.rdp_replay_path(stay.id());
        session.write_replay(replay_path.clone());
        if let Err(err) = stay.attach_recording(replay_path).await {
            tracing::debug!(error = %err, "replay attach failed");
        }

        let session_id = match stay.open_session(SessionKind::Rdp).await {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(error = %err, "failed to record RDP session");
                let _ = stay.finish(crate::core::stay::TerminationReason::Error).await;
                return;
            }
        };

        match session.run(stay.clone()).await {
            Ok(reason) => {
                tracing::debug!(stay_id = %stay.id(), %reason, "RDP connection ended");
            }
            Err(err) => {
                tracing::debug!(stay_id = %stay.id(), error = %err, "RDP connection errored");
            }
        }

        // The stay itself survives the reconnect window; the registry
        // closes it once no new sub-connection arrives.
        if let Err(err) = stay.close_session(session_id).await {
            tracing::debug!(error = %err, "RDP session close failed");
        }
    }

    fn audit_backend_failure(&self, peer: SocketAddr, backend: &str, detail: &str) {
        let audit = Arc::clone(&self.audit);
        audit.record_detached(NewAudit {
            actor: None,
            kind: AuditKind::Admission,
            source_ip: Some(peer.ip()),
            backend_id: None,
            protocol: Some(Protocol::Rdp),
            admitted: false,
            reason: "backend_unreachable".to_owned(),
            detail: format!("{backend}: {detail}"),
        });
    }
}
