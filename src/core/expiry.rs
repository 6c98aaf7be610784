//! The expiry ticker.
//!
//! One logical timer over every live stay. It sleeps to the nearest
//! deadline (a T-5m or T-1m warning instant, or a policy expiry),
//! recomputing whenever the registry changes, and on expiry asks the
//! policy engine to re-evaluate the stay. A stay whose admitting policy
//! no longer admits it is signalled `policy_expired`; revocations are
//! fanned out directly by the revoke path with reason `revoked`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::registry::SessionRegistry;
use crate::core::stay::TerminationReason;
use crate::policy::{PolicyEngine, Reconfirm};

/// Idle sleep when no stay is live.
const IDLE_SLEEP: Duration = Duration::from_secs(3600);
/// Re-evaluation cadence while stays are live. Revocations land in the
/// store from another process (the CLI), so the sweep has to poll; one
/// second keeps the 2 s observation bound with room to spare.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Floor on the recomputed sleep, so a stay mid-teardown cannot spin the
/// ticker.
const MIN_SLEEP: Duration = Duration::from_millis(200);

/// The single expiry timer task.
pub struct ExpiryTicker {
    registry: Arc<SessionRegistry>,
    engine: Arc<PolicyEngine>,
}

impl std::fmt::Debug for ExpiryTicker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiryTicker").finish_non_exhaustive()
    }
}

impl ExpiryTicker {
    /// Create the ticker over the registry and engine.
    #[must_use]
    pub const fn new(registry: Arc<SessionRegistry>, engine: Arc<PolicyEngine>) -> Self {
        Self { registry, engine }
    }

    /// Run until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut changes = self.registry.changes();

        loop {
            let stays = self.registry.active();
            let sleep = if stays.is_empty() {
                IDLE_SLEEP
            } else {
                // Wake at the nearest warning/expiry deadline, but never
                // later than the revocation sweep cadence.
                self.registry
                    .next_deadline()
                    .map_or(SWEEP_INTERVAL, |at| {
                        (at - Utc::now())
                            .to_std()
                            .unwrap_or(Duration::ZERO)
                            .clamp(MIN_SLEEP, SWEEP_INTERVAL)
                    })
            };

            tokio::select! {
                () = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Stay or policy written: recompute the deadline.
                }
                () = tokio::time::sleep(sleep) => self.fire().await,
            }
        }
    }

    /// Deliver due warnings and re-evaluate every live stay.
    async fn fire(&self) {
        let now = Utc::now();

        for live in self.registry.active() {
            self.registry.deliver_due_warning(&live, now);

            match self
                .engine
                .reconfirm(live.policy_id, live.login.as_deref())
                .await
            {
                Ok(Reconfirm::Admitted(until)) => {
                    // Keeps the warning instants honest if the grant was
                    // extended or shortened.
                    live.set_valid_until(until);
                }
                Ok(Reconfirm::Revoked) => {
                    self.registry.terminate(&live, TerminationReason::Revoked);
                }
                Ok(Reconfirm::NoLongerAdmits) => {
                    self.registry
                        .terminate(&live, TerminationReason::PolicyExpired);
                }
                Err(err) => {
                    tracing::warn!(stay_id = %live.stay_id, error = %err, "re-evaluation failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::StayEvent;
    use crate::core::stay::Protocol;
    use crate::policy::{Admission, Policy, ScopeKind, SubjectKind};
    use crate::routing::RoutingTable;
    use crate::store::{Backend, SqliteStore};
    use tempfile::TempDir;
    use uuid::Uuid;

    async fn fixture() -> (Arc<SessionRegistry>, Arc<SqliteStore>, Arc<PolicyEngine>, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteStore::new(&dir.path().join("test.db"))
                .await
                .expect("Failed to create store"),
        );
        let routing = Arc::new(RoutingTable::new(Arc::clone(&store)));
        let engine = Arc::new(PolicyEngine::new(
            Arc::clone(&store),
            routing,
            Duration::from_millis(500),
        ));
        let registry = SessionRegistry::new(Arc::clone(&store))
            .await
            .expect("Failed to create registry");
        (registry, store, engine, dir)
    }

    fn short_policy(subject_id: Uuid, scope_id: Uuid, ttl: chrono::Duration) -> Policy {
        Policy {
            id: Uuid::new_v4(),
            subject_kind: SubjectKind::Person,
            subject_id,
            scope_kind: ScopeKind::Server,
            scope_id,
            protocol: Some(Protocol::Ssh),
            ssh_logins: Vec::new(),
            source_ip_id: None,
            allow_port_forwarding: false,
            starts_at: Utc::now() - chrono::Duration::hours(1),
            ends_at: Some(Utc::now() + ttl),
            schedule: None,
            active: true,
            created_at: Utc::now(),
            created_by: "ops".into(),
        }
    }

    #[tokio::test]
    async fn expired_policy_terminates_stay() {
        let (registry, store, engine, _dir) = fixture().await;

        let backend = Backend {
            id: Uuid::new_v4(),
            name: "db-01".into(),
            address: "192.0.2.10".into(),
            port: None,
            ssh_enabled: true,
            rdp_enabled: false,
            active: true,
        };
        let person_id = Uuid::new_v4();
        let policy = short_policy(person_id, backend.id, chrono::Duration::milliseconds(300));
        store.policies().create(&policy).await.unwrap();

        let admission = Admission {
            person_id,
            policy_id: policy.id,
            backend,
            allow_port_forwarding: false,
            ssh_login_filter: Vec::new(),
            valid_until: policy.ends_at,
        };
        let handle = registry
            .open(
                &admission,
                Protocol::Ssh,
                "100.64.0.20".parse().unwrap(),
                "10.0.160.129".parse().unwrap(),
                Some("postgres".into()),
                "alice",
            )
            .await
            .unwrap();
        let mut events = handle.subscribe();

        let ticker = ExpiryTicker::new(Arc::clone(&registry), engine);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(ticker.run(cancel.clone()));

        // A 1-minute warning precedes the kill for such a short grant;
        // the termination itself must land inside the 2 s bound.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let event = tokio::time::timeout_at(deadline, events.recv())
                .await
                .expect("termination within 2s")
                .unwrap();
            match event {
                StayEvent::Warning { .. } => {}
                StayEvent::Terminate { reason } => {
                    assert_eq!(reason, TerminationReason::PolicyExpired);
                    break;
                }
            }
        }

        handle.finish(TerminationReason::ClientClosed).await.unwrap();
        let row = store.stays().by_id(handle.id()).await.unwrap().unwrap();
        assert_eq!(row.termination_reason, Some(TerminationReason::PolicyExpired));

        cancel.cancel();
        let _ = task.await;
    }

    #[tokio::test]
    async fn revoked_policy_reconfirms_as_gone() {
        let (_registry, store, engine, _dir) = fixture().await;

        let policy = short_policy(Uuid::new_v4(), Uuid::new_v4(), chrono::Duration::hours(8));
        store.policies().create(&policy).await.unwrap();
        assert!(matches!(
            engine.reconfirm(policy.id, None).await.unwrap(),
            Reconfirm::Admitted(_)
        ));

        store.policies().revoke(policy.id, "ops").await.unwrap();
        assert_eq!(
            engine.reconfirm(policy.id, None).await.unwrap(),
            Reconfirm::Revoked
        );
    }
}
