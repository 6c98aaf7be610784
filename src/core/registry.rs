//! The session registry: owner of every live stay.
//!
//! Front-ends open stays here after admission and report everything that
//! happens to them: sessions coming and going, byte counters, recording
//! attachment, and the final close. The registry fans termination signals
//! (revocation, expiry) back out to the front-end tasks through a
//! per-stay broadcast channel.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::errors::GatewayError;
use crate::core::stay::{Protocol, SessionKind, Stay, StaySession, TerminationReason};
use crate::policy::Admission;
use crate::store::SqliteStore;

/// RDP clients open several TCP connections within seconds; connections
/// arriving inside this window join the existing stay instead of opening
/// a new one, and a stay outlives its last connection by the same window.
pub const RDP_REUSE_WINDOW: Duration = Duration::from_secs(10);

/// How often buffered byte counters are folded into the store.
const COUNTER_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// If no front-end task closes a terminated stay, the registry does,
/// shortly after the 2 s observation bound.
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

/// Events delivered to every task serving a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StayEvent {
    /// Advance warning: the stay expires in this many minutes.
    Warning {
        /// Whole minutes remaining.
        minutes: i64,
    },
    /// The stay must terminate now.
    Terminate {
        /// `policy_expired` or `revoked`.
        reason: TerminationReason,
    },
}

#[derive(Debug, Default)]
struct SessionSet {
    open: HashSet<Uuid>,
    /// Bumped on every session open; lets the linger task detect arrivals.
    generation: u64,
    last_closed: Option<Instant>,
}

/// In-memory state of one live stay.
#[derive(Debug)]
pub struct LiveStay {
    /// The stay id, as persisted.
    pub stay_id: Uuid,
    /// The admitted person.
    pub person_id: Uuid,
    /// The admitting policy.
    pub policy_id: Uuid,
    /// The routed backend.
    pub backend_id: Uuid,
    /// Protocol spoken.
    pub protocol: Protocol,
    /// Operator source IP.
    pub source_ip: IpAddr,
    /// The proxy IP the stay came in on.
    pub proxy_ip: IpAddr,
    /// Backend login used, for SSH re-evaluation.
    pub login: Option<String>,
    /// Admission time.
    pub started_at: DateTime<Utc>,
    /// Whether non-session channels are allowed.
    pub allow_port_forwarding: bool,

    opened_mono: Instant,
    valid_until: std::sync::Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<StayEvent>,
    bytes_in: AtomicI64,
    bytes_out: AtomicI64,
    recording_path: std::sync::Mutex<Option<PathBuf>>,
    sessions: std::sync::Mutex<SessionSet>,
    closing: AtomicBool,
    terminated_with: std::sync::Mutex<Option<TerminationReason>>,
    warned_5m: AtomicBool,
    warned_1m: AtomicBool,
}

impl LiveStay {
    /// The policy's expiry instant, as last evaluated.
    #[must_use]
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        *self.valid_until.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Update the expiry instant after a re-evaluation. Warning flags
    /// rearm only when the instant actually moved (grant extended).
    pub fn set_valid_until(&self, until: Option<DateTime<Utc>>) {
        let mut guard = self
            .valid_until
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *guard != until {
            *guard = until;
            if until.is_some() {
                self.warned_5m.store(false, Ordering::Relaxed);
                self.warned_1m.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Subscribe to this stay's warning/termination events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StayEvent> {
        self.events.subscribe()
    }

    /// Fold a byte-counter delta into the stay.
    pub fn add_bytes(&self, bytes_in: i64, bytes_out: i64) {
        self.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        self.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);
    }

    /// Which warning (if any) is due at `now`, marking it delivered.
    fn due_warning(&self, now: DateTime<Utc>) -> Option<i64> {
        let until = self.valid_until()?;
        let remaining = until - now;
        if remaining <= chrono::Duration::minutes(1) {
            // The 1-minute warning supersedes an undelivered 5-minute one.
            self.warned_5m.store(true, Ordering::Relaxed);
            if !self.warned_1m.swap(true, Ordering::Relaxed) {
                return Some(1);
            }
        } else if remaining <= chrono::Duration::minutes(5)
            && !self.warned_5m.swap(true, Ordering::Relaxed)
        {
            return Some(5);
        }
        None
    }

    /// Instants the expiry ticker must wake at for this stay.
    fn deadlines(&self) -> Vec<DateTime<Utc>> {
        if self.termination().is_some() {
            return Vec::new();
        }
        let Some(until) = self.valid_until() else {
            return Vec::new();
        };
        let mut points = Vec::with_capacity(3);
        if !self.warned_5m.load(Ordering::Relaxed) {
            points.push(until - chrono::Duration::minutes(5));
        }
        if !self.warned_1m.load(Ordering::Relaxed) {
            points.push(until - chrono::Duration::minutes(1));
        }
        points.push(until);
        points
    }

    fn take_counters(&self) -> (i64, i64) {
        (
            self.bytes_in.swap(0, Ordering::Relaxed),
            self.bytes_out.swap(0, Ordering::Relaxed),
        )
    }

    fn recording(&self) -> Option<PathBuf> {
        self.recording_path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn termination(&self) -> Option<TerminationReason> {
        *self
            .terminated_with
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn reusable_for_rdp(&self, person_id: Uuid, backend_id: Uuid, source_ip: IpAddr) -> bool {
        if self.protocol != Protocol::Rdp
            || self.closing.load(Ordering::Relaxed)
            || self.person_id != person_id
            || self.backend_id != backend_id
            || self.source_ip != source_ip
        {
            return false;
        }
        let sessions = self
            .sessions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        !sessions.open.is_empty()
            || self.opened_mono.elapsed() < RDP_REUSE_WINDOW
            || sessions
                .last_closed
                .is_some_and(|at| at.elapsed() < RDP_REUSE_WINDOW)
    }
}

/// A front-end's reference to a live stay.
#[derive(Clone)]
pub struct StayHandle {
    registry: Arc<SessionRegistry>,
    live: Arc<LiveStay>,
}

impl std::fmt::Debug for StayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StayHandle")
            .field("stay_id", &self.live.stay_id)
            .finish_non_exhaustive()
    }
}

impl StayHandle {
    /// The stay id.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.live.stay_id
    }

    /// The in-memory stay state.
    #[must_use]
    pub fn live(&self) -> &Arc<LiveStay> {
        &self.live
    }

    /// Subscribe to warning/termination events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StayEvent> {
        self.live.subscribe()
    }

    /// Fold a byte delta into the stay's counters.
    pub fn add_bytes(&self, bytes_in: i64, bytes_out: i64) {
        self.live.add_bytes(bytes_in, bytes_out);
    }

    /// Attach the recording file once its first byte is written.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn attach_recording(&self, path: PathBuf) -> Result<(), GatewayError> {
        {
            let mut guard = self
                .live
                .recording_path
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(path.clone());
        }
        self.registry
            .store
            .stays()
            .attach_recording(self.live.stay_id, &path)
            .await
    }

    /// Record a new session (channel or TCP connection) under the stay.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn open_session(&self, kind: SessionKind) -> Result<Uuid, GatewayError> {
        let session = StaySession::open(self.live.stay_id, kind);
        self.registry.store.stays().insert_session(&session).await?;
        {
            let mut sessions = self
                .live
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sessions.open.insert(session.id);
            sessions.generation += 1;
        }
        Ok(session.id)
    }

    /// Close one session. For RDP stays this arms the linger window: the
    /// stay itself closes only if no new session arrives within it.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn close_session(&self, session_id: Uuid) -> Result<(), GatewayError> {
        self.registry.store.stays().close_session(session_id).await?;

        let (now_empty, generation) = {
            let mut sessions = self
                .live
                .sessions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            sessions.open.remove(&session_id);
            sessions.last_closed = Some(Instant::now());
            (sessions.open.is_empty(), sessions.generation)
        };

        if self.live.protocol == Protocol::Rdp && now_empty {
            let registry = Arc::clone(&self.registry);
            let live = Arc::clone(&self.live);
            tokio::spawn(async move {
                tokio::time::sleep(RDP_REUSE_WINDOW).await;
                let still_empty = {
                    let sessions = live
                        .sessions
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    sessions.open.is_empty() && sessions.generation == generation
                };
                if still_empty {
                    if let Err(err) = registry
                        .close_stay(&live, TerminationReason::ClientClosed)
                        .await
                    {
                        tracing::warn!(stay_id = %live.stay_id, error = %err, "linger close failed");
                    }
                }
            });
        }

        Ok(())
    }

    /// Close the stay. The first termination signal's reason, if any,
    /// overrides `fallback_reason`.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn finish(&self, fallback_reason: TerminationReason) -> Result<(), GatewayError> {
        self.registry.close_stay(&self.live, fallback_reason).await
    }
}

/// Tracks every live stay and owns their lifecycle.
pub struct SessionRegistry {
    store: Arc<SqliteStore>,
    stays: DashMap<Uuid, Arc<LiveStay>>,
    change_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("live", &self.stays.len())
            .finish_non_exhaustive()
    }
}

impl SessionRegistry {
    /// Create the registry and sweep any stay rows a previous process
    /// left open.
    ///
    /// # Errors
    ///
    /// Propagates store errors from the startup sweep.
    pub async fn new(store: Arc<SqliteStore>) -> Result<Arc<Self>, GatewayError> {
        let swept = store.stays().sweep_stale_open().await?;
        if swept > 0 {
            tracing::warn!(swept, "closed stays left open by a previous run");
        }

        let (change_tx, _) = watch::channel(0);
        Ok(Arc::new(Self {
            store,
            stays: DashMap::new(),
            change_tx,
        }))
    }

    /// A receiver bumped on every stay open/close and policy nudge; the
    /// expiry ticker recomputes its deadline on each change.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.change_tx.subscribe()
    }

    /// Wake the expiry ticker (after policy writes).
    pub fn nudge(&self) {
        self.change_tx.send_modify(|n| *n += 1);
    }

    /// Open a stay for an admission. For RDP, a connection matching an
    /// existing stay's `(person, backend, source)` inside the reuse
    /// window joins that stay instead.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn open(
        self: &Arc<Self>,
        admission: &Admission,
        protocol: Protocol,
        source_ip: IpAddr,
        proxy_ip: IpAddr,
        login: Option<String>,
        actor: &str,
    ) -> Result<StayHandle, GatewayError> {
        if protocol == Protocol::Rdp {
            let existing = self.stays.iter().find_map(|entry| {
                entry
                    .value()
                    .reusable_for_rdp(admission.person_id, admission.backend.id, source_ip)
                    .then(|| Arc::clone(entry.value()))
            });
            if let Some(live) = existing {
                tracing::debug!(stay_id = %live.stay_id, "RDP sub-connection joins existing stay");
                return Ok(StayHandle {
                    registry: Arc::clone(self),
                    live,
                });
            }
        }

        let stay = Stay::open(
            admission.person_id,
            admission.policy_id,
            admission.backend.id,
            protocol,
            source_ip,
            proxy_ip,
        );
        self.store.stays().insert_admitted(&stay, actor).await?;

        let (events, _) = broadcast::channel(16);
        let live = Arc::new(LiveStay {
            stay_id: stay.id,
            person_id: stay.person_id,
            policy_id: stay.policy_id,
            backend_id: stay.backend_id,
            protocol,
            source_ip,
            proxy_ip,
            login,
            started_at: stay.started_at,
            allow_port_forwarding: admission.allow_port_forwarding,
            opened_mono: Instant::now(),
            valid_until: std::sync::Mutex::new(admission.valid_until),
            events,
            bytes_in: AtomicI64::new(0),
            bytes_out: AtomicI64::new(0),
            recording_path: std::sync::Mutex::new(None),
            sessions: std::sync::Mutex::new(SessionSet::default()),
            closing: AtomicBool::new(false),
            terminated_with: std::sync::Mutex::new(None),
            warned_5m: AtomicBool::new(false),
            warned_1m: AtomicBool::new(false),
        });

        self.stays.insert(stay.id, Arc::clone(&live));
        self.nudge();
        tracing::info!(
            stay_id = %stay.id,
            person_id = %stay.person_id,
            backend_id = %stay.backend_id,
            %protocol,
            %source_ip,
            %proxy_ip,
            "stay opened"
        );

        Ok(StayHandle {
            registry: Arc::clone(self),
            live,
        })
    }

    /// Every live stay.
    #[must_use]
    pub fn active(&self) -> Vec<Arc<LiveStay>> {
        self.stays.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// A live stay by id.
    #[must_use]
    pub fn get(&self, stay_id: Uuid) -> Option<Arc<LiveStay>> {
        self.stays.get(&stay_id).map(|e| Arc::clone(e.value()))
    }

    /// Deliver the advance warning due for a stay, if any.
    pub fn deliver_due_warning(&self, live: &LiveStay, now: DateTime<Utc>) {
        if let Some(minutes) = live.due_warning(now) {
            let _ = live.events.send(StayEvent::Warning { minutes });
            tracing::debug!(stay_id = %live.stay_id, minutes, "expiry warning delivered");
        }
    }

    /// The nearest instant the expiry ticker must wake at, over every
    /// live stay's warning and expiry deadlines.
    #[must_use]
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.stays
            .iter()
            .flat_map(|e| e.value().deadlines())
            .min()
    }

    /// Signal a stay to terminate. Front-end tasks observe the event and
    /// tear the channels down; if none does, the registry closes the stay
    /// row itself after a short grace.
    pub fn terminate(self: &Arc<Self>, live: &Arc<LiveStay>, reason: TerminationReason) {
        {
            let mut guard = live
                .terminated_with
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if guard.is_some() {
                return;
            }
            *guard = Some(reason);
        }

        tracing::info!(stay_id = %live.stay_id, %reason, "stay termination signalled");
        let _ = live.events.send(StayEvent::Terminate { reason });

        let registry = Arc::clone(self);
        let live = Arc::clone(live);
        tokio::spawn(async move {
            tokio::time::sleep(TERMINATE_GRACE).await;
            if registry.stays.contains_key(&live.stay_id) {
                if let Err(err) = registry.close_stay(&live, reason).await {
                    tracing::warn!(stay_id = %live.stay_id, error = %err, "forced close failed");
                }
            }
        });
    }

    /// Terminate every live stay admitted under a policy (revocation
    /// fan-out).
    pub fn terminate_by_policy(self: &Arc<Self>, policy_id: Uuid, reason: TerminationReason) {
        for entry in &self.stays {
            if entry.value().policy_id == policy_id {
                self.terminate(&Arc::clone(entry.value()), reason);
            }
        }
        self.nudge();
    }

    /// Close a stay: fold final counters, stat the recording, write the
    /// close transaction, drop the live entry. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn close_stay(
        &self,
        live: &Arc<LiveStay>,
        fallback_reason: TerminationReason,
    ) -> Result<(), GatewayError> {
        if live.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let reason = live.termination().unwrap_or(fallback_reason);
        let (bytes_in, bytes_out) = live.take_counters();
        let recording = live.recording();

        let recording_bytes = match &recording {
            Some(path) => tokio::fs::metadata(path)
                .await
                .map(|m| i64::try_from(m.len()).unwrap_or(i64::MAX))
                .unwrap_or(0),
            None => 0,
        };

        self.store
            .stays()
            .close(
                live.stay_id,
                reason,
                recording.as_deref(),
                recording_bytes,
                bytes_in,
                bytes_out,
            )
            .await?;

        self.stays.remove(&live.stay_id);
        self.nudge();
        tracing::info!(stay_id = %live.stay_id, %reason, "stay closed");
        Ok(())
    }

    /// Fold buffered byte counters into the store about once per second
    /// until cancelled.
    pub async fn run_counter_flush(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(COUNTER_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            for entry in &self.stays {
                let live = entry.value();
                let (bytes_in, bytes_out) = live.take_counters();
                if bytes_in == 0 && bytes_out == 0 {
                    continue;
                }
                if let Err(err) = self
                    .store
                    .stays()
                    .add_bytes(live.stay_id, bytes_in, bytes_out)
                    .await
                {
                    // Put the delta back; it folds at close at the latest.
                    live.add_bytes(bytes_in, bytes_out);
                    tracing::debug!(stay_id = %live.stay_id, error = %err, "counter flush failed");
                }
            }
        }
    }

    /// Close every live stay (gateway shutdown).
    pub async fn shutdown(self: &Arc<Self>) {
        for live in self.active() {
            let _ = live.events.send(StayEvent::Terminate {
                reason: TerminationReason::Error,
            });
            if let Err(err) = self.close_stay(&live, TerminationReason::Error).await {
                tracing::warn!(stay_id = %live.stay_id, error = %err, "shutdown close failed");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::store::Backend;
    use tempfile::TempDir;

    pub(crate) async fn fixture() -> (Arc<SessionRegistry>, Arc<SqliteStore>, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Arc::new(
            SqliteStore::new(&dir.path().join("test.db"))
                .await
                .expect("Failed to create store"),
        );
        let registry = SessionRegistry::new(Arc::clone(&store))
            .await
            .expect("Failed to create registry");
        (registry, store, dir)
    }

    pub(crate) async fn open_ssh_stay(registry: &Arc<SessionRegistry>) -> StayHandle {
        let admission = Admission {
            person_id: Uuid::new_v4(),
            policy_id: Uuid::new_v4(),
            backend: Backend {
                id: Uuid::new_v4(),
                name: "db-01".into(),
                address: "192.0.2.10".into(),
                port: None,
                ssh_enabled: true,
                rdp_enabled: false,
                active: true,
            },
            allow_port_forwarding: true,
            ssh_login_filter: Vec::new(),
            valid_until: None,
        };
        registry
            .open(
                &admission,
                Protocol::Ssh,
                "100.64.0.20".parse().unwrap(),
                "10.0.160.129".parse().unwrap(),
                Some("postgres".into()),
                "alice",
            )
            .await
            .expect("Failed to open stay")
    }
}
