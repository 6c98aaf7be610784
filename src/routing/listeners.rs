//! One TCP listener per allocated proxy IP.
//!
//! Both front-ends bind the same way: every proxy IP in the routing table
//! gets its own listener on the front-end's port, so the destination is
//! recoverable from the accepted socket's local address. The set follows
//! the routing table as operators bind and release IPs, and an IP hit by
//! an invariant violation stays suspended until it is re-bound.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::RoutingTable;

/// Called once per accepted connection with `(stream, peer, local)`.
/// Implementations spawn their own per-connection task.
pub type ConnHandler = Arc<dyn Fn(TcpStream, SocketAddr, SocketAddr) + Send + Sync>;

/// Requests a proxy IP's listener be stopped until re-bind. Handed to
/// connection handlers so an observed invariant violation can take the
/// IP out of service.
pub type SuspendHandle = mpsc::UnboundedSender<IpAddr>;

/// How often the set reconciles against the routing table. Matches the
/// table's own cache TTL so CLI-driven binds surface within seconds.
const SYNC_INTERVAL: Duration = Duration::from_secs(2);

/// A self-reconciling set of per-proxy-IP listeners.
pub struct ListenerSet {
    label: &'static str,
    port: u16,
    routing: Arc<RoutingTable>,
    handler: ConnHandler,
    active: Mutex<HashMap<IpAddr, JoinHandle<()>>>,
    suspended: Mutex<HashSet<IpAddr>>,
    suspend_rx: Mutex<mpsc::UnboundedReceiver<IpAddr>>,
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("label", &self.label)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl ListenerSet {
    /// Create a listener set for one front-end. `suspend_rx` carries
    /// invariant-violation suspensions from connection handlers.
    #[must_use]
    pub fn new(
        label: &'static str,
        port: u16,
        routing: Arc<RoutingTable>,
        handler: ConnHandler,
        suspend_rx: mpsc::UnboundedReceiver<IpAddr>,
    ) -> Self {
        Self {
            label,
            port,
            routing,
            handler,
            active: Mutex::new(HashMap::new()),
            suspended: Mutex::new(HashSet::new()),
            suspend_rx: Mutex::new(suspend_rx),
        }
    }

    /// Follow the routing table until cancelled, then tear every
    /// listener down.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut suspend_rx = self.suspend_rx.lock().await;
        loop {
            if let Err(err) = self.sync().await {
                tracing::warn!(frontend = self.label, error = %err, "listener sync failed");
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(SYNC_INTERVAL) => {}
                suspended = suspend_rx.recv() => {
                    if let Some(ip) = suspended {
                        self.suspend(ip).await;
                    }
                }
            }
        }

        let mut active = self.active.lock().await;
        for (ip, task) in active.drain() {
            task.abort();
            tracing::info!(frontend = self.label, proxy_ip = %ip, "listener stopped");
        }
    }

    /// Stop serving one proxy IP until it is released and re-bound.
    /// Used when an invariant violation implicates the IP.
    pub async fn suspend(&self, proxy_ip: IpAddr) {
        self.suspended.lock().await.insert(proxy_ip);
        if let Some(task) = self.active.lock().await.remove(&proxy_ip) {
            task.abort();
        }
        tracing::error!(
            frontend = self.label,
            proxy_ip = %proxy_ip,
            "listener suspended until re-bind"
        );
    }

    async fn sync(&self) -> Result<(), crate::core::errors::GatewayError> {
        let bound: HashSet<IpAddr> = self.routing.proxy_ips().await?.into_iter().collect();

        // A released IP loses its suspension; a fresh bind starts clean.
        self.suspended.lock().await.retain(|ip| bound.contains(ip));

        let suspended = self.suspended.lock().await.clone();
        let mut active = self.active.lock().await;

        active.retain(|ip, task| {
            let keep = bound.contains(ip) && !suspended.contains(ip);
            if !keep {
                task.abort();
                tracing::info!(frontend = self.label, proxy_ip = %ip, "listener removed");
            }
            keep
        });

        for ip in bound {
            if suspended.contains(&ip) || active.contains_key(&ip) {
                continue;
            }
            match TcpListener::bind((ip, self.port)).await {
                Ok(listener) => {
                    tracing::info!(
                        frontend = self.label,
                        proxy_ip = %ip,
                        port = self.port,
                        "listener bound"
                    );
                    let handler = Arc::clone(&self.handler);
                    let label = self.label;
                    active.insert(ip, tokio::spawn(accept_loop(listener, handler, label)));
                }
                Err(err) => {
                    tracing::warn!(
                        frontend = self.label,
                        proxy_ip = %ip,
                        port = self.port,
                        error = %err,
                        "failed to bind listener"
                    );
                }
            }
        }

        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, handler: ConnHandler, label: &'static str) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let Ok(local) = stream.local_addr() else {
                    tracing::debug!(frontend = label, %peer, "no local address on accept");
                    continue;
                };
                handler(stream, peer, local);
            }
            Err(err) => {
                // Backlog exhaustion or fd pressure: keep serving others.
                tracing::warn!(frontend = label, error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}
