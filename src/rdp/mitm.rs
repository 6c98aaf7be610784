//! The in-tree TLS MITM driver.
//!
//! Reads the client's X.224 Connection Request, forwards it to the
//! routed backend once the front-end sets the target, answers the client
//! with a confirm selecting TLS when the client offers it, terminates
//! TLS on both legs, and tees the relayed stream into the `.replay`
//! file. Clients that only speak legacy RDP security are relayed as
//! plain TCP; the security selection lives here, not in the protocol
//! layer, so swapping the driver swaps the policy.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::core::errors::GatewayError;
use crate::core::registry::{StayEvent, StayHandle};
use crate::core::stay::TerminationReason;
use crate::rdp::driver::{RdpMitmDriver, RdpMitmSession};
use crate::rdp::x224::{
    self, ConnectionRequest, PROTOCOL_HYBRID, PROTOCOL_SSL, parse_selected_protocol,
};

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Driver terminating TLS on both legs with a replay tee.
pub struct TlsMitmDriver {
    server_config: Arc<rustls::ServerConfig>,
    client_config: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl std::fmt::Debug for TlsMitmDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMitmDriver").finish_non_exhaustive()
    }
}

impl TlsMitmDriver {
    /// Build the driver, generating gateway TLS material under `tls_dir`
    /// on first use.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the TLS identity cannot be prepared.
    pub fn new(
        tls_dir: &std::path::Path,
        connect_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let server_config =
            super::tls::load_or_generate_server_config(tls_dir).map_err(|e| {
                GatewayError::Config {
                    what: format!("RDP TLS material in {}", tls_dir.display()),
                    source: e,
                }
            })?;
        let client_config = super::tls::backend_client_config().map_err(|e| GatewayError::Config {
            what: "RDP backend TLS config".to_owned(),
            source: e,
        })?;

        Ok(Self {
            server_config,
            client_config,
            connect_timeout,
            idle_timeout,
        })
    }
}

#[async_trait]
impl RdpMitmDriver for TlsMitmDriver {
    async fn accept(&self, mut stream: TcpStream) -> Result<Box<dyn RdpMitmSession>, GatewayError> {
        let packet = x224::read_tpkt(&mut stream)
            .await
            .map_err(|e| GatewayError::Other(anyhow::anyhow!("RDP connection request: {e}")))?;
        let request = x224::parse_connection_request(&packet)
            .map_err(|e| GatewayError::Other(e.into()))?;

        tracing::debug!(
            cookie = ?request.cookie,
            protocols = request.requested_protocols,
            "RDP connection request read"
        );

        Ok(Box::new(TlsMitmSession {
            stream,
            request,
            target: None,
            backend: None,
            replay: None,
            server_config: Arc::clone(&self.server_config),
            client_config: Arc::clone(&self.client_config),
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
        }))
    }
}

struct TlsMitmSession {
    stream: TcpStream,
    request: ConnectionRequest,
    target: Option<SocketAddr>,
    backend: Option<TcpStream>,
    replay: Option<PathBuf>,
    server_config: Arc<rustls::ServerConfig>,
    client_config: Arc<rustls::ClientConfig>,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

#[async_trait]
impl RdpMitmSession for TlsMitmSession {
    fn set_target(&mut self, target: SocketAddr) {
        self.target = Some(target);
    }

    fn write_replay(&mut self, path: PathBuf) {
        self.replay = Some(path);
    }

    async fn open_backend(&mut self) -> Result<(), GatewayError> {
        let target = self.target.ok_or_else(|| {
            GatewayError::Other(anyhow::anyhow!("MITM target not set before open_backend"))
        })?;

        let backend = timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| GatewayError::BackendUnreachable {
                backend: target.to_string(),
                reason: format!("connect timeout after {:?}", self.connect_timeout),
            })?
            .map_err(|e| GatewayError::BackendUnreachable {
                backend: target.to_string(),
                reason: e.to_string(),
            })?;

        self.backend = Some(backend);
        Ok(())
    }

    async fn run(mut self: Box<Self>, stay: StayHandle) -> Result<TerminationReason, GatewayError> {
        let target = self.target.ok_or_else(|| {
            GatewayError::Other(anyhow::anyhow!("MITM started without a target"))
        })?;
        let mut backend = self.backend.take().ok_or_else(|| {
            GatewayError::Other(anyhow::anyhow!("MITM started without a backend leg"))
        })?;

        // Forward the client's CR verbatim and read what the backend
        // selected.
        backend
            .write_all(&self.request.raw)
            .await
            .map_err(|e| backend_io(target, &e))?;
        let confirm = x224::read_tpkt(&mut backend)
            .await
            .map_err(|e| backend_io(target, &e))?;
        let backend_protocol = parse_selected_protocol(&confirm).unwrap_or(0);

        let replay = match self.replay.take() {
            Some(path) => Some(ReplayWriter::create(&path).map_err(GatewayError::Other)?),
            None => None,
        };

        let stay_id = stay.id();
        let client: Box<dyn Transport> = if self.request.offers_tls() {
            // Our own confirm, selecting TLS.
            self.stream
                .write_all(&x224::connection_confirm(PROTOCOL_SSL))
                .await
                .map_err(|e| client_io(stay_id, e))?;
            let acceptor = TlsAcceptor::from(Arc::clone(&self.server_config));
            Box::new(
                acceptor
                    .accept(self.stream)
                    .await
                    .map_err(|e| client_io(stay_id, e))?,
            )
        } else {
            // Legacy client: pass the backend's confirm through and relay
            // plain bytes.
            self.stream
                .write_all(&confirm)
                .await
                .map_err(|e| client_io(stay_id, e))?;
            Box::new(self.stream)
        };

        let backend: Box<dyn Transport> =
            if backend_protocol & (PROTOCOL_SSL | PROTOCOL_HYBRID) != 0 {
                let connector = TlsConnector::from(Arc::clone(&self.client_config));
                let name = ServerName::try_from(target.ip().to_string())
                    .map_err(|e| GatewayError::Other(e.into()))?;
                Box::new(
                    connector
                        .connect(name, backend)
                        .await
                        .map_err(|e| backend_io(target, &e))?,
                )
            } else {
                Box::new(backend)
            };

        relay(client, backend, &stay, replay, self.idle_timeout).await
    }
}

fn backend_io(target: SocketAddr, err: &dyn std::fmt::Display) -> GatewayError {
    GatewayError::BackendUnreachable {
        backend: target.to_string(),
        reason: err.to_string(),
    }
}

fn client_io(stay_id: uuid::Uuid, err: std::io::Error) -> GatewayError {
    GatewayError::TransientIo {
        stay_id,
        source: err,
    }
}

/// Relay both directions with a replay tee, byte counters, termination
/// events, and the RDP idle cutoff.
async fn relay(
    client: Box<dyn Transport>,
    backend: Box<dyn Transport>,
    stay: &StayHandle,
    mut replay: Option<ReplayWriter>,
    idle_timeout: Duration,
) -> Result<TerminationReason, GatewayError> {
    let mut events = stay.subscribe();
    let (mut client_r, mut client_w) = tokio::io::split(client);
    let (mut backend_r, mut backend_w) = tokio::io::split(backend);

    let mut cbuf = vec![0u8; 16 * 1024];
    let mut bbuf = vec![0u8; 16 * 1024];

    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            read = client_r.read(&mut cbuf) => {
                match read.map_err(|e| client_io(stay.id(), e))? {
                    0 => {
                        let _ = backend_w.shutdown().await;
                        break TerminationReason::ClientClosed;
                    }
                    n => {
                        if let Some(replay) = replay.as_mut() {
                            replay.append(ReplayDirection::ClientToServer, &cbuf[..n]);
                        }
                        stay.add_bytes(n as i64, 0);
                        backend_w
                            .write_all(&cbuf[..n])
                            .await
                            .map_err(|e| client_io(stay.id(), e))?;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                }
            }
            read = backend_r.read(&mut bbuf) => {
                match read.map_err(|e| client_io(stay.id(), e))? {
                    0 => {
                        let _ = client_w.shutdown().await;
                        break TerminationReason::ServerClosed;
                    }
                    n => {
                        if let Some(replay) = replay.as_mut() {
                            replay.append(ReplayDirection::ServerToClient, &bbuf[..n]);
                        }
                        stay.add_bytes(0, n as i64);
                        client_w
                            .write_all(&bbuf[..n])
                            .await
                            .map_err(|e| client_io(stay.id(), e))?;
                        idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                    }
                }
            }
            event = events.recv() => {
                if let Ok(StayEvent::Terminate { reason }) = event {
                    let _ = backend_w.shutdown().await;
                    let _ = client_w.shutdown().await;
                    break reason;
                }
            }
            () = &mut idle => {
                tracing::info!(stay_id = %stay.id(), "RDP idle cutoff");
                let _ = backend_w.shutdown().await;
                let _ = client_w.shutdown().await;
                break TerminationReason::ClientClosed;
            }
        }
    };

    if let Some(replay) = replay.as_mut() {
        replay.flush();
    }
    Ok(reason)
}

#[derive(Debug, Clone, Copy)]
enum ReplayDirection {
    ClientToServer = 0,
    ServerToClient = 1,
}

/// Direction-framed replay file: `t_ms(8) dir(1) len(4) payload`.
struct ReplayWriter {
    file: File,
}

impl ReplayWriter {
    fn create(path: &std::path::Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }

    fn append(&mut self, direction: ReplayDirection, payload: &[u8]) {
        let mut record = Vec::with_capacity(13 + payload.len());
        record.extend_from_slice(&Utc::now().timestamp_millis().to_le_bytes());
        record.push(direction as u8);
        record.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_le_bytes());
        record.extend_from_slice(payload);
        let _ = self.file.write_all(&record);
    }

    fn flush(&mut self) {
        let _ = self.file.flush();
    }
}
