//! The SSH front-end.
//!
//! One listener per proxy IP; the accepted socket's local address drives
//! destination routing. The gateway speaks SSH server-side to the client
//! with a stable host key (generated at first boot, persisted 0600) and
//! SSH client-side to the backend.

/// Backend leg: connect and authentication cascade.
pub mod backend;
/// JSONL stay recording.
pub mod recording;
/// Per-connection server handler.
pub mod session;
/// Channel splicing and gateway line injection.
pub mod splice;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::key::KeyPair;
use tokio::net::TcpStream;

use crate::audit::AuditSink;
use crate::config::Config;
use crate::core::errors::GatewayError;
use crate::core::registry::SessionRegistry;
use crate::policy::PolicyEngine;
use crate::routing::{ConnHandler, ListenerSet, RoutingTable, SuspendHandle};
use crate::ssh::session::ClientSession;

/// The SSH front-end: shared dependencies plus the server configuration.
pub struct SshFrontend {
    pub(crate) config: Arc<Config>,
    pub(crate) engine: Arc<PolicyEngine>,
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) audit: Arc<AuditSink>,
    server_config: Arc<russh::server::Config>,
}

impl std::fmt::Debug for SshFrontend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshFrontend").finish_non_exhaustive()
    }
}

impl SshFrontend {
    /// Build the front-end, loading (or generating) the host key.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the host key cannot be loaded or
    /// persisted.
    pub fn new(
        config: Arc<Config>,
        engine: Arc<PolicyEngine>,
        registry: Arc<SessionRegistry>,
        audit: Arc<AuditSink>,
    ) -> Result<Arc<Self>, GatewayError> {
        let key = load_or_generate_host_key(&config.host_key_path())?;

        let server_config = Arc::new(russh::server::Config {
            keys: vec![key],
            methods: russh::MethodSet::PUBLICKEY | russh::MethodSet::PASSWORD,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        Ok(Arc::new(Self {
            config,
            engine,
            registry,
            audit,
            server_config,
        }))
    }

    /// The listener set serving this front-end on every proxy IP.
    #[must_use]
    pub fn listener_set(self: &Arc<Self>, routing: Arc<RoutingTable>) -> Arc<ListenerSet> {
        let (suspend_tx, suspend_rx) = tokio::sync::mpsc::unbounded_channel();
        let frontend = Arc::clone(self);
        let handler: ConnHandler = Arc::new(move |stream, peer, local| {
            let frontend = Arc::clone(&frontend);
            let suspend = suspend_tx.clone();
            tokio::spawn(frontend.handle_connection(stream, peer, local, suspend));
        });
        Arc::new(ListenerSet::new(
            "ssh",
            self.config.ssh_port,
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
        tracing::debug!(%peer, %local, "SSH connection accepted");
        let handler = ClientSession::new(Arc::clone(&self), peer, local, suspend);

        match russh::server::run_stream(Arc::clone(&self.server_config), stream, handler).await {
            Ok(session) => {
                if let Err(err) = session.await {
                    tracing::debug!(%peer, error = %err, "SSH session ended with error");
                }
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "SSH handshake failed");
            }
        }
    }
}

/// Load the persisted host key, or generate an ed25519 key at first boot
/// and persist it with owner-only permissions.
fn load_or_generate_host_key(path: &Path) -> Result<KeyPair, GatewayError> {
    if path.exists() {
        return russh::keys::load_secret_key(path, None).map_err(|e| GatewayError::Config {
            what: format!("host key {}", path.display()),
            source: e.into(),
        });
    }

    let Some(key) = KeyPair::generate_ed25519() else {
        return Err(GatewayError::Config {
            what: "host key generation".to_owned(),
            source: anyhow::anyhow!("ed25519 keygen failed"),
        });
    };

    let write = || -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(path)?;
        russh::keys::encode_pkcs8_pem(&key, &mut file)?;
        crate::config::restrict_permissions(path)?;
        Ok(())
    };
    write().map_err(|e| GatewayError::Config {
        what: format!("host key {}", path.display()),
        source: e,
    })?;

    tracing::info!(path = %path.display(), "generated SSH host key");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn host_key_persists_across_boots() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("host_key");

        let first = load_or_generate_host_key(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_host_key(&path).unwrap();

        assert_eq!(
            first.clone_public_key().unwrap().fingerprint(),
            second.clone_public_key().unwrap().fingerprint(),
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
