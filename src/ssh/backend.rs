//! The SSH client leg toward the backend.
//!
//! Authentication cascade: a forwarded agent signs first when the client
//! requested agent forwarding; otherwise the password the client supplied
//! is replayed with the login the client asked for. Host keys of backends
//! are accepted as-is (backends are operator-controlled; identity is
//! established by the allocation, not by the backend's key).

use std::sync::Arc;
use std::time::Duration;

use russh::keys::agent::client::AgentClient;
use russh::keys::key::PublicKey;
use russh::{ChannelStream, client, server};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::core::errors::GatewayError;
use crate::core::stay::Protocol;
use crate::store::Backend;

/// Stream type of the agent channel opened back to the client.
pub type ForwardedAgent = AgentClient<ChannelStream<server::Msg>>;

/// russh client handler for the backend leg.
#[derive(Debug)]
pub struct BackendClient;

#[async_trait::async_trait]
impl client::Handler for BackendClient {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Credential material collected from the client side.
pub struct BackendCredentials<'a> {
    /// The backend login the client requested.
    pub login: &'a str,
    /// Password buffered during client auth, if any.
    pub password: Option<&'a str>,
    /// Agent connection over the client's forwarded-agent channel.
    pub agent: Option<ForwardedAgent>,
}

impl std::fmt::Debug for BackendCredentials<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCredentials")
            .field("login", &self.login)
            .field("has_password", &self.password.is_some())
            .field("has_agent", &self.agent.is_some())
            .finish()
    }
}

/// Dial the backend and run the authentication cascade.
///
/// # Errors
///
/// [`GatewayError::BackendUnreachable`] on connect failure, auth failure,
/// or either deadline.
pub async fn connect_and_auth(
    backend: &Backend,
    credentials: BackendCredentials<'_>,
    connect_timeout: Duration,
    auth_timeout: Duration,
) -> Result<client::Handle<BackendClient>, GatewayError> {
    let (host, port) = backend.target_for(Protocol::Ssh);

    let stream = timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| unreachable_err(backend, format!("connect timeout after {connect_timeout:?}")))?
        .map_err(|e| unreachable_err(backend, format!("connect failed: {e}")))?;

    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, stream, BackendClient)
        .await
        .map_err(|e| unreachable_err(backend, format!("handshake failed: {e}")))?;

    timeout(auth_timeout, run_cascade(&mut handle, backend, credentials))
        .await
        .map_err(|_| unreachable_err(backend, format!("auth timeout after {auth_timeout:?}")))??;

    Ok(handle)
}

async fn run_cascade(
    handle: &mut client::Handle<BackendClient>,
    backend: &Backend,
    credentials: BackendCredentials<'_>,
) -> Result<(), GatewayError> {
    // 1. Forwarded agent, each offered identity in order.
    if let Some(mut agent) = credentials.agent {
        let identities = match agent.request_identities().await {
            Ok(identities) => identities,
            Err(e) => {
                tracing::debug!(backend = %backend.name, error = %e, "agent listing failed");
                Vec::new()
            }
        };

        for key in identities {
            let (returned, result) = handle
                .authenticate_future(credentials.login, key, agent)
                .await;
            agent = returned;
            match result {
                Ok(true) => {
                    tracing::debug!(backend = %backend.name, "agent auth accepted");
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(backend = %backend.name, error = %e, "agent signature failed");
                }
            }
        }
    }

    // 2. The password the client gave us, under the client's login.
    if let Some(password) = credentials.password {
        let accepted = handle
            .authenticate_password(credentials.login, password)
            .await
            .map_err(|e| unreachable_err(backend, format!("password auth errored: {e}")))?;
        if accepted {
            tracing::debug!(backend = %backend.name, "password auth accepted");
            return Ok(());
        }
    }

    Err(unreachable_err(
        backend,
        format!("no credential accepted for login '{}'", credentials.login),
    ))
}

fn unreachable_err(backend: &Backend, reason: String) -> GatewayError {
    GatewayError::BackendUnreachable {
        backend: backend.name.clone(),
        reason,
    }
}
