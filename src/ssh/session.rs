//! Per-connection SSH server handler.
//!
//! Identity is already established by the source IP, so client auth is a
//! formality: any offered public key is accepted as a placeholder, and a
//! password is accepted and buffered for the backend cascade. The
//! admission decision is taken at auth time (the requested login is part
//! of it) and a denial surfaces as an `ACCESS DENIED` banner on the first
//! channel, after which the connection closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use russh::keys::agent::client::AgentClient;
use russh::keys::key::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, Pty, client};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::errors::GatewayError;
use crate::core::registry::StayHandle;
use crate::core::stay::{Protocol, SessionKind, TerminationReason};
use crate::policy::{Decision, DenyReason};
use crate::routing::SuspendHandle;
use crate::ssh::SshFrontend;
use crate::ssh::backend::{self, BackendClient, BackendCredentials};
use crate::ssh::recording::Recorder;
use crate::ssh::splice::{ChannelControl, SessionSplice, splice_counted};
use crate::store::{AuditKind, NewAudit};

struct PtyRequest {
    term: String,
    col_width: u32,
    row_height: u32,
    pix_width: u32,
    pix_height: u32,
    modes: Vec<(Pty, u32)>,
}

struct PendingChannel {
    server: Option<Channel<Msg>>,
    pty: Option<PtyRequest>,
    control: Option<mpsc::Sender<ChannelControl>>,
    no: u32,
}

/// Handler state for one accepted TCP connection.
pub(crate) struct ClientSession {
    frontend: Arc<SshFrontend>,
    peer: SocketAddr,
    local: SocketAddr,
    suspend: SuspendHandle,
    login: Option<String>,
    password: Option<String>,
    decision: Option<Decision>,
    stay: Option<StayHandle>,
    recorder: Option<Arc<Recorder>>,
    backend: Option<client::Handle<BackendClient>>,
    agent_requested: bool,
    channels: HashMap<ChannelId, PendingChannel>,
    channel_seq: u32,
    forwards: HashMap<(String, u32), JoinHandle<()>>,
}

impl ClientSession {
    pub(crate) fn new(
        frontend: Arc<SshFrontend>,
        peer: SocketAddr,
        local: SocketAddr,
        suspend: SuspendHandle,
    ) -> Self {
        Self {
            frontend,
            peer,
            local,
            suspend,
            login: None,
            password: None,
            decision: None,
            stay: None,
            recorder: None,
            backend: None,
            agent_requested: false,
            channels: HashMap::new(),
            channel_seq: 0,
            forwards: HashMap::new(),
        }
    }

    /// Decide once per connection, at the first auth attempt; the login
    /// the client asks for is part of the decision.
    async fn register_login(&mut self, user: &str) -> Result<(), anyhow::Error> {
        if self.decision.is_some() {
            return Ok(());
        }
        self.login = Some(user.to_owned());

        let decision = match self
            .frontend
            .engine
            .decide(self.peer.ip(), self.local.ip(), Protocol::Ssh, Some(user))
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                if let GatewayError::InvariantViolation { proxy_ip, .. } = &err {
                    // Take the implicated proxy IP out of service until
                    // an operator re-binds it.
                    let _ = self.suspend.send(proxy_ip.unwrap_or_else(|| self.local.ip()));
                }
                return Err(err.into());
            }
        };

        if let Decision::Deny(reason) = &decision {
            tracing::info!(
                src = %self.peer.ip(),
                proxy_ip = %self.local.ip(),
                login = user,
                %reason,
                "SSH connection denied"
            );
            self.frontend.audit.deny(
                self.peer.ip(),
                None,
                Protocol::Ssh,
                *reason,
                format!("login '{user}' on {}", self.local.ip()),
            );
        }

        self.decision = Some(decision);
        Ok(())
    }

    fn next_channel_no(&mut self) -> u32 {
        let no = self.channel_seq;
        self.channel_seq += 1;
        no
    }

    /// Lazily dial and authenticate the backend, then open the stay.
    /// Deferred to the first channel request so the agent-forwarding flag
    /// (which arrives after auth) is known.
    async fn ensure_backend(&mut self, server_handle: &server::Handle) -> Result<(), GatewayError> {
        if self.backend.is_some() {
            return Ok(());
        }

        let Some(Decision::Admit(admission)) = self.decision.clone() else {
            return Err(GatewayError::Other(anyhow::anyhow!(
                "channel request before admission"
            )));
        };
        let login = self.login.clone().unwrap_or_default();

        let agent = if self.agent_requested {
            match server_handle.channel_open_agent().await {
                Ok(channel) => Some(AgentClient::connect(channel.into_stream())),
                Err(err) => {
                    tracing::debug!(error = %err, "client agent channel failed to open");
                    None
                }
            }
        } else {
            None
        };

        let handle = backend::connect_and_auth(
            &admission.backend,
            BackendCredentials {
                login: &login,
                password: self.password.as_deref(),
                agent,
            },
            self.frontend.config.backend_connect_timeout,
            self.frontend.config.backend_auth_timeout,
        )
        .await?;

        let stay = self
            .frontend
            .registry
            .open(
                &admission,
                Protocol::Ssh,
                self.peer.ip(),
                self.local.ip(),
                Some(login),
                &admission.person_id.to_string(),
            )
            .await?;

        let recorder = Recorder::create(self.frontend.config.ssh_recording_path(stay.id()))
            .map_err(GatewayError::Other)?;

        self.backend = Some(handle);
        self.stay = Some(stay);
        self.recorder = Some(Arc::new(recorder));
        Ok(())
    }

    fn stay_and_recorder(&self) -> Option<(StayHandle, Arc<Recorder>)> {
        Some((self.stay.clone()?, Arc::clone(self.recorder.as_ref()?)))
    }

    /// Start a shell/exec/subsystem channel: open the backend twin,
    /// replay the buffered pty, fire the request, hand both channels to a
    /// splice task.
    async fn start_session_channel(
        &mut self,
        channel_id: ChannelId,
        session: &mut Session,
        kind: SessionKind,
        exec_command: Option<Vec<u8>>,
    ) -> Result<(), anyhow::Error> {
        let server_handle = session.handle();

        if let Err(err) = self.ensure_backend(&server_handle).await {
            tracing::info!(src = %self.peer.ip(), error = %err, "backend leg failed");
            self.frontend.audit.record_detached(NewAudit {
                actor: self.login.clone(),
                kind: AuditKind::Admission,
                source_ip: Some(self.peer.ip()),
                backend_id: None,
                protocol: Some(Protocol::Ssh),
                admitted: false,
                reason: "backend_unreachable".to_owned(),
                detail: err.to_string(),
            });
            if let Some(pending) = self.channels.get_mut(&channel_id) {
                if let Some(channel) = pending.server.take() {
                    let banner = backend_failure_banner(self.peer.ip());
                    tokio::spawn(async move {
                        let _ = channel.data(banner.as_bytes()).await;
                        let _ = channel.eof().await;
                        let _ = channel.close().await;
                    });
                }
            }
            return Ok(());
        }

        let Some((stay, recorder)) = self.stay_and_recorder() else {
            return Ok(());
        };
        let Some(pending) = self.channels.get_mut(&channel_id) else {
            return Ok(());
        };
        let Some(server_channel) = pending.server.take() else {
            return Ok(());
        };

        let backend_channel = {
            let Some(backend_handle) = self.backend.as_mut() else {
                return Ok(());
            };
            let backend_channel = backend_handle.channel_open_session().await?;
            if let Some(pty) = &pending.pty {
                backend_channel
                    .request_pty(
                        false,
                        &pty.term,
                        pty.col_width,
                        pty.row_height,
                        pty.pix_width,
                        pty.pix_height,
                        &pty.modes,
                    )
                    .await?;
            }
            match (kind, &exec_command) {
                (SessionKind::Exec, Some(command)) => {
                    backend_channel.exec(false, command.clone()).await?;
                }
                (SessionKind::Sftp, _) => {
                    backend_channel.request_subsystem(false, "sftp").await?;
                }
                _ => {
                    backend_channel.request_shell(false).await?;
                }
            }
            backend_channel
        };

        session.channel_success(channel_id);

        let session_id = stay.open_session(kind).await?;
        let channel_no = pending.no;
        let interactive = kind == SessionKind::Shell;

        recorder.open(
            channel_no,
            &exec_command.as_ref().map_or_else(
                || kind.to_string(),
                |cmd| format!("{} {}", kind, String::from_utf8_lossy(cmd)),
            ),
        );

        let (control_tx, control_rx) = mpsc::channel(8);
        pending.control = Some(control_tx);

        let preamble = interactive.then(|| {
            let until = stay.live().valid_until().map_or_else(
                || "no expiry".to_owned(),
                |at| at.format("%Y-%m-%d %H:%M UTC").to_string(),
            );
            format!("[gateway] session is recorded; access until {until}\r\n")
        });

        let splice = SessionSplice {
            client: server_channel,
            backend: backend_channel,
            stay: stay.clone(),
            channel_no,
            recorder,
            record_payload: interactive,
            interactive,
            preamble,
            idle_timeout: interactive.then_some(self.frontend.config.shell_idle_timeout),
            control: control_rx,
        };

        tokio::spawn(async move {
            let reason = splice.run().await;
            tracing::debug!(session_id = %session_id, %reason, "channel closed");
            let _ = stay.close_session(session_id).await;
        });

        Ok(())
    }
}

#[async_trait::async_trait]
impl server::Handler for ClientSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, _key: &PublicKey) -> Result<Auth, Self::Error> {
        // Any key is accepted as an identity placeholder; the backend
        // cascade decides whether the connection actually goes through.
        self.register_login(user).await?;
        Ok(Auth::Accept)
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        self.password = Some(password.to_owned());
        self.register_login(user).await?;
        Ok(Auth::Accept)
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        tracing::debug!(src = %self.peer.ip(), login = ?self.login, "client authenticated");
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        match &self.decision {
            Some(Decision::Admit(_)) => {
                let no = self.next_channel_no();
                self.channels.insert(
                    channel.id(),
                    PendingChannel {
                        server: Some(channel),
                        pty: None,
                        control: None,
                        no,
                    },
                );
                Ok(true)
            }
            Some(Decision::Deny(reason)) => {
                // Accept the channel just long enough to show the banner;
                // the channel close sends the client on its way.
                let banner = deny_banner(self.peer.ip(), *reason);
                tokio::spawn(async move {
                    let channel = channel;
                    let _ = channel.data(banner.as_bytes()).await;
                    let _ = channel.eof().await;
                    let _ = channel.close().await;
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[allow(clippy::too_many_arguments, reason = "russh handler signature")]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(pending) = self.channels.get_mut(&channel) {
            pending.pty = Some(PtyRequest {
                term: term.to_owned(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            });
            session.channel_success(channel);
        }
        Ok(())
    }

    async fn agent_request(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.agent_requested = true;
        Ok(true)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session_channel(channel, session, SessionKind::Shell, None)
            .await
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_session_channel(channel, session, SessionKind::Exec, Some(data.to_vec()))
            .await
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let kind = if name == "sftp" {
            SessionKind::Sftp
        } else {
            SessionKind::Exec
        };
        self.start_session_channel(channel, session, kind, None).await
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(control) = self.channels.get(&channel).and_then(|p| p.control.as_ref()) {
            let _ = control
                .send(ChannelControl::WindowChange {
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                })
                .await;
        }
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(Decision::Admit(admission)) = &self.decision else {
            return Ok(false);
        };
        if !admission.allow_port_forwarding {
            tracing::info!(src = %self.peer.ip(), "direct-tcpip refused: forwarding not granted");
            return Ok(false);
        }

        let server_handle = session.handle();
        if self.ensure_backend(&server_handle).await.is_err() {
            return Ok(false);
        }
        let Some((stay, recorder)) = self.stay_and_recorder() else {
            return Ok(false);
        };

        let Some(backend_handle) = self.backend.as_mut() else {
            return Ok(false);
        };
        let backend_channel = match backend_handle
            .channel_open_direct_tcpip(
                host_to_connect,
                port_to_connect,
                originator_address,
                originator_port,
            )
            .await
        {
            Ok(channel) => channel,
            Err(err) => {
                tracing::debug!(error = %err, "backend refused direct-tcpip");
                return Ok(false);
            }
        };

        let no = self.next_channel_no();
        recorder.open(no, &format!("direct-tcpip {host_to_connect}:{port_to_connect}"));

        tokio::spawn(async move {
            let Ok(session_id) = stay.open_session(SessionKind::DirectTcpip).await else {
                return;
            };
            let outcome = splice_counted(channel.into_stream(), backend_channel.into_stream(), &stay)
                .await;
            match outcome {
                Ok(reason) => recorder.close(no, &reason.to_string()),
                Err(err) => recorder.close(no, &format!("io error: {err}")),
            }
            let _ = stay.close_session(session_id).await;
        });

        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(Decision::Admit(admission)) = &self.decision else {
            return Ok(false);
        };
        if !admission.allow_port_forwarding {
            tracing::info!(src = %self.peer.ip(), "tcpip-forward refused: forwarding not granted");
            return Ok(false);
        }

        let server_handle = session.handle();
        if self.ensure_backend(&server_handle).await.is_err() {
            return Ok(false);
        }
        let Some((stay, recorder)) = self.stay_and_recorder() else {
            return Ok(false);
        };

        // The listener binds the proxy IP, so two backends may hold the
        // same remote port on different proxy IPs.
        let requested = u16::try_from(*port).unwrap_or(0);
        let listener = match tokio::net::TcpListener::bind((self.local.ip(), requested)).await {
            Ok(listener) => listener,
            Err(err) => {
                tracing::info!(proxy_ip = %self.local.ip(), port = requested, error = %err, "remote forward bind failed");
                return Ok(false);
            }
        };
        let bound_port = u32::from(listener.local_addr().map(|a| a.port()).unwrap_or(requested));
        *port = bound_port;

        let no = self.next_channel_no();
        recorder.open(no, &format!("tcpip-forward {address}:{bound_port}"));

        let forward_address = address.to_owned();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, peer)) = listener.accept().await else {
                    break;
                };
                let channel = match server_handle
                    .channel_open_forwarded_tcpip(
                        forward_address.clone(),
                        bound_port,
                        peer.ip().to_string(),
                        u32::from(peer.port()),
                    )
                    .await
                {
                    Ok(channel) => channel,
                    Err(err) => {
                        tracing::debug!(error = %err, "forwarded-tcpip open refused");
                        break;
                    }
                };
                let stay = stay.clone();
                tokio::spawn(async move {
                    let Ok(session_id) = stay.open_session(SessionKind::ForwardedTcpip).await
                    else {
                        return;
                    };
                    let _ = splice_counted(stream, channel.into_stream(), &stay).await;
                    let _ = stay.close_session(session_id).await;
                });
            }
        });
        self.forwards.insert((address.to_owned(), bound_port), task);

        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if let Some(task) = self.forwards.remove(&(address.to_owned(), port)) {
            task.abort();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        for (_, task) in self.forwards.drain() {
            task.abort();
        }
        if let Some(stay) = self.stay.take() {
            // The TCP connection is gone; close the stay off-task.
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(err) = stay.finish(TerminationReason::ClientClosed).await {
                        tracing::warn!(stay_id = %stay.id(), error = %err, "stay close failed");
                    }
                });
            }
        }
    }
}

/// The plain-text deny banner: minimum ~60 columns, the words
/// `ACCESS DENIED`, the source IP, and the reason enum value.
#[must_use]
pub fn deny_banner(source_ip: std::net::IpAddr, reason: DenyReason) -> String {
    let width = 62;
    let bar = "*".repeat(width);
    let center = |text: &str| {
        let pad = width.saturating_sub(2 + text.len());
        let left = pad / 2;
        format!("*{}{}{}*", " ".repeat(left + 1), text, " ".repeat(pad - left - 1))
    };
    format!(
        "\r\n{bar}\r\n{}\r\n{}\r\n{}\r\n{bar}\r\n",
        center("ACCESS DENIED"),
        center(&format!("source: {source_ip}")),
        center(&format!("reason: {reason}")),
    )
}

fn backend_failure_banner(source_ip: std::net::IpAddr) -> String {
    format!(
        "\r\n[gateway] backend authentication failed for connection from {source_ip}\r\n\
         [gateway] the target host refused the forwarded credentials\r\n",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deny_banner_contains_required_fields() {
        let banner = deny_banner("100.64.0.20".parse().unwrap(), DenyReason::LoginNotPermitted);
        assert!(banner.contains("ACCESS DENIED"));
        assert!(banner.contains("100.64.0.20"));
        assert!(banner.contains("login_not_permitted"));
        // Every banner line is at least 60 columns wide.
        for line in banner.lines().filter(|l| !l.is_empty()) {
            assert!(line.trim_end().len() >= 60, "narrow line: {line:?}");
        }
    }
}
