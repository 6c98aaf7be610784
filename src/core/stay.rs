//! Stay and session domain model.
//!
//! A *stay* is the authoritative record of one person being inside one
//! backend under one policy, possibly spanning several TCP connections.
//! A *session* is a single connection (or SSH channel) within a stay.

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Wire protocol of a stay or policy grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// SSH version 2.
    Ssh,
    /// RDP with TLS on both legs.
    Rdp,
}

impl Protocol {
    /// Default service port on the backend.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Ssh => 22,
            Self::Rdp => 3389,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ssh => write!(f, "ssh"),
            Self::Rdp => write!(f, "rdp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ssh" => Ok(Self::Ssh),
            "rdp" => Ok(Self::Rdp),
            _ => anyhow::bail!("unknown protocol: {s}"),
        }
    }
}

/// Why a stay ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The operator's client hung up.
    ClientClosed,
    /// The backend hung up.
    ServerClosed,
    /// The admitting policy ran out.
    PolicyExpired,
    /// The admitting policy was revoked by an operator.
    Revoked,
    /// An unrecoverable fault (including gateway shutdown).
    Error,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ClientClosed => "client_closed",
            Self::ServerClosed => "server_closed",
            Self::PolicyExpired => "policy_expired",
            Self::Revoked => "revoked",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TerminationReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client_closed" => Ok(Self::ClientClosed),
            "server_closed" => Ok(Self::ServerClosed),
            "policy_expired" => Ok(Self::PolicyExpired),
            "revoked" => Ok(Self::Revoked),
            "error" => Ok(Self::Error),
            _ => anyhow::bail!("unknown termination reason: {s}"),
        }
    }
}

/// What a single session inside a stay carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Interactive shell channel.
    Shell,
    /// One-shot command execution.
    Exec,
    /// SFTP subsystem.
    Sftp,
    /// Local forward (`-L`).
    DirectTcpip,
    /// Remote forward (`-R`), listener bound on the proxy IP.
    ForwardedTcpip,
    /// Dynamic SOCKS forward, seen as a series of direct-tcpip opens.
    Dynamic,
    /// One RDP TCP sub-connection.
    Rdp,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Shell => "shell",
            Self::Exec => "exec",
            Self::Sftp => "sftp",
            Self::DirectTcpip => "direct_tcpip",
            Self::ForwardedTcpip => "forwarded_tcpip",
            Self::Dynamic => "dynamic",
            Self::Rdp => "rdp",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for SessionKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Self::Shell),
            "exec" => Ok(Self::Exec),
            "sftp" => Ok(Self::Sftp),
            "direct_tcpip" => Ok(Self::DirectTcpip),
            "forwarded_tcpip" => Ok(Self::ForwardedTcpip),
            "dynamic" => Ok(Self::Dynamic),
            "rdp" => Ok(Self::Rdp),
            _ => anyhow::bail!("unknown session kind: {s}"),
        }
    }
}

/// The durable record of an admitted connection's lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stay {
    /// Unique identifier.
    pub id: Uuid,

    /// The admitted person.
    pub person_id: Uuid,

    /// The policy that admitted the stay at `started_at`.
    pub policy_id: Uuid,

    /// The backend the stay is proxied to.
    pub backend_id: Uuid,

    /// Protocol spoken.
    pub protocol: Protocol,

    /// The operator's source IP.
    pub source_ip: IpAddr,

    /// The gateway proxy IP the client connected to.
    pub proxy_ip: IpAddr,

    /// When the stay was admitted.
    pub started_at: DateTime<Utc>,

    /// When the stay closed; the stay is active while this is `None`.
    pub ends_at: Option<DateTime<Utc>>,

    /// Why the stay closed, set together with `ends_at`.
    pub termination_reason: Option<TerminationReason>,

    /// Recording file, attached once the first byte is written.
    pub recording_path: Option<PathBuf>,

    /// Final recording size in bytes.
    pub recording_bytes: i64,

    /// Bytes from the client toward the backend.
    pub bytes_in: i64,

    /// Bytes from the backend toward the client.
    pub bytes_out: i64,
}

impl Stay {
    /// Open a new stay record. `ends_at` and `termination_reason` start
    /// `NULL` and are set exactly once at close.
    #[must_use]
    pub fn open(
        person_id: Uuid,
        policy_id: Uuid,
        backend_id: Uuid,
        protocol: Protocol,
        source_ip: IpAddr,
        proxy_ip: IpAddr,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            person_id,
            policy_id,
            backend_id,
            protocol,
            source_ip,
            proxy_ip,
            started_at: Utc::now(),
            ends_at: None,
            termination_reason: None,
            recording_path: None,
            recording_bytes: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    /// Whether the stay is still live.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ends_at.is_none()
    }

    /// Transition to closed. Idempotent: the first reason wins.
    pub fn close(&mut self, reason: TerminationReason) {
        if self.ends_at.is_none() {
            self.ends_at = Some(Utc::now());
            self.termination_reason = Some(reason);
        }
    }

    /// Attach the recording file path once the first byte lands.
    pub fn attach_recording(&mut self, path: PathBuf) {
        self.recording_path = Some(path);
    }
}

/// One TCP connection (or SSH channel) inside a stay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaySession {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning stay.
    pub stay_id: Uuid,
    /// What the session carries.
    pub kind: SessionKind,
    /// When the session opened.
    pub started_at: DateTime<Utc>,
    /// When it ended; active while `None`.
    pub ended_at: Option<DateTime<Utc>>,
}

impl StaySession {
    /// Open a session under a stay.
    #[must_use]
    pub fn open(stay_id: Uuid, kind: SessionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            stay_id,
            kind,
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent_first_reason_wins() {
        let mut stay = Stay::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Protocol::Ssh,
            "100.64.0.20".parse().unwrap(),
            "10.0.160.129".parse().unwrap(),
        );
        assert!(stay.is_active());

        stay.close(TerminationReason::PolicyExpired);
        stay.close(TerminationReason::ClientClosed);

        assert!(!stay.is_active());
        assert_eq!(
            stay.termination_reason,
            Some(TerminationReason::PolicyExpired)
        );
    }

    #[test]
    fn reason_round_trips_through_text() {
        for reason in [
            TerminationReason::ClientClosed,
            TerminationReason::ServerClosed,
            TerminationReason::PolicyExpired,
            TerminationReason::Revoked,
            TerminationReason::Error,
        ] {
            let text = reason.to_string();
            assert_eq!(text.parse::<TerminationReason>().unwrap(), reason);
        }
    }

    #[test]
    fn protocol_default_ports() {
        assert_eq!(Protocol::Ssh.default_port(), 22);
        assert_eq!(Protocol::Rdp.default_port(), 3389);
    }
}
