//! Persistent policy store: record types and the SQLite implementation.
//!
//! Each aggregate (directory, allocations, policies, stays, audit,
//! transcode) gets a thin repository over the shared pool; lifecycle
//! transitions live on the record types themselves.

pub mod sqlite;

use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::stay::Protocol;

pub use sqlite::SqliteStore;

/// The subject of accountability. Soft-deleted while referenced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Person {
    /// Unique identifier.
    pub id: Uuid,
    /// Short unique login-style handle.
    pub handle: String,
    /// Human-readable name.
    pub display_name: String,
    /// Contact address.
    pub email: String,
    /// Soft-delete flag.
    pub active: bool,
}

/// A source address (or CIDR) tied to exactly one active person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceIp {
    /// Unique identifier.
    pub id: Uuid,
    /// The owning person.
    pub person_id: Uuid,
    /// Host address or CIDR block.
    pub cidr: IpNet,
    /// Operator label ("office vpn", ...).
    pub label: String,
    /// Soft-delete flag.
    pub active: bool,
}

impl SourceIp {
    /// Whether this entry covers `ip`.
    #[must_use]
    pub fn covers(&self, ip: IpAddr) -> bool {
        self.cidr.contains(&ip)
    }
}

/// A real target host behind the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backend {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique operator-facing name.
    pub name: String,
    /// Host address (name or IP).
    pub address: String,
    /// Non-default service port; `None` uses the protocol default.
    pub port: Option<u16>,
    /// Whether SSH is offered.
    pub ssh_enabled: bool,
    /// Whether RDP is offered.
    pub rdp_enabled: bool,
    /// Soft-delete flag.
    pub active: bool,
}

impl Backend {
    /// Whether the backend offers the protocol.
    #[must_use]
    pub const fn supports(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Ssh => self.ssh_enabled,
            Protocol::Rdp => self.rdp_enabled,
        }
    }

    /// The `(host, port)` pair to dial for a protocol.
    #[must_use]
    pub fn target_for(&self, protocol: Protocol) -> (String, u16) {
        (
            self.address.clone(),
            self.port.unwrap_or_else(|| protocol.default_port()),
        )
    }
}

/// A proxy-IP → backend binding. The routing table is the set of
/// allocations with `released_at = NULL`; at most one per proxy IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Row id.
    pub id: i64,
    /// The gateway-owned listening address.
    pub proxy_ip: IpAddr,
    /// The backend it routes to.
    pub backend_id: Uuid,
    /// When the binding was created.
    pub created_at: DateTime<Utc>,
    /// When it was released; active while `None`.
    pub released_at: Option<DateTime<Utc>>,
}

/// Which of the two group trees a graph operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Groups of backends.
    Server,
    /// Groups of persons.
    User,
}

/// A node in one of the two group trees. Trees are cycle-free with
/// maximum depth 10, enforced at write time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique name within its tree.
    pub name: String,
    /// Parent node, `None` at a root.
    pub parent_id: Option<Uuid>,
}

/// What an audit row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// An admission decision (admitted or denied).
    Admission,
    /// A stay reaching its end.
    StayClosed,
    /// A policy created or revoked.
    PolicyWrite,
    /// A proxy IP bound or released.
    AllocationChange,
}

impl std::fmt::Display for AuditKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Admission => "admission",
            Self::StayClosed => "stay_closed",
            Self::PolicyWrite => "policy_write",
            Self::AllocationChange => "allocation_change",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for AuditKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admission" => Ok(Self::Admission),
            "stay_closed" => Ok(Self::StayClosed),
            "policy_write" => Ok(Self::PolicyWrite),
            "allocation_change" => Ok(Self::AllocationChange),
            _ => anyhow::bail!("unknown audit kind: {s}"),
        }
    }
}

/// An append-only audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Row id.
    pub id: i64,
    /// When the event happened.
    pub at: DateTime<Utc>,
    /// Person handle or operator identity, when known.
    pub actor: Option<String>,
    /// Event kind.
    pub kind: AuditKind,
    /// Source IP of the connection, for proxy events.
    pub source_ip: Option<IpAddr>,
    /// Backend involved, when resolved.
    pub backend_id: Option<Uuid>,
    /// Protocol involved, for proxy events.
    pub protocol: Option<Protocol>,
    /// Whether the event admitted access.
    pub admitted: bool,
    /// Deny reason, termination reason, or write verb.
    pub reason: String,
    /// Free-form context.
    pub detail: String,
}

/// A not-yet-persisted audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAudit {
    /// Person handle or operator identity, when known.
    pub actor: Option<String>,
    /// Event kind.
    pub kind: AuditKind,
    /// Source IP of the connection, for proxy events.
    pub source_ip: Option<IpAddr>,
    /// Backend involved, when resolved.
    pub backend_id: Option<Uuid>,
    /// Protocol involved, for proxy events.
    pub protocol: Option<Protocol>,
    /// Whether the event admitted access.
    pub admitted: bool,
    /// Deny reason, termination reason, or write verb.
    pub reason: String,
    /// Free-form context.
    pub detail: String,
}

/// Filter for audit queries; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    /// Inclusive lower time bound.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    pub to: Option<DateTime<Utc>>,
    /// Exact source IP.
    pub source_ip: Option<IpAddr>,
    /// Exact actor.
    pub actor: Option<String>,
    /// Exact backend.
    pub backend_id: Option<Uuid>,
}

/// Lifecycle of a transcode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting for a worker.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Finished; `output_path` is set.
    Done,
    /// Aborted; `error` is set.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => anyhow::bail!("unknown job status: {s}"),
        }
    }
}

/// A queued `.replay → .mp4` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeJob {
    /// Row id, also the queue position tiebreaker.
    pub id: i64,
    /// The RDP stay whose replay is transcoded.
    pub stay_id: Uuid,
    /// Queue status.
    pub status: JobStatus,
    /// Nonzero jumps the FIFO; ties break by `created_at`.
    pub priority: i64,
    /// Frames done.
    pub progress: i64,
    /// Total frames, once known.
    pub total: i64,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<i64>,
    /// Final MP4 location on success.
    pub output_path: Option<PathBuf>,
    /// Last error line on failure.
    pub error: Option<String>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
    /// Claim time.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion or failure time.
    pub finished_at: Option<DateTime<Utc>>,
}
