//! Policy model and admission engine.

/// Admission decision engine and group-graph primitives.
pub mod engine;
/// Weekly recurrence windows.
pub mod schedule;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::stay::Protocol;
use crate::store::Backend;

pub use engine::{PolicyEngine, Reconfirm};
pub use schedule::WeeklySchedule;

/// Who a policy grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    /// A single person.
    Person,
    /// Everyone in a user group (and its subgroups).
    UserGroup,
}

/// What a policy grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeKind {
    /// Every backend in a server group (and its subgroups).
    ServerGroup,
    /// A single backend.
    Server,
    /// A single (backend, protocol) pair; the protocol is concrete.
    Service,
}

impl std::fmt::Display for SubjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Person => write!(f, "person"),
            Self::UserGroup => write!(f, "user_group"),
        }
    }
}

impl std::str::FromStr for SubjectKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "person" => Ok(Self::Person),
            "user_group" => Ok(Self::UserGroup),
            _ => anyhow::bail!("unknown subject kind: {s}"),
        }
    }
}

impl std::fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerGroup => write!(f, "server_group"),
            Self::Server => write!(f, "server"),
            Self::Service => write!(f, "service"),
        }
    }
}

impl std::str::FromStr for ScopeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server_group" => Ok(Self::ServerGroup),
            "server" => Ok(Self::Server),
            "service" => Ok(Self::Service),
            _ => anyhow::bail!("unknown scope kind: {s}"),
        }
    }
}

/// A time-bounded access grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Unique identifier.
    pub id: Uuid,
    /// Subject kind.
    pub subject_kind: SubjectKind,
    /// Person or user-group id, per `subject_kind`.
    pub subject_id: Uuid,
    /// Scope kind.
    pub scope_kind: ScopeKind,
    /// Server-group or backend id, per `scope_kind`.
    pub scope_id: Uuid,
    /// Granted protocol; `None` means any. Concrete when the scope is a
    /// service.
    pub protocol: Option<Protocol>,
    /// Permitted backend logins; empty means any login the backend takes.
    pub ssh_logins: Vec<String>,
    /// Optional pin to one of the subject's source-IP entries.
    pub source_ip_id: Option<Uuid>,
    /// Whether non-session SSH channels are allowed.
    pub allow_port_forwarding: bool,
    /// Validity window start.
    pub starts_at: DateTime<Utc>,
    /// Validity window end; `None` is open-ended.
    pub ends_at: Option<DateTime<Utc>>,
    /// Optional weekly recurrence inside the validity window.
    pub schedule: Option<WeeklySchedule>,
    /// Revocation flag; revoked policies never admit.
    pub active: bool,
    /// When the policy was written.
    pub created_at: DateTime<Utc>,
    /// Operator who wrote it.
    pub created_by: String,
}

impl Policy {
    /// Whether `now` lies in `[starts_at, ends_at)`.
    #[must_use]
    pub fn in_time_window(&self, now: DateTime<Utc>) -> bool {
        now >= self.starts_at && self.ends_at.is_none_or(|end| now < end)
    }

    /// Whether the backend login is permitted by this policy.
    #[must_use]
    pub fn permits_login(&self, login: &str) -> bool {
        self.ssh_logins.is_empty() || self.ssh_logins.iter().any(|l| l == login)
    }

    /// Whether this policy covers the requested protocol.
    #[must_use]
    pub fn covers_protocol(&self, protocol: Protocol) -> bool {
        self.protocol.is_none_or(|p| p == protocol)
    }

    /// Structural validity, enforced at write time.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first violated rule.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(end) = self.ends_at {
            anyhow::ensure!(end > self.starts_at, "ends_at must be after starts_at");
        }
        if self.scope_kind == ScopeKind::Service {
            anyhow::ensure!(
                self.protocol.is_some(),
                "service-scoped policies must name a concrete protocol"
            );
        }
        Ok(())
    }
}

/// Why a connection was not admitted.
///
/// Variants are ordered by specificity: the engine reports the failure
/// observed closest to admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The source IP maps to no active person.
    NoPersonForSourceIp,
    /// The proxy IP has no active allocation.
    NoBackendForProxyIp,
    /// The backend exists but is disabled.
    BackendDisabled,
    /// No policy names this person and backend at all.
    NoMatchingPolicy,
    /// A policy matched but its validity window has passed (or not begun).
    PolicyExpired,
    /// A policy matched but now is outside its weekly schedule.
    OutsideSchedule,
    /// A policy matched but not for this protocol.
    ProtocolNotAllowed,
    /// A policy matched but the requested backend login is not in its list.
    LoginNotPermitted,
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoPersonForSourceIp => "no_person_for_source_ip",
            Self::NoBackendForProxyIp => "no_backend_for_proxy_ip",
            Self::BackendDisabled => "backend_disabled",
            Self::NoMatchingPolicy => "no_matching_policy",
            Self::PolicyExpired => "policy_expired",
            Self::OutsideSchedule => "outside_schedule",
            Self::ProtocolNotAllowed => "protocol_not_allowed",
            Self::LoginNotPermitted => "login_not_permitted",
        };
        write!(f, "{s}")
    }
}

/// The positive outcome of policy evaluation.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The admitted person.
    pub person_id: Uuid,
    /// The policy that admitted.
    pub policy_id: Uuid,
    /// The routed backend.
    pub backend: Backend,
    /// Whether non-session channels are allowed.
    pub allow_port_forwarding: bool,
    /// Backend logins permitted by the policy; empty means any.
    pub ssh_login_filter: Vec<String>,
    /// The admitting policy's `ends_at`, for the expiry ticker and the
    /// shell preamble.
    pub valid_until: Option<DateTime<Utc>>,
}

/// An admission decision.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Admit with the routed backend and constraints.
    Admit(Admission),
    /// Deny with the most specific observed reason.
    Deny(DenyReason),
}

impl Decision {
    /// Whether this decision admits.
    #[must_use]
    pub const fn is_admit(&self) -> bool {
        matches!(self, Self::Admit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy {
            id: Uuid::new_v4(),
            subject_kind: SubjectKind::Person,
            subject_id: Uuid::new_v4(),
            scope_kind: ScopeKind::Server,
            scope_id: Uuid::new_v4(),
            protocol: Some(Protocol::Ssh),
            ssh_logins: vec!["postgres".into()],
            source_ip_id: None,
            allow_port_forwarding: false,
            starts_at: Utc::now() - chrono::Duration::hours(1),
            ends_at: Some(Utc::now() + chrono::Duration::hours(8)),
            schedule: None,
            active: true,
            created_at: Utc::now(),
            created_by: "ops".into(),
        }
    }

    #[test]
    fn login_filter_empty_means_any() {
        let mut p = policy();
        assert!(p.permits_login("postgres"));
        assert!(!p.permits_login("root"));
        p.ssh_logins.clear();
        assert!(p.permits_login("root"));
    }

    #[test]
    fn time_window_is_half_open() {
        let mut p = policy();
        let end = p.ends_at.unwrap();
        assert!(p.in_time_window(end - chrono::Duration::seconds(1)));
        assert!(!p.in_time_window(end));
        p.ends_at = None;
        assert!(p.in_time_window(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn service_scope_requires_concrete_protocol() {
        let mut p = policy();
        p.scope_kind = ScopeKind::Service;
        assert!(p.validate().is_ok());
        p.protocol = None;
        assert!(p.validate().is_err());
    }

    #[test]
    fn deny_reasons_order_by_specificity() {
        assert!(DenyReason::LoginNotPermitted > DenyReason::ProtocolNotAllowed);
        assert!(DenyReason::ProtocolNotAllowed > DenyReason::OutsideSchedule);
        assert!(DenyReason::OutsideSchedule > DenyReason::PolicyExpired);
        assert!(DenyReason::PolicyExpired > DenyReason::NoMatchingPolicy);
    }
}
