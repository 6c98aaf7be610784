//! Gateway error taxonomy.
//!
//! Policy denials are not errors: they are ordinary deny decisions handled
//! by the front-ends. Everything here is an actual fault, classified by how
//! far it is allowed to propagate. Only `Config` and an unrecovered
//! `InvariantViolation` may abort the process.

use std::net::IpAddr;

use thiserror::Error;
use uuid::Uuid;

/// Faults raised by the proxy runtime and control plane.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Startup configuration is missing or invalid. Fatal.
    #[error("configuration error: {what}: {source}")]
    Config {
        /// What was being configured.
        what: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The backend could not be reached or refused authentication.
    /// The stay is never opened.
    #[error("backend {backend} unreachable: {reason}")]
    BackendUnreachable {
        /// Backend name or address.
        backend: String,
        /// Connect failure, auth failure, or deadline.
        reason: String,
    },

    /// A single read or write failed mid-stay. The affected channel is
    /// closed; the stay survives while other channels are live.
    #[error("transient I/O on stay {stay_id}: {source}")]
    TransientIo {
        /// The stay the channel belonged to.
        stay_id: Uuid,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A bounded resource is full; the offending request is rejected and
    /// the system keeps serving others.
    #[error("resource exhausted: {what}")]
    ResourceExhausted {
        /// Which limit was hit.
        what: String,
    },

    /// A data invariant observed broken at runtime, e.g. two active
    /// allocations for one proxy IP. The implicated stay is torn down and
    /// the proxy IP's listeners are stopped until an operator re-binds.
    #[error("invariant violated on {proxy_ip:?}: {detail}")]
    InvariantViolation {
        /// The proxy IP implicated, when there is one.
        proxy_ip: Option<IpAddr>,
        /// What was observed.
        detail: String,
    },

    /// A control-plane verb referenced something that does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// A control-plane write conflicts with current state, e.g. rebinding
    /// a proxy IP that still carries active stays.
    #[error("conflict: {what}")]
    Conflict {
        /// The conflicting condition.
        what: String,
    },

    /// A control-plane write would break a policy-store invariant, e.g. a
    /// group cycle or an overlapping source CIDR.
    #[error("policy violation: {what}")]
    PolicyViolation {
        /// The violated rule.
        what: String,
    },

    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GatewayError {
    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 2 usage (handled by clap), 3 policy violation,
    /// 4 not found, 5 conflict, 1 other.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::PolicyViolation { .. } => 3,
            Self::NotFound { .. } => 4,
            Self::Conflict { .. } => 5,
            _ => 1,
        }
    }

    /// Whether this fault is allowed to abort the process.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::InvariantViolation { .. })
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(source: sqlx::Error) -> Self {
        Self::Other(source.into())
    }
}
