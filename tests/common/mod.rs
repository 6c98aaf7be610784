//! Shared fixtures for integration tests.

#![allow(dead_code, reason = "each test binary uses a subset of the fixtures")]

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use gatehouse::audit::{AuditSink, LocalAuditLog};
use gatehouse::config::Config;
use gatehouse::core::registry::SessionRegistry;
use gatehouse::core::stay::Protocol;
use gatehouse::policy::{Policy, PolicyEngine, ScopeKind, SubjectKind};
use gatehouse::routing::RoutingTable;
use gatehouse::store::SqliteStore;

/// A fully wired gateway core over a temp directory.
pub struct Gateway {
    pub config: Arc<Config>,
    pub store: Arc<SqliteStore>,
    pub routing: Arc<RoutingTable>,
    pub engine: Arc<PolicyEngine>,
    pub registry: Arc<SessionRegistry>,
    pub audit: Arc<AuditSink>,
    pub dir: TempDir,
}

/// Build a gateway core with every component wired the way `serve` does.
pub async fn gateway() -> Gateway {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = Arc::new(test_config(dir.path().to_path_buf()));
    config.ensure_dirs().expect("Failed to create data dirs");

    let store = Arc::new(
        SqliteStore::open(&config.db_url)
            .await
            .expect("Failed to open store"),
    );
    let routing = Arc::new(RoutingTable::new(Arc::clone(&store)));
    let engine = Arc::new(PolicyEngine::new(
        Arc::clone(&store),
        Arc::clone(&routing),
        config.decision_budget,
    ));
    let registry = SessionRegistry::new(Arc::clone(&store))
        .await
        .expect("Failed to create registry");
    let audit = Arc::new(AuditSink::new(Arc::clone(&store), LocalAuditLog::noop()));

    Gateway {
        config,
        store,
        routing,
        engine,
        registry,
        audit,
        dir,
    }
}

/// A config rooted in a temp directory, with short timeouts.
pub fn test_config(data_dir: PathBuf) -> Config {
    let db_url = format!("sqlite:{}", data_dir.join("gatehouse.db").display());
    Config {
        data_dir,
        db_url,
        ssh_port: 0,
        rdp_port: 0,
        transcode_workers: 2,
        transcode_queue_max: 10,
        transcoder_bin: PathBuf::from("replay-transcode"),
        backend_connect_timeout: Duration::from_secs(2),
        backend_auth_timeout: Duration::from_secs(2),
        decision_budget: Duration::from_millis(500),
        shell_idle_timeout: Duration::from_secs(3600),
        rdp_idle_timeout: Duration::from_secs(900),
    }
}

/// A person-scoped SSH policy with sensible defaults; tweak fields after.
pub fn ssh_policy(subject_id: Uuid, scope_kind: ScopeKind, scope_id: Uuid) -> Policy {
    Policy {
        id: Uuid::new_v4(),
        subject_kind: SubjectKind::Person,
        subject_id,
        scope_kind,
        scope_id,
        protocol: Some(Protocol::Ssh),
        ssh_logins: Vec::new(),
        source_ip_id: None,
        allow_port_forwarding: false,
        starts_at: Utc::now() - chrono::Duration::minutes(5),
        ends_at: Some(Utc::now() + chrono::Duration::hours(8)),
        schedule: None,
        active: true,
        created_at: Utc::now(),
        created_by: "tests".to_owned(),
    }
}

pub fn ip(text: &str) -> IpAddr {
    text.parse().expect("bad test ip")
}
