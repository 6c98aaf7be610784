//! The audit sink.
//!
//! Every admission decision, stay close, policy write, and allocation
//! change produces exactly one append-only row. Control-plane writes put
//! their row in the same transaction as the write itself (see the store
//! repositories); proxy-path decisions that must never block go through
//! [`AuditSink::record_detached`], which falls back to a local JSONL log
//! when the database is unavailable.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::core::errors::GatewayError;
use crate::core::stay::Protocol;
use crate::policy::DenyReason;
use crate::store::{AuditKind, AuditQuery, AuditRecord, NewAudit, SqliteStore};

/// Best-effort local JSONL audit log, used when a proxy-path row cannot
/// reach the database.
pub struct LocalAuditLog {
    file: Mutex<Option<File>>,
    path: PathBuf,
}

impl std::fmt::Debug for LocalAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAuditLog")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LocalAuditLog {
    /// Open (or create) the fallback log, creating parent directories.
    ///
    /// # Errors
    ///
    /// Propagates file-system errors.
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
        })
    }

    /// A no-op log for tests.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            file: Mutex::new(None),
            path: PathBuf::new(),
        }
    }

    /// Append one entry as a JSON line and flush it.
    ///
    /// # Errors
    ///
    /// Propagates serialization and IO errors.
    pub fn log(&self, entry: &NewAudit) -> anyhow::Result<()> {
        let mut guard = self
            .file
            .lock()
            .map_err(|e| anyhow::anyhow!("lock error: {e}"))?;

        if let Some(file) = guard.as_mut() {
            let mut value = serde_json::to_value(entry)?;
            if let Some(map) = value.as_object_mut() {
                map.insert("at".to_owned(), Utc::now().to_rfc3339().into());
            }
            writeln!(file, "{value}")?;
            file.flush()?;
        }

        Ok(())
    }

    /// The fallback log path.
    #[must_use]
    pub const fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Writes audit rows and answers audit queries.
pub struct AuditSink {
    store: Arc<SqliteStore>,
    fallback: LocalAuditLog,
}

impl std::fmt::Debug for AuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditSink").finish_non_exhaustive()
    }
}

impl AuditSink {
    /// Create a sink over the store with a local fallback log.
    #[must_use]
    pub const fn new(store: Arc<SqliteStore>, fallback: LocalAuditLog) -> Self {
        Self { store, fallback }
    }

    /// Append one row, waiting for the database.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn record(&self, entry: NewAudit) -> Result<i64, GatewayError> {
        self.store.audit().insert(&entry).await
    }

    /// Append one row without blocking the caller. On database failure
    /// the entry lands in the local JSONL log instead of being lost.
    pub fn record_detached(self: &Arc<Self>, entry: NewAudit) {
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = sink.store.audit().insert(&entry).await {
                tracing::warn!(error = %err, "audit row fell back to local log");
                if let Err(err) = sink.fallback.log(&entry) {
                    tracing::error!(error = %err, "audit fallback write failed");
                }
            }
        });
    }

    /// One denied-connection row. Exactly one row per denied TCP accept.
    pub fn deny(
        self: &Arc<Self>,
        source_ip: IpAddr,
        backend_id: Option<Uuid>,
        protocol: Protocol,
        reason: DenyReason,
        detail: String,
    ) {
        self.record_detached(NewAudit {
            actor: None,
            kind: AuditKind::Admission,
            source_ip: Some(source_ip),
            backend_id,
            protocol: Some(protocol),
            admitted: false,
            reason: reason.to_string(),
            detail,
        });
    }

    /// Query rows by time range, source IP, actor, or backend.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>, GatewayError> {
        self.store.audit().query(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry() -> NewAudit {
        NewAudit {
            actor: None,
            kind: AuditKind::Admission,
            source_ip: Some("100.64.0.20".parse().unwrap()),
            backend_id: None,
            protocol: Some(Protocol::Ssh),
            admitted: false,
            reason: "login_not_permitted".to_owned(),
            detail: "requested root".to_owned(),
        }
    }

    #[test]
    fn local_log_writes_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let log = LocalAuditLog::new(path.clone()).unwrap();
        log.log(&entry()).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"login_not_permitted\""));
        assert!(content.contains("\"at\""));
        assert_eq!(content.lines().count(), 1);
    }

    #[test]
    fn noop_log_swallows_entries() {
        let log = LocalAuditLog::noop();
        log.log(&entry()).unwrap();
    }
}
