//! SQLite-backed policy store.
//!
//! One pool, sequential version-numbered migrations, and a thin repository
//! per aggregate. All Allocation, Policy, and Stay writes run inside
//! transactions; audit rows produced by a write share its transaction.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

use super::{
    Allocation, AuditKind, AuditQuery, AuditRecord, Backend, Group, GroupKind, JobStatus,
    NewAudit, Person, SourceIp, TranscodeJob,
};
use crate::core::errors::GatewayError;
use crate::core::stay::{Protocol, SessionKind, Stay, StaySession, TerminationReason};
use crate::policy::{Policy, ScopeKind, SubjectKind, WeeklySchedule};

/// SQLite-based policy store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

type Result<T> = std::result::Result<T, GatewayError>;

impl SqliteStore {
    /// Open (or create) the store at a filesystem path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or migrations
    /// fail.
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::Other(e.into()))?;
        }
        Self::open(&format!("sqlite:{}", db_path.display())).await
    }

    /// Open (or create) the store from a `sqlite:` URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or migrations fail.
    pub async fn open(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| GatewayError::Config {
                what: format!("DB_URL={db_url}"),
                source: e.into(),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Clone of the underlying pool, for components that need direct
    /// access to the already-migrated database.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    /// Directory aggregate: persons, source IPs, backends, groups.
    #[must_use]
    pub const fn directory(&self) -> Directory<'_> {
        Directory { pool: &self.pool }
    }

    /// Proxy-IP allocation aggregate.
    #[must_use]
    pub const fn allocations(&self) -> Allocations<'_> {
        Allocations { pool: &self.pool }
    }

    /// Policy aggregate.
    #[must_use]
    pub const fn policies(&self) -> Policies<'_> {
        Policies { pool: &self.pool }
    }

    /// Stay aggregate.
    #[must_use]
    pub const fn stays(&self) -> Stays<'_> {
        Stays { pool: &self.pool }
    }

    /// Append-only audit log.
    #[must_use]
    pub const fn audit(&self) -> Audit<'_> {
        Audit { pool: &self.pool }
    }

    /// Transcode job queue.
    #[must_use]
    pub const fn transcode(&self) -> Transcode<'_> {
        Transcode { pool: &self.pool }
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )
            ",
        )
        .execute(pool)
        .await?;

        let current_version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_optional(pool)
                .await?
                .flatten();

        let current_version = current_version.unwrap_or(0);

        if current_version < 1 {
            Self::migrate_to_v1(pool).await?;
        }

        if current_version < 2 {
            Self::migrate_to_v2(pool).await?;
        }

        Ok(())
    }

    /// Migration v1: directory, routing, policies, stays, audit.
    async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
        tracing::info!("Applying migration v1: core schema");

        for ddl in [
            r"
            CREATE TABLE IF NOT EXISTS persons (
                id TEXT PRIMARY KEY,
                handle TEXT NOT NULL UNIQUE,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS source_ips (
                id TEXT PRIMARY KEY,
                person_id TEXT NOT NULL,
                cidr TEXT NOT NULL,
                label TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS backends (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                address TEXT NOT NULL,
                port INTEGER,
                ssh_enabled INTEGER NOT NULL DEFAULT 1,
                rdp_enabled INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS allocations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                proxy_ip TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                released_at TEXT
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_allocations_proxy_ip ON allocations(proxy_ip)",
            r"
            CREATE TABLE IF NOT EXISTS server_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                parent_id TEXT
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS server_group_members (
                group_id TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                PRIMARY KEY (group_id, backend_id)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS user_groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                parent_id TEXT
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS user_group_members (
                group_id TEXT NOT NULL,
                person_id TEXT NOT NULL,
                PRIMARY KEY (group_id, person_id)
            )
            ",
            r"
            CREATE TABLE IF NOT EXISTS policies (
                id TEXT PRIMARY KEY,
                subject_kind TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                scope_kind TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                protocol TEXT,
                ssh_logins TEXT NOT NULL DEFAULT '[]',
                source_ip_id TEXT,
                allow_port_forwarding INTEGER NOT NULL DEFAULT 0,
                starts_at TEXT NOT NULL,
                ends_at TEXT,
                schedule TEXT,
                active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                created_by TEXT NOT NULL
            )
            ",
            r"
            CREATE INDEX IF NOT EXISTS idx_policies_subject
            ON policies(subject_kind, subject_id, active)
            ",
            r"
            CREATE TABLE IF NOT EXISTS stays (
                id TEXT PRIMARY KEY,
                person_id TEXT NOT NULL,
                policy_id TEXT NOT NULL,
                backend_id TEXT NOT NULL,
                protocol TEXT NOT NULL,
                source_ip TEXT NOT NULL,
                proxy_ip TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ends_at TEXT,
                termination_reason TEXT,
                recording_path TEXT,
                recording_bytes INTEGER NOT NULL DEFAULT 0,
                bytes_in INTEGER NOT NULL DEFAULT 0,
                bytes_out INTEGER NOT NULL DEFAULT 0
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_stays_active ON stays(ends_at, started_at)",
            r"
            CREATE TABLE IF NOT EXISTS stay_sessions (
                id TEXT PRIMARY KEY,
                stay_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_stay_sessions_stay ON stay_sessions(stay_id)",
            r"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at TEXT NOT NULL,
                actor TEXT,
                kind TEXT NOT NULL,
                source_ip TEXT,
                backend_id TEXT,
                protocol TEXT,
                admitted INTEGER NOT NULL,
                reason TEXT NOT NULL,
                detail TEXT NOT NULL
            )
            ",
            "CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at)",
        ] {
            sqlx::query(ddl).execute(pool).await?;
        }

        record_migration(pool, 1).await?;
        tracing::info!("Migration v1 complete");
        Ok(())
    }

    /// Migration v2: transcode job queue.
    async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
        tracing::info!("Applying migration v2: transcode queue");

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS transcode_jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stay_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                priority INTEGER NOT NULL DEFAULT 0,
                progress INTEGER NOT NULL DEFAULT 0,
                total INTEGER NOT NULL DEFAULT 0,
                eta_seconds INTEGER,
                output_path TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_transcode_queue
            ON transcode_jobs(status, priority, created_at)
            ",
        )
        .execute(pool)
        .await?;

        record_migration(pool, 2).await?;
        tracing::info!("Migration v2 complete");
        Ok(())
    }
}

async fn record_migration(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?, ?)")
        .bind(version)
        .bind(Utc::now().to_rfc3339())
        .execute(pool)
        .await?;
    Ok(())
}

/// Insert one audit row on any executor (pool or open transaction).
pub(crate) async fn insert_audit<'e, E>(executor: E, entry: &NewAudit) -> Result<i64>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let result = sqlx::query(
        r"
        INSERT INTO audit_log (at, actor, kind, source_ip, backend_id, protocol, admitted, reason, detail)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(Utc::now().to_rfc3339())
    .bind(&entry.actor)
    .bind(entry.kind.to_string())
    .bind(entry.source_ip.map(|ip| ip.to_string()))
    .bind(entry.backend_id.map(|id| id.to_string()))
    .bind(entry.protocol.map(|p| p.to_string()))
    .bind(entry.admitted)
    .bind(&entry.reason)
    .bind(&entry.detail)
    .execute(executor)
    .await?;

    Ok(result.last_insert_rowid())
}

// ---------------------------------------------------------------------------
// Directory: persons, source IPs, backends, groups
// ---------------------------------------------------------------------------

/// Persons, source IPs, backends, and the two group trees.
#[derive(Debug, Clone, Copy)]
pub struct Directory<'a> {
    pool: &'a SqlitePool,
}

impl Directory<'_> {
    /// Create a person.
    ///
    /// # Errors
    ///
    /// Fails on a duplicate handle.
    pub async fn create_person(
        &self,
        handle: &str,
        display_name: &str,
        email: &str,
    ) -> Result<Person> {
        let person = Person {
            id: Uuid::new_v4(),
            handle: handle.to_owned(),
            display_name: display_name.to_owned(),
            email: email.to_owned(),
            active: true,
        };
        sqlx::query(
            "INSERT INTO persons (id, handle, display_name, email, active) VALUES (?, ?, ?, ?, 1)",
        )
        .bind(person.id.to_string())
        .bind(&person.handle)
        .bind(&person.display_name)
        .bind(&person.email)
        .execute(self.pool)
        .await?;
        Ok(person)
    }

    /// Look a person up by handle.
    pub async fn person_by_handle(&self, handle: &str) -> Result<Option<Person>> {
        let row: Option<PersonRow> = sqlx::query_as("SELECT * FROM persons WHERE handle = ?")
            .bind(handle)
            .fetch_optional(self.pool)
            .await?;
        row.map(Person::try_from).transpose().map_err(Into::into)
    }

    /// Look a person up by id.
    pub async fn person_by_id(&self, id: Uuid) -> Result<Option<Person>> {
        let row: Option<PersonRow> = sqlx::query_as("SELECT * FROM persons WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool)
            .await?;
        row.map(Person::try_from).transpose().map_err(Into::into)
    }

    /// Register a source IP or CIDR for a person.
    ///
    /// # Errors
    ///
    /// [`GatewayError::PolicyViolation`] if the address overlaps an
    /// existing active entry (an IP must map to at most one person).
    pub async fn add_source_ip(
        &self,
        person_id: Uuid,
        cidr: IpNet,
        label: &str,
    ) -> Result<SourceIp> {
        let mut tx = self.pool.begin().await?;

        let existing: Vec<SourceIpRow> = sqlx::query_as("SELECT * FROM source_ips WHERE active = 1")
            .fetch_all(&mut *tx)
            .await?;
        for row in existing {
            let other = SourceIp::try_from(row)?;
            if nets_overlap(&other.cidr, &cidr) {
                return Err(GatewayError::PolicyViolation {
                    what: format!("{cidr} overlaps active source {} ({})", other.cidr, other.label),
                });
            }
        }

        let entry = SourceIp {
            id: Uuid::new_v4(),
            person_id,
            cidr,
            label: label.to_owned(),
            active: true,
        };
        sqlx::query(
            "INSERT INTO source_ips (id, person_id, cidr, label, active) VALUES (?, ?, ?, ?, 1)",
        )
        .bind(entry.id.to_string())
        .bind(entry.person_id.to_string())
        .bind(entry.cidr.to_string())
        .bind(&entry.label)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(entry)
    }

    /// Map a source address to its active person: exact host match first,
    /// otherwise the longest-prefix CIDR match.
    pub async fn person_for_source_ip(&self, ip: IpAddr) -> Result<Option<(Person, SourceIp)>> {
        let rows: Vec<SourceIpRow> = sqlx::query_as(
            r"
            SELECT s.* FROM source_ips s
            JOIN persons p ON p.id = s.person_id
            WHERE s.active = 1 AND p.active = 1
            ",
        )
        .fetch_all(self.pool)
        .await?;

        let mut best: Option<SourceIp> = None;
        for row in rows {
            let entry = SourceIp::try_from(row)?;
            if entry.covers(ip)
                && best
                    .as_ref()
                    .is_none_or(|b| entry.cidr.prefix_len() > b.cidr.prefix_len())
            {
                best = Some(entry);
            }
        }

        match best {
            Some(entry) => {
                let person = self.person_by_id(entry.person_id).await?.ok_or_else(|| {
                    GatewayError::InvariantViolation {
                        proxy_ip: None,
                        detail: format!("source ip {} references missing person", entry.cidr),
                    }
                })?;
                Ok(Some((person, entry)))
            }
            None => Ok(None),
        }
    }

    /// Create a backend host.
    pub async fn create_backend(
        &self,
        name: &str,
        address: &str,
        port: Option<u16>,
        ssh_enabled: bool,
        rdp_enabled: bool,
    ) -> Result<Backend> {
        let backend = Backend {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            address: address.to_owned(),
            port,
            ssh_enabled,
            rdp_enabled,
            active: true,
        };
        sqlx::query(
            r"
            INSERT INTO backends (id, name, address, port, ssh_enabled, rdp_enabled, active)
            VALUES (?, ?, ?, ?, ?, ?, 1)
            ",
        )
        .bind(backend.id.to_string())
        .bind(&backend.name)
        .bind(&backend.address)
        .bind(backend.port.map(i64::from))
        .bind(backend.ssh_enabled)
        .bind(backend.rdp_enabled)
        .execute(self.pool)
        .await?;
        Ok(backend)
    }

    /// Look a backend up by id.
    pub async fn backend_by_id(&self, id: Uuid) -> Result<Option<Backend>> {
        let row: Option<BackendRow> = sqlx::query_as("SELECT * FROM backends WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool)
            .await?;
        row.map(Backend::try_from).transpose().map_err(Into::into)
    }

    /// Look a backend up by name.
    pub async fn backend_by_name(&self, name: &str) -> Result<Option<Backend>> {
        let row: Option<BackendRow> = sqlx::query_as("SELECT * FROM backends WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool)
            .await?;
        row.map(Backend::try_from).transpose().map_err(Into::into)
    }

    /// Create a group in one of the two trees.
    ///
    /// # Errors
    ///
    /// [`GatewayError::PolicyViolation`] if attaching under `parent_id`
    /// would create a cycle or exceed the depth cap.
    pub async fn create_group(
        &self,
        kind: GroupKind,
        name: &str,
        parent_id: Option<Uuid>,
    ) -> Result<Group> {
        let group = Group {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            parent_id,
        };
        self.check_parent(kind, group.id, parent_id).await?;
        sqlx::query(&format!(
            "INSERT INTO {} (id, name, parent_id) VALUES (?, ?, ?)",
            group_table(kind)
        ))
        .bind(group.id.to_string())
        .bind(&group.name)
        .bind(group.parent_id.map(|id| id.to_string()))
        .execute(self.pool)
        .await?;
        Ok(group)
    }

    /// Re-parent a group, refusing cycles.
    pub async fn set_group_parent(
        &self,
        kind: GroupKind,
        group_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<()> {
        self.check_parent(kind, group_id, parent_id).await?;
        let updated = sqlx::query(&format!(
            "UPDATE {} SET parent_id = ? WHERE id = ?",
            group_table(kind)
        ))
        .bind(parent_id.map(|id| id.to_string()))
        .bind(group_id.to_string())
        .execute(self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound {
                what: format!("group {group_id}"),
            });
        }
        Ok(())
    }

    async fn check_parent(
        &self,
        kind: GroupKind,
        group_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<()> {
        let edges = self.group_edges(kind).await?;
        if !crate::policy::engine::parent_link_is_acyclic(&edges, group_id, parent_id) {
            return Err(GatewayError::PolicyViolation {
                what: format!("parent {parent_id:?} would create a cycle under group {group_id}"),
            });
        }
        Ok(())
    }

    /// Add a backend to a server group.
    pub async fn add_server_group_member(&self, group_id: Uuid, backend_id: Uuid) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO server_group_members (group_id, backend_id) VALUES (?, ?)",
        )
        .bind(group_id.to_string())
        .bind(backend_id.to_string())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Add a person to a user group.
    pub async fn add_user_group_member(&self, group_id: Uuid, person_id: Uuid) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO user_group_members (group_id, person_id) VALUES (?, ?)")
            .bind(group_id.to_string())
            .bind(person_id.to_string())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Look a group up by name in one tree.
    pub async fn group_by_name(&self, kind: GroupKind, name: &str) -> Result<Option<Group>> {
        let row: Option<GroupRow> = sqlx::query_as(&format!(
            "SELECT * FROM {} WHERE name = ?",
            group_table(kind)
        ))
        .bind(name)
        .fetch_optional(self.pool)
        .await?;
        row.map(Group::try_from).transpose().map_err(Into::into)
    }

    /// Active source entries of one person.
    pub async fn source_ips_of_person(&self, person_id: Uuid) -> Result<Vec<SourceIp>> {
        let rows: Vec<SourceIpRow> =
            sqlx::query_as("SELECT * FROM source_ips WHERE person_id = ? AND active = 1")
                .bind(person_id.to_string())
                .fetch_all(self.pool)
                .await?;
        rows.into_iter()
            .map(|r| SourceIp::try_from(r).map_err(Into::into))
            .collect()
    }

    /// All `(group, parent)` edges in one tree.
    pub async fn group_edges(&self, kind: GroupKind) -> Result<Vec<(Uuid, Option<Uuid>)>> {
        let rows = sqlx::query(&format!("SELECT id, parent_id FROM {}", group_table(kind)))
            .fetch_all(self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let id = parse_uuid(&row.get::<String, _>("id"))?;
                let parent = row
                    .get::<Option<String>, _>("parent_id")
                    .as_deref()
                    .map(parse_uuid)
                    .transpose()?;
                Ok((id, parent))
            })
            .collect()
    }

    /// Direct user groups a person is a member of.
    pub async fn user_groups_of_person(&self, person_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT group_id FROM user_group_members WHERE person_id = ?")
            .bind(person_id.to_string())
            .fetch_all(self.pool)
            .await?;
        rows.into_iter()
            .map(|row| parse_uuid(&row.get::<String, _>("group_id")).map_err(GatewayError::from))
            .collect()
    }

    /// Direct server groups a backend is a member of.
    pub async fn server_groups_of_backend(&self, backend_id: Uuid) -> Result<Vec<Uuid>> {
        let rows = sqlx::query("SELECT group_id FROM server_group_members WHERE backend_id = ?")
            .bind(backend_id.to_string())
            .fetch_all(self.pool)
            .await?;
        rows.into_iter()
            .map(|row| parse_uuid(&row.get::<String, _>("group_id")).map_err(GatewayError::from))
            .collect()
    }
}

const fn group_table(kind: GroupKind) -> &'static str {
    match kind {
        GroupKind::Server => "server_groups",
        GroupKind::User => "user_groups",
    }
}

fn nets_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

// ---------------------------------------------------------------------------
// Allocations
// ---------------------------------------------------------------------------

/// Proxy-IP → backend allocations; the active set is the routing table.
#[derive(Debug, Clone, Copy)]
pub struct Allocations<'a> {
    pool: &'a SqlitePool,
}

impl Allocations<'_> {
    /// Bind a proxy IP to a backend.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Conflict`] if the proxy IP already has an active
    /// allocation; [`GatewayError::NotFound`] if the backend is unknown.
    pub async fn bind(&self, proxy_ip: IpAddr, backend_id: Uuid, actor: &str) -> Result<Allocation> {
        let mut tx = self.pool.begin().await?;

        let existing: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM allocations WHERE proxy_ip = ? AND released_at IS NULL",
        )
        .bind(proxy_ip.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if existing > 0 {
            return Err(GatewayError::Conflict {
                what: format!("proxy IP {proxy_ip} already bound"),
            });
        }

        let backend_exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM backends WHERE id = ?")
            .bind(backend_id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        if backend_exists == 0 {
            return Err(GatewayError::NotFound {
                what: format!("backend {backend_id}"),
            });
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO allocations (proxy_ip, backend_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(proxy_ip.to_string())
        .bind(backend_id.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        insert_audit(
            &mut *tx,
            &NewAudit {
                actor: Some(actor.to_owned()),
                kind: AuditKind::AllocationChange,
                source_ip: None,
                backend_id: Some(backend_id),
                protocol: None,
                admitted: true,
                reason: "bind".to_owned(),
                detail: format!("{proxy_ip} -> {backend_id}"),
            },
        )
        .await?;

        tx.commit().await?;

        Ok(Allocation {
            id: result.last_insert_rowid(),
            proxy_ip,
            backend_id,
            created_at,
            released_at: None,
        })
    }

    /// Release a proxy IP binding.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Conflict`] while any stay is active on the IP;
    /// [`GatewayError::NotFound`] if there is no active allocation.
    pub async fn release(&self, proxy_ip: IpAddr, actor: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let active_stays: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM stays WHERE proxy_ip = ? AND ends_at IS NULL",
        )
        .bind(proxy_ip.to_string())
        .fetch_one(&mut *tx)
        .await?;
        if active_stays > 0 {
            return Err(GatewayError::Conflict {
                what: format!("{active_stays} active stays on {proxy_ip}"),
            });
        }

        let released = sqlx::query(
            "UPDATE allocations SET released_at = ? WHERE proxy_ip = ? AND released_at IS NULL",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(proxy_ip.to_string())
        .execute(&mut *tx)
        .await?;
        if released.rows_affected() == 0 {
            return Err(GatewayError::NotFound {
                what: format!("allocation for {proxy_ip}"),
            });
        }

        insert_audit(
            &mut *tx,
            &NewAudit {
                actor: Some(actor.to_owned()),
                kind: AuditKind::AllocationChange,
                source_ip: None,
                backend_id: None,
                protocol: None,
                admitted: true,
                reason: "release".to_owned(),
                detail: proxy_ip.to_string(),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Every active allocation (the routing table).
    pub async fn active(&self) -> Result<Vec<Allocation>> {
        let rows: Vec<AllocationRow> =
            sqlx::query_as("SELECT * FROM allocations WHERE released_at IS NULL")
                .fetch_all(self.pool)
                .await?;
        rows.into_iter()
            .map(|r| Allocation::try_from(r).map_err(Into::into))
            .collect()
    }

    /// The active allocation for one proxy IP.
    ///
    /// # Errors
    ///
    /// [`GatewayError::InvariantViolation`] if more than one active
    /// allocation is observed for the IP.
    pub async fn active_for_ip(&self, proxy_ip: IpAddr) -> Result<Option<Allocation>> {
        let rows: Vec<AllocationRow> =
            sqlx::query_as("SELECT * FROM allocations WHERE proxy_ip = ? AND released_at IS NULL")
                .bind(proxy_ip.to_string())
                .fetch_all(self.pool)
                .await?;
        if rows.len() > 1 {
            return Err(GatewayError::InvariantViolation {
                proxy_ip: Some(proxy_ip),
                detail: format!("{} active allocations", rows.len()),
            });
        }
        rows.into_iter()
            .next()
            .map(|r| Allocation::try_from(r).map_err(Into::into))
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Grant records and their revocation.
#[derive(Debug, Clone, Copy)]
pub struct Policies<'a> {
    pool: &'a SqlitePool,
}

impl Policies<'_> {
    /// Write a new policy. It becomes evaluable immediately.
    ///
    /// # Errors
    ///
    /// [`GatewayError::PolicyViolation`] if the record is structurally
    /// invalid.
    pub async fn create(&self, policy: &Policy) -> Result<()> {
        policy
            .validate()
            .map_err(|e| GatewayError::PolicyViolation { what: e.to_string() })?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO policies (
                id, subject_kind, subject_id, scope_kind, scope_id, protocol,
                ssh_logins, source_ip_id, allow_port_forwarding,
                starts_at, ends_at, schedule, active, created_at, created_by
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(policy.id.to_string())
        .bind(policy.subject_kind.to_string())
        .bind(policy.subject_id.to_string())
        .bind(policy.scope_kind.to_string())
        .bind(policy.scope_id.to_string())
        .bind(policy.protocol.map(|p| p.to_string()))
        .bind(serde_json::to_string(&policy.ssh_logins).map_err(anyhow::Error::from)?)
        .bind(policy.source_ip_id.map(|id| id.to_string()))
        .bind(policy.allow_port_forwarding)
        .bind(policy.starts_at.to_rfc3339())
        .bind(policy.ends_at.map(|t| t.to_rfc3339()))
        .bind(
            policy
                .schedule
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(anyhow::Error::from)?,
        )
        .bind(policy.active)
        .bind(policy.created_at.to_rfc3339())
        .bind(&policy.created_by)
        .execute(&mut *tx)
        .await?;

        insert_audit(
            &mut *tx,
            &NewAudit {
                actor: Some(policy.created_by.clone()),
                kind: AuditKind::PolicyWrite,
                source_ip: None,
                backend_id: None,
                protocol: policy.protocol,
                admitted: true,
                reason: "grant".to_owned(),
                detail: format!(
                    "policy {} {}:{} -> {}:{}",
                    policy.id,
                    policy.subject_kind,
                    policy.subject_id,
                    policy.scope_kind,
                    policy.scope_id
                ),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Revoke a policy. Active stays admitted under it must be terminated
    /// by the caller (registry fan-out) within the 2 s bound.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotFound`] if the policy does not exist or is
    /// already revoked.
    pub async fn revoke(&self, id: Uuid, actor: &str) -> Result<Policy> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE policies SET active = 0 WHERE id = ? AND active = 1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound {
                what: format!("active policy {id}"),
            });
        }

        insert_audit(
            &mut *tx,
            &NewAudit {
                actor: Some(actor.to_owned()),
                kind: AuditKind::PolicyWrite,
                source_ip: None,
                backend_id: None,
                protocol: None,
                admitted: true,
                reason: "revoke".to_owned(),
                detail: format!("policy {id}"),
            },
        )
        .await?;

        tx.commit().await?;

        self.by_id(id).await?.ok_or_else(|| GatewayError::NotFound {
            what: format!("policy {id}"),
        })
    }

    /// Fetch one policy.
    pub async fn by_id(&self, id: Uuid) -> Result<Option<Policy>> {
        let row: Option<PolicyRow> = sqlx::query_as("SELECT * FROM policies WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool)
            .await?;
        row.map(Policy::try_from).transpose().map_err(Into::into)
    }

    /// Active policies whose subject is the person or any of the given
    /// user groups, ordered `(ends_at IS NULL DESC, created_at ASC)` for
    /// deterministic first-match evaluation.
    pub async fn candidates_for(&self, person_id: Uuid, groups: &[Uuid]) -> Result<Vec<Policy>> {
        let mut ids: Vec<String> = Vec::with_capacity(groups.len() + 1);
        ids.push(person_id.to_string());
        ids.extend(groups.iter().map(Uuid::to_string));

        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            r"
            SELECT * FROM policies
            WHERE active = 1 AND subject_id IN ({placeholders})
            ORDER BY (ends_at IS NULL) DESC, created_at ASC
            "
        );

        let mut query = sqlx::query_as::<_, PolicyRow>(&sql);
        for id in &ids {
            query = query.bind(id);
        }

        let rows = query.fetch_all(self.pool).await?;
        rows.into_iter()
            .map(|r| Policy::try_from(r).map_err(Into::into))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Stays
// ---------------------------------------------------------------------------

/// Stay lifecycle rows and their per-connection sessions.
#[derive(Debug, Clone, Copy)]
pub struct Stays<'a> {
    pool: &'a SqlitePool,
}

impl Stays<'_> {
    /// Persist a freshly admitted stay together with its admission audit
    /// row, in one transaction.
    pub async fn insert_admitted(&self, stay: &Stay, actor: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO stays (
                id, person_id, policy_id, backend_id, protocol, source_ip, proxy_ip,
                started_at, recording_bytes, bytes_in, bytes_out
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0)
            ",
        )
        .bind(stay.id.to_string())
        .bind(stay.person_id.to_string())
        .bind(stay.policy_id.to_string())
        .bind(stay.backend_id.to_string())
        .bind(stay.protocol.to_string())
        .bind(stay.source_ip.to_string())
        .bind(stay.proxy_ip.to_string())
        .bind(stay.started_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        insert_audit(
            &mut *tx,
            &NewAudit {
                actor: Some(actor.to_owned()),
                kind: AuditKind::Admission,
                source_ip: Some(stay.source_ip),
                backend_id: Some(stay.backend_id),
                protocol: Some(stay.protocol),
                admitted: true,
                reason: "admitted".to_owned(),
                detail: format!("stay {} under policy {}", stay.id, stay.policy_id),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Close a stay: set `ends_at`/`termination_reason`, fold final byte
    /// and recording counters, write the close audit row — one
    /// transaction. Idempotent; a second close is a no-op.
    pub async fn close(
        &self,
        stay_id: Uuid,
        reason: TerminationReason,
        recording_path: Option<&Path>,
        recording_bytes: i64,
        bytes_in: i64,
        bytes_out: i64,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"
            UPDATE stays SET
                ends_at = ?,
                termination_reason = ?,
                recording_path = COALESCE(?, recording_path),
                recording_bytes = ?,
                bytes_in = bytes_in + ?,
                bytes_out = bytes_out + ?
            WHERE id = ? AND ends_at IS NULL
            ",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(reason.to_string())
        .bind(recording_path.map(|p| p.to_string_lossy().to_string()))
        .bind(recording_bytes)
        .bind(bytes_in)
        .bind(bytes_out)
        .bind(stay_id.to_string())
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            // Already closed.
            return Ok(());
        }

        sqlx::query("UPDATE stay_sessions SET ended_at = ? WHERE stay_id = ? AND ended_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(stay_id.to_string())
            .execute(&mut *tx)
            .await?;

        insert_audit(
            &mut *tx,
            &NewAudit {
                actor: None,
                kind: AuditKind::StayClosed,
                source_ip: None,
                backend_id: None,
                protocol: None,
                admitted: true,
                reason: reason.to_string(),
                detail: format!("stay {stay_id}"),
            },
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Fold periodic byte-counter deltas into the stay row.
    pub async fn add_bytes(&self, stay_id: Uuid, bytes_in: i64, bytes_out: i64) -> Result<()> {
        sqlx::query("UPDATE stays SET bytes_in = bytes_in + ?, bytes_out = bytes_out + ? WHERE id = ?")
            .bind(bytes_in)
            .bind(bytes_out)
            .bind(stay_id.to_string())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Attach the recording path once the first byte is written.
    pub async fn attach_recording(&self, stay_id: Uuid, path: &Path) -> Result<()> {
        sqlx::query("UPDATE stays SET recording_path = ? WHERE id = ?")
            .bind(path.to_string_lossy().to_string())
            .bind(stay_id.to_string())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Record a session (one TCP connection or channel) under a stay.
    pub async fn insert_session(&self, session: &StaySession) -> Result<()> {
        sqlx::query(
            "INSERT INTO stay_sessions (id, stay_id, kind, started_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session.id.to_string())
        .bind(session.stay_id.to_string())
        .bind(session.kind.to_string())
        .bind(session.started_at.to_rfc3339())
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Close one session.
    pub async fn close_session(&self, session_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE stay_sessions SET ended_at = ? WHERE id = ? AND ended_at IS NULL")
            .bind(Utc::now().to_rfc3339())
            .bind(session_id.to_string())
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Sessions belonging to a stay.
    pub async fn sessions_of(&self, stay_id: Uuid) -> Result<Vec<StaySession>> {
        let rows: Vec<SessionRow> =
            sqlx::query_as("SELECT * FROM stay_sessions WHERE stay_id = ? ORDER BY started_at")
                .bind(stay_id.to_string())
                .fetch_all(self.pool)
                .await?;
        rows.into_iter()
            .map(|r| StaySession::try_from(r).map_err(Into::into))
            .collect()
    }

    /// Fetch one stay.
    pub async fn by_id(&self, id: Uuid) -> Result<Option<Stay>> {
        let row: Option<StayRow> = sqlx::query_as("SELECT * FROM stays WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool)
            .await?;
        row.map(Stay::try_from).transpose().map_err(Into::into)
    }

    /// List stays, optionally only the active ones.
    pub async fn list(&self, active_only: bool) -> Result<Vec<Stay>> {
        let sql = if active_only {
            "SELECT * FROM stays WHERE ends_at IS NULL ORDER BY started_at"
        } else {
            "SELECT * FROM stays ORDER BY started_at"
        };
        let rows: Vec<StayRow> = sqlx::query_as(sql).fetch_all(self.pool).await?;
        rows.into_iter()
            .map(|r| Stay::try_from(r).map_err(Into::into))
            .collect()
    }

    /// Close every stay left open by a previous process. Returns how many
    /// rows were swept.
    pub async fn sweep_stale_open(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let stale: Vec<String> = sqlx::query_scalar("SELECT id FROM stays WHERE ends_at IS NULL")
            .fetch_all(&mut *tx)
            .await?;

        let now = Utc::now().to_rfc3339();
        sqlx::query("UPDATE stays SET ends_at = ?, termination_reason = ? WHERE ends_at IS NULL")
            .bind(&now)
            .bind(TerminationReason::Error.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE stay_sessions SET ended_at = ? WHERE ended_at IS NULL")
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        for id in &stale {
            insert_audit(
                &mut *tx,
                &NewAudit {
                    actor: None,
                    kind: AuditKind::StayClosed,
                    source_ip: None,
                    backend_id: None,
                    protocol: None,
                    admitted: true,
                    reason: TerminationReason::Error.to_string(),
                    detail: format!("stay {id} swept at startup"),
                },
            )
            .await?;
        }

        tx.commit().await?;
        Ok(stale.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

/// The append-only audit log.
#[derive(Debug, Clone, Copy)]
pub struct Audit<'a> {
    pool: &'a SqlitePool,
}

impl Audit<'_> {
    /// Append one row.
    pub async fn insert(&self, entry: &NewAudit) -> Result<i64> {
        insert_audit(self.pool, entry).await
    }

    /// Append one row inside an open transaction.
    pub async fn insert_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        entry: &NewAudit,
    ) -> Result<i64> {
        insert_audit(&mut **tx, entry).await
    }

    /// Query rows by time range, source IP, actor, or backend.
    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let mut sql = String::from("SELECT * FROM audit_log WHERE 1 = 1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(from) = filter.from {
            sql.push_str(" AND at >= ?");
            binds.push(from.to_rfc3339());
        }
        if let Some(to) = filter.to {
            sql.push_str(" AND at < ?");
            binds.push(to.to_rfc3339());
        }
        if let Some(ip) = filter.source_ip {
            sql.push_str(" AND source_ip = ?");
            binds.push(ip.to_string());
        }
        if let Some(actor) = &filter.actor {
            sql.push_str(" AND actor = ?");
            binds.push(actor.clone());
        }
        if let Some(backend_id) = filter.backend_id {
            sql.push_str(" AND backend_id = ?");
            binds.push(backend_id.to_string());
        }
        sql.push_str(" ORDER BY at, id");

        let mut query = sqlx::query_as::<_, AuditRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }

        let rows = query.fetch_all(self.pool).await?;
        rows.into_iter()
            .map(|r| AuditRecord::try_from(r).map_err(Into::into))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Transcode queue
// ---------------------------------------------------------------------------

/// The `.replay → .mp4` job queue.
#[derive(Debug, Clone, Copy)]
pub struct Transcode<'a> {
    pool: &'a SqlitePool,
}

impl Transcode<'_> {
    /// Enqueue a job for a closed RDP stay.
    ///
    /// # Errors
    ///
    /// [`GatewayError::ResourceExhausted`] when `pending_cap` jobs are
    /// already waiting.
    pub async fn enqueue(&self, stay_id: Uuid, pending_cap: usize) -> Result<TranscodeJob> {
        let mut tx = self.pool.begin().await?;

        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transcode_jobs WHERE status = 'pending'")
                .fetch_one(&mut *tx)
                .await?;
        if pending >= pending_cap as i64 {
            return Err(GatewayError::ResourceExhausted {
                what: format!("transcode queue full ({pending_cap} pending)"),
            });
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO transcode_jobs (stay_id, status, priority, created_at) VALUES (?, 'pending', 0, ?)",
        )
        .bind(stay_id.to_string())
        .bind(created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TranscodeJob {
            id: result.last_insert_rowid(),
            stay_id,
            status: JobStatus::Pending,
            priority: 0,
            progress: 0,
            total: 0,
            eta_seconds: None,
            output_path: None,
            error: None,
            created_at,
            started_at: None,
            finished_at: None,
        })
    }

    /// Claim the next pending job: nonzero priorities first (highest
    /// wins), then FIFO by enqueue time.
    pub async fn claim(&self) -> Result<Option<TranscodeJob>> {
        let claimed: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE transcode_jobs SET status = 'running', started_at = ?
            WHERE id = (
                SELECT id FROM transcode_jobs WHERE status = 'pending'
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id
            ",
        )
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(self.pool)
        .await?;

        match claimed {
            Some(id) => self.by_id(id).await,
            None => Ok(None),
        }
    }

    /// Report worker progress (`frame K of N`) and the derived ETA.
    pub async fn heartbeat(
        &self,
        id: i64,
        progress: i64,
        total: i64,
        eta_seconds: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs SET progress = ?, total = ?, eta_seconds = ? WHERE id = ?",
        )
        .bind(progress)
        .bind(total)
        .bind(eta_seconds)
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Mark a job done with its final output.
    pub async fn complete(&self, id: i64, output_path: &Path) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs SET status = 'done', output_path = ?, finished_at = ?, eta_seconds = 0 WHERE id = ?",
        )
        .bind(output_path.to_string_lossy().to_string())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Mark a job failed with the process's last error line.
    pub async fn fail(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE transcode_jobs SET status = 'failed', error = ?, finished_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Jump a pending job ahead of everything else: priority becomes the
    /// current maximum plus one.
    ///
    /// # Errors
    ///
    /// [`GatewayError::NotFound`] if the job is not pending.
    pub async fn rush(&self, id: i64) -> Result<TranscodeJob> {
        let updated = sqlx::query(
            r"
            UPDATE transcode_jobs SET priority = (
                SELECT COALESCE(MAX(priority), 0) + 1 FROM transcode_jobs
                WHERE status IN ('pending', 'running')
            )
            WHERE id = ? AND status = 'pending'
            ",
        )
        .bind(id)
        .execute(self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(GatewayError::NotFound {
                what: format!("pending transcode job {id}"),
            });
        }

        self.by_id(id).await?.ok_or_else(|| GatewayError::NotFound {
            what: format!("transcode job {id}"),
        })
    }

    /// Fetch one job.
    pub async fn by_id(&self, id: i64) -> Result<Option<TranscodeJob>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM transcode_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        row.map(TranscodeJob::try_from)
            .transpose()
            .map_err(Into::into)
    }

    /// `(pending, running)` counts, for the cap invariants.
    pub async fn counts(&self) -> Result<(i64, i64)> {
        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transcode_jobs WHERE status = 'pending'")
                .fetch_one(self.pool)
                .await?;
        let running: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM transcode_jobs WHERE status = 'running'")
                .fetch_one(self.pool)
                .await?;
        Ok((pending, running))
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> std::result::Result<Uuid, anyhow::Error> {
    Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("invalid uuid '{s}': {e}"))
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, anyhow::Error> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| anyhow::anyhow!("invalid timestamp '{s}': {e}"))?
        .with_timezone(&Utc))
}

fn parse_opt_ts(
    s: Option<&str>,
) -> std::result::Result<Option<DateTime<Utc>>, anyhow::Error> {
    s.map(parse_ts).transpose()
}

fn parse_ip(s: &str) -> std::result::Result<IpAddr, anyhow::Error> {
    s.parse().map_err(|e| anyhow::anyhow!("invalid ip '{s}': {e}"))
}

fn parse_net(s: &str) -> std::result::Result<IpNet, anyhow::Error> {
    if s.contains('/') {
        s.parse().map_err(|e| anyhow::anyhow!("invalid cidr '{s}': {e}"))
    } else {
        let ip: IpAddr = parse_ip(s)?;
        Ok(IpNet::from(ip))
    }
}

#[derive(sqlx::FromRow)]
struct PersonRow {
    id: String,
    handle: String,
    display_name: String,
    email: String,
    active: bool,
}

impl TryFrom<PersonRow> for Person {
    type Error = anyhow::Error;

    fn try_from(row: PersonRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            handle: row.handle,
            display_name: row.display_name,
            email: row.email,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SourceIpRow {
    id: String,
    person_id: String,
    cidr: String,
    label: String,
    active: bool,
}

impl TryFrom<SourceIpRow> for SourceIp {
    type Error = anyhow::Error;

    fn try_from(row: SourceIpRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            person_id: parse_uuid(&row.person_id)?,
            cidr: parse_net(&row.cidr)?,
            label: row.label,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct BackendRow {
    id: String,
    name: String,
    address: String,
    port: Option<i64>,
    ssh_enabled: bool,
    rdp_enabled: bool,
    active: bool,
}

impl TryFrom<BackendRow> for Backend {
    type Error = anyhow::Error;

    fn try_from(row: BackendRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            name: row.name,
            address: row.address,
            port: row.port.map(u16::try_from).transpose()?,
            ssh_enabled: row.ssh_enabled,
            rdp_enabled: row.rdp_enabled,
            active: row.active,
        })
    }
}

#[derive(sqlx::FromRow)]
struct GroupRow {
    id: String,
    name: String,
    parent_id: Option<String>,
}

impl TryFrom<GroupRow> for Group {
    type Error = anyhow::Error;

    fn try_from(row: GroupRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            name: row.name,
            parent_id: row.parent_id.as_deref().map(parse_uuid).transpose()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AllocationRow {
    id: i64,
    proxy_ip: String,
    backend_id: String,
    created_at: String,
    released_at: Option<String>,
}

impl TryFrom<AllocationRow> for Allocation {
    type Error = anyhow::Error;

    fn try_from(row: AllocationRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            proxy_ip: parse_ip(&row.proxy_ip)?,
            backend_id: parse_uuid(&row.backend_id)?,
            created_at: parse_ts(&row.created_at)?,
            released_at: parse_opt_ts(row.released_at.as_deref())?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: String,
    subject_kind: String,
    subject_id: String,
    scope_kind: String,
    scope_id: String,
    protocol: Option<String>,
    ssh_logins: String,
    source_ip_id: Option<String>,
    allow_port_forwarding: bool,
    starts_at: String,
    ends_at: Option<String>,
    schedule: Option<String>,
    active: bool,
    created_at: String,
    created_by: String,
}

impl TryFrom<PolicyRow> for Policy {
    type Error = anyhow::Error;

    fn try_from(row: PolicyRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            subject_kind: row.subject_kind.parse::<SubjectKind>()?,
            subject_id: parse_uuid(&row.subject_id)?,
            scope_kind: row.scope_kind.parse::<ScopeKind>()?,
            scope_id: parse_uuid(&row.scope_id)?,
            protocol: row
                .protocol
                .as_deref()
                .map(str::parse::<Protocol>)
                .transpose()?,
            ssh_logins: serde_json::from_str(&row.ssh_logins)?,
            source_ip_id: row.source_ip_id.as_deref().map(parse_uuid).transpose()?,
            allow_port_forwarding: row.allow_port_forwarding,
            starts_at: parse_ts(&row.starts_at)?,
            ends_at: parse_opt_ts(row.ends_at.as_deref())?,
            schedule: row
                .schedule
                .as_deref()
                .map(serde_json::from_str::<WeeklySchedule>)
                .transpose()?,
            active: row.active,
            created_at: parse_ts(&row.created_at)?,
            created_by: row.created_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StayRow {
    id: String,
    person_id: String,
    policy_id: String,
    backend_id: String,
    protocol: String,
    source_ip: String,
    proxy_ip: String,
    started_at: String,
    ends_at: Option<String>,
    termination_reason: Option<String>,
    recording_path: Option<String>,
    recording_bytes: i64,
    bytes_in: i64,
    bytes_out: i64,
}

impl TryFrom<StayRow> for Stay {
    type Error = anyhow::Error;

    fn try_from(row: StayRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            person_id: parse_uuid(&row.person_id)?,
            policy_id: parse_uuid(&row.policy_id)?,
            backend_id: parse_uuid(&row.backend_id)?,
            protocol: row.protocol.parse::<Protocol>()?,
            source_ip: parse_ip(&row.source_ip)?,
            proxy_ip: parse_ip(&row.proxy_ip)?,
            started_at: parse_ts(&row.started_at)?,
            ends_at: parse_opt_ts(row.ends_at.as_deref())?,
            termination_reason: row
                .termination_reason
                .as_deref()
                .map(str::parse::<TerminationReason>)
                .transpose()?,
            recording_path: row.recording_path.map(PathBuf::from),
            recording_bytes: row.recording_bytes,
            bytes_in: row.bytes_in,
            bytes_out: row.bytes_out,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    stay_id: String,
    kind: String,
    started_at: String,
    ended_at: Option<String>,
}

impl TryFrom<SessionRow> for StaySession {
    type Error = anyhow::Error;

    fn try_from(row: SessionRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: parse_uuid(&row.id)?,
            stay_id: parse_uuid(&row.stay_id)?,
            kind: row.kind.parse::<SessionKind>()?,
            started_at: parse_ts(&row.started_at)?,
            ended_at: parse_opt_ts(row.ended_at.as_deref())?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AuditRow {
    id: i64,
    at: String,
    actor: Option<String>,
    kind: String,
    source_ip: Option<String>,
    backend_id: Option<String>,
    protocol: Option<String>,
    admitted: bool,
    reason: String,
    detail: String,
}

impl TryFrom<AuditRow> for AuditRecord {
    type Error = anyhow::Error;

    fn try_from(row: AuditRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            at: parse_ts(&row.at)?,
            actor: row.actor,
            kind: row.kind.parse::<AuditKind>()?,
            source_ip: row.source_ip.as_deref().map(parse_ip).transpose()?,
            backend_id: row.backend_id.as_deref().map(parse_uuid).transpose()?,
            protocol: row
                .protocol
                .as_deref()
                .map(str::parse::<Protocol>)
                .transpose()?,
            admitted: row.admitted,
            reason: row.reason,
            detail: row.detail,
        })
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    stay_id: String,
    status: String,
    priority: i64,
    progress: i64,
    total: i64,
    eta_seconds: Option<i64>,
    output_path: Option<String>,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    finished_at: Option<String>,
}

impl TryFrom<JobRow> for TranscodeJob {
    type Error = anyhow::Error;

    fn try_from(row: JobRow) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            stay_id: parse_uuid(&row.stay_id)?,
            status: row.status.parse::<JobStatus>()?,
            priority: row.priority,
            progress: row.progress,
            total: row.total,
            eta_seconds: row.eta_seconds,
            output_path: row.output_path.map(PathBuf::from),
            error: row.error,
            created_at: parse_ts(&row.created_at)?,
            started_at: parse_opt_ts(row.started_at.as_deref())?,
            finished_at: parse_opt_ts(row.finished_at.as_deref())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (SqliteStore, TempDir) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = SqliteStore::new(&dir.path().join("test.db"))
            .await
            .expect("Failed to create store");
        (store, dir)
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        drop(SqliteStore::new(&path).await.unwrap());
        // Re-opening applies no further migrations and succeeds.
        drop(SqliteStore::new(&path).await.unwrap());
    }

    #[tokio::test]
    async fn source_ip_overlap_is_refused() {
        let (store, _dir) = store().await;
        let dir = store.directory();
        let alice = dir.create_person("alice", "Alice", "alice@example.com").await.unwrap();
        let bob = dir.create_person("bob", "Bob", "bob@example.com").await.unwrap();

        dir.add_source_ip(alice.id, "100.64.0.0/24".parse().unwrap(), "vpn")
            .await
            .unwrap();

        let overlapping = dir
            .add_source_ip(bob.id, "100.64.0.20/32".parse().unwrap(), "laptop")
            .await;
        assert!(matches!(
            overlapping,
            Err(GatewayError::PolicyViolation { .. })
        ));
    }

    #[tokio::test]
    async fn longest_prefix_wins_source_lookup() {
        let (store, _dir) = store().await;
        let dir = store.directory();
        let team = dir.create_person("team", "Team", "team@example.com").await.unwrap();
        let alice = dir.create_person("alice", "Alice", "alice@example.com").await.unwrap();

        dir.add_source_ip(team.id, "10.1.0.0/16".parse().unwrap(), "office")
            .await
            .unwrap();
        // A host inside the block cannot be added for someone else (overlap),
        // so carve the person out of a disjoint range instead.
        dir.add_source_ip(alice.id, "10.2.0.7/32".parse().unwrap(), "desk")
            .await
            .unwrap();

        let (person, entry) = dir
            .person_for_source_ip("10.1.3.4".parse().unwrap())
            .await
            .unwrap()
            .expect("office block should match");
        assert_eq!(person.id, team.id);
        assert_eq!(entry.cidr.prefix_len(), 16);

        let (person, _) = dir
            .person_for_source_ip("10.2.0.7".parse().unwrap())
            .await
            .unwrap()
            .expect("host entry should match");
        assert_eq!(person.id, alice.id);
    }

    #[tokio::test]
    async fn one_active_allocation_per_proxy_ip() {
        let (store, _dir) = store().await;
        let backend = store
            .directory()
            .create_backend("db-01", "192.0.2.10", None, true, false)
            .await
            .unwrap();
        let other = store
            .directory()
            .create_backend("db-02", "192.0.2.11", None, true, false)
            .await
            .unwrap();

        let ip: IpAddr = "10.0.160.129".parse().unwrap();
        store.allocations().bind(ip, backend.id, "ops").await.unwrap();

        let rebind = store.allocations().bind(ip, other.id, "ops").await;
        assert!(matches!(rebind, Err(GatewayError::Conflict { .. })));

        store.allocations().release(ip, "ops").await.unwrap();
        store.allocations().bind(ip, other.id, "ops").await.unwrap();

        let active = store.allocations().active_for_ip(ip).await.unwrap().unwrap();
        assert_eq!(active.backend_id, other.id);
    }

    #[tokio::test]
    async fn stay_close_is_idempotent_and_audited() {
        let (store, _dir) = store().await;
        let stay = Stay::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Protocol::Ssh,
            "100.64.0.20".parse().unwrap(),
            "10.0.160.129".parse().unwrap(),
        );
        store.stays().insert_admitted(&stay, "alice").await.unwrap();

        store
            .stays()
            .close(stay.id, TerminationReason::ClientClosed, None, 0, 10, 20)
            .await
            .unwrap();
        store
            .stays()
            .close(stay.id, TerminationReason::Revoked, None, 0, 0, 0)
            .await
            .unwrap();

        let row = store.stays().by_id(stay.id).await.unwrap().unwrap();
        assert_eq!(row.termination_reason, Some(TerminationReason::ClientClosed));
        assert_eq!((row.bytes_in, row.bytes_out), (10, 20));

        // One admit row, one close row.
        let audit = store.audit().query(&AuditQuery::default()).await.unwrap();
        assert_eq!(audit.len(), 2);
        assert!(audit.iter().any(|r| r.kind == AuditKind::Admission));
        assert!(audit.iter().any(|r| r.kind == AuditKind::StayClosed));
    }

    #[tokio::test]
    async fn audit_rows_can_join_an_open_transaction() {
        let (store, _dir) = store().await;

        let mut tx = store.pool().begin().await.unwrap();
        store
            .audit()
            .insert_tx(
                &mut tx,
                &NewAudit {
                    actor: Some("ops".into()),
                    kind: AuditKind::PolicyWrite,
                    source_ip: None,
                    backend_id: None,
                    protocol: None,
                    admitted: true,
                    reason: "grant".into(),
                    detail: "batch import".into(),
                },
            )
            .await
            .unwrap();

        // Not visible until the owning transaction commits.
        tx.commit().await.unwrap();
        let rows = store.audit().query(&AuditQuery::default()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, AuditKind::PolicyWrite);
    }

    #[tokio::test]
    async fn transcode_queue_orders_and_caps() {
        let (store, _dir) = store().await;
        let q = store.transcode();

        for _ in 0..3 {
            q.enqueue(Uuid::new_v4(), 10).await.unwrap();
        }
        let rushed = q.enqueue(Uuid::new_v4(), 10).await.unwrap();
        q.rush(rushed.id).await.unwrap();

        let first = q.claim().await.unwrap().unwrap();
        assert_eq!(first.id, rushed.id);

        let second = q.claim().await.unwrap().unwrap();
        assert_eq!(second.priority, 0);

        let full = {
            for _ in 0..8 {
                q.enqueue(Uuid::new_v4(), 10).await.unwrap();
            }
            q.enqueue(Uuid::new_v4(), 10).await
        };
        assert!(matches!(full, Err(GatewayError::ResourceExhausted { .. })));
    }

    #[tokio::test]
    async fn sweep_closes_stale_stays() {
        let (store, _dir) = store().await;
        let stay = Stay::open(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Protocol::Rdp,
            "100.64.0.39".parse().unwrap(),
            "10.0.160.130".parse().unwrap(),
        );
        store.stays().insert_admitted(&stay, "bob").await.unwrap();

        let swept = store.stays().sweep_stale_open().await.unwrap();
        assert_eq!(swept, 1);

        let row = store.stays().by_id(stay.id).await.unwrap().unwrap();
        assert_eq!(row.termination_reason, Some(TerminationReason::Error));
        assert!(store.stays().list(true).await.unwrap().is_empty());
    }
}
