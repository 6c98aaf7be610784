//! Environment-driven gateway configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::core::errors::GatewayError;

/// Default SSH listen port on every proxy IP.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default RDP listen port on every proxy IP.
pub const DEFAULT_RDP_PORT: u16 = 3389;
/// Default number of concurrent transcode workers.
pub const DEFAULT_TRANSCODE_WORKERS: usize = 2;
/// Default cap on pending transcode jobs.
pub const DEFAULT_TRANSCODE_QUEUE_MAX: usize = 10;

/// Runtime configuration, resolved once at startup.
///
/// Everything comes from the environment (`DATA_DIR`, `DB_URL`,
/// `SSH_LISTEN_PORT`, `RDP_LISTEN_PORT`, `TRANSCODE_WORKERS`,
/// `TRANSCODE_QUEUE_MAX`); paths under the data directory are derived.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base directory for all persistent gateway state.
    pub data_dir: PathBuf,
    /// Database URL (SQLite).
    pub db_url: String,
    /// Port the SSH front-end binds on each proxy IP.
    pub ssh_port: u16,
    /// Port the RDP front-end binds on each proxy IP.
    pub rdp_port: u16,
    /// Number of concurrent transcode worker tasks.
    pub transcode_workers: usize,
    /// Maximum number of pending transcode jobs.
    pub transcode_queue_max: usize,
    /// External replay transcoder binary (`TRANSCODE_BIN`).
    pub transcoder_bin: PathBuf,
    /// Backend TCP connect deadline.
    pub backend_connect_timeout: Duration,
    /// Backend authentication deadline.
    pub backend_auth_timeout: Duration,
    /// Policy engine evaluation budget.
    pub decision_budget: Duration,
    /// Idle cutoff for interactive shell channels.
    pub shell_idle_timeout: Duration,
    /// Idle cutoff for RDP connections.
    pub rdp_idle_timeout: Duration,
}

impl Config {
    /// Resolve configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when a variable is present but
    /// unparseable. Missing variables fall back to defaults.
    pub fn from_env() -> Result<Self, GatewayError> {
        let data_dir = match std::env::var_os("DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_data_dir(),
        };

        let db_url = std::env::var("DB_URL").unwrap_or_else(|_| {
            format!("sqlite:{}", data_dir.join("gatehouse.db").display())
        });

        Ok(Self {
            ssh_port: env_parsed("SSH_LISTEN_PORT", DEFAULT_SSH_PORT)?,
            rdp_port: env_parsed("RDP_LISTEN_PORT", DEFAULT_RDP_PORT)?,
            transcode_workers: env_parsed("TRANSCODE_WORKERS", DEFAULT_TRANSCODE_WORKERS)?,
            transcode_queue_max: env_parsed("TRANSCODE_QUEUE_MAX", DEFAULT_TRANSCODE_QUEUE_MAX)?,
            transcoder_bin: std::env::var_os("TRANSCODE_BIN")
                .map_or_else(|| PathBuf::from("replay-transcode"), PathBuf::from),
            backend_connect_timeout: Duration::from_secs(10),
            backend_auth_timeout: Duration::from_secs(15),
            decision_budget: Duration::from_millis(500),
            shell_idle_timeout: Duration::from_secs(60 * 60),
            rdp_idle_timeout: Duration::from_secs(15 * 60),
            data_dir,
            db_url,
        })
    }

    /// Path of the persisted SSH host key.
    #[must_use]
    pub fn host_key_path(&self) -> PathBuf {
        self.data_dir.join("host_key")
    }

    /// Directory holding the RDP TLS materials.
    #[must_use]
    pub fn tls_dir(&self) -> PathBuf {
        self.data_dir.join("tls")
    }

    /// Directory of SSH JSONL recordings.
    #[must_use]
    pub fn ssh_recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings").join("ssh")
    }

    /// Directory of RDP replays and transcoded MP4s.
    #[must_use]
    pub fn rdp_recordings_dir(&self) -> PathBuf {
        self.data_dir.join("recordings").join("rdp")
    }

    /// Directory for rotated log files.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Best-effort audit fallback log used when a proxy-path decision
    /// must not block on the database.
    #[must_use]
    pub fn audit_fallback_path(&self) -> PathBuf {
        self.data_dir.join("audit.jsonl")
    }

    /// Recording file for an SSH stay.
    #[must_use]
    pub fn ssh_recording_path(&self, stay_id: uuid::Uuid) -> PathBuf {
        self.ssh_recordings_dir().join(format!("{stay_id}.jsonl"))
    }

    /// Replay file for an RDP stay.
    #[must_use]
    pub fn rdp_replay_path(&self, stay_id: uuid::Uuid) -> PathBuf {
        self.rdp_recordings_dir().join(format!("{stay_id}.replay"))
    }

    /// Transcoded output for an RDP stay.
    #[must_use]
    pub fn rdp_mp4_path(&self, stay_id: uuid::Uuid) -> PathBuf {
        self.rdp_recordings_dir().join(format!("{stay_id}.mp4"))
    }

    /// Create every directory the gateway writes under.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<(), GatewayError> {
        for dir in [
            self.data_dir.clone(),
            self.tls_dir(),
            self.ssh_recordings_dir(),
            self.rdp_recordings_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| GatewayError::Config {
                what: format!("data directory {}", dir.display()),
                source: source.into(),
            })?;
        }
        Ok(())
    }
}

/// Parse `IpAddr` out of an operator-supplied string with a uniform error.
///
/// # Errors
///
/// Returns an error naming the offending value.
pub fn parse_proxy_ip(value: &str) -> anyhow::Result<IpAddr> {
    value
        .parse()
        .with_context(|| format!("invalid proxy IP '{value}'"))
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".gatehouse")
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, GatewayError>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|source: T::Err| GatewayError::Config {
            what: format!("{name}={raw}"),
            source: anyhow::Error::new(source),
        }),
        Err(_) => Ok(default),
    }
}

/// Set owner-only permissions on key material.
///
/// # Errors
///
/// Propagates the underlying IO error.
pub fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_live_under_data_dir() {
        let cfg = Config {
            data_dir: PathBuf::from("/var/lib/gatehouse"),
            db_url: "sqlite::memory:".into(),
            ssh_port: 22,
            rdp_port: 3389,
            transcode_workers: 2,
            transcode_queue_max: 10,
            transcoder_bin: PathBuf::from("replay-transcode"),
            backend_connect_timeout: Duration::from_secs(10),
            backend_auth_timeout: Duration::from_secs(15),
            decision_budget: Duration::from_millis(500),
            shell_idle_timeout: Duration::from_secs(3600),
            rdp_idle_timeout: Duration::from_secs(900),
        };

        let stay = uuid::Uuid::new_v4();
        assert!(cfg.host_key_path().starts_with("/var/lib/gatehouse"));
        assert!(
            cfg.ssh_recording_path(stay)
                .to_string_lossy()
                .ends_with(&format!("recordings/ssh/{stay}.jsonl"))
        );
        assert!(
            cfg.rdp_replay_path(stay)
                .to_string_lossy()
                .ends_with(&format!("recordings/rdp/{stay}.replay"))
        );
    }

    #[test]
    fn parse_proxy_ip_rejects_garbage() {
        assert!(parse_proxy_ip("10.0.160.129").is_ok());
        assert!(parse_proxy_ip("not-an-ip").is_err());
    }
}
