use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use gatehouse::config::{Config, parse_proxy_ip};
use gatehouse::core::errors::GatewayError;
use gatehouse::core::stay::Protocol;
use gatehouse::policy::{Policy, ScopeKind, SubjectKind, WeeklySchedule};
use gatehouse::store::SqliteStore;

#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(version)]
#[command(about = "Policy-enforcing SSH/RDP gateway with session recording")]
#[command(long_about = "\
gatehouse interposes itself between operators and the hosts they
administer. Operators connect to a proxy IP as if it were the target;
the gateway admits the connection against a time-bounded policy,
relays it to the bound backend, and records the session for audit.

It provides:
  - SSH and RDP front-ends, one listener per allocated proxy IP
  - A policy engine over persons, groups, schedules, and login lists
  - Live session tracking with forced disconnect on grant expiry
  - JSONL/replay recordings and a replay-to-MP4 transcode queue")]
#[command(after_long_help = "\
QUICK START:
    gatehouse bind 10.0.160.129 db-01
    gatehouse grant --person alice --server-group prod --protocol ssh \\
        --logins postgres --hours 8
    gatehouse serve

ENVIRONMENT VARIABLES:
    DATA_DIR              Base directory for all gateway state
                          (default: ~/.gatehouse)
    DB_URL                SQLite URL (default: sqlite:<DATA_DIR>/gatehouse.db)
    SSH_LISTEN_PORT       SSH port on every proxy IP (default: 22)
    RDP_LISTEN_PORT       RDP port on every proxy IP (default: 3389)
    TRANSCODE_WORKERS     Concurrent transcode workers (default: 2)
    TRANSCODE_QUEUE_MAX   Pending transcode job cap (default: 10)
    TRANSCODE_BIN         External replay transcoder binary
    RUST_LOG              Log filter (default: gatehouse=info)

FILE LOCATIONS:
    <DATA_DIR>/host_key               SSH host key (0600)
    <DATA_DIR>/tls/                   RDP TLS materials
    <DATA_DIR>/recordings/ssh/        JSONL stay recordings
    <DATA_DIR>/recordings/rdp/        RDP replays and MP4s
    <DATA_DIR>/logs/                  Daily-rotated log files
    <DATA_DIR>/audit.jsonl            Audit fallback log

EXIT CODES:
    0 success, 2 usage, 3 policy violation, 4 not found, 5 conflict,
    1 anything else")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway (front-ends, ticker, transcode workers)
    Serve,

    /// Bind a proxy IP to a backend
    ///
    /// The gateway starts listening on the IP within seconds; the
    /// destination of every connection to it is the bound backend.
    Bind {
        /// Proxy IP to allocate
        proxy_ip: String,
        /// Backend name the IP routes to
        backend: String,
    },

    /// Release a proxy IP binding
    ///
    /// Refused while any stay is active on the IP (exit code 5).
    Unbind {
        /// Proxy IP to release
        proxy_ip: String,
    },

    /// Create an access policy
    Grant(GrantArgs),

    /// Revoke a policy
    ///
    /// Stays admitted under it are disconnected within two seconds.
    Revoke {
        /// Policy id to revoke
        policy_id: Uuid,
    },

    /// List stays
    Stays {
        /// Only stays that are currently live
        #[arg(long)]
        active: bool,
    },
}

#[derive(Args)]
struct GrantArgs {
    /// Person handle the grant is for
    #[arg(long, conflicts_with = "user_group")]
    person: Option<String>,

    /// User group the grant is for
    #[arg(long)]
    user_group: Option<String>,

    /// Single backend scope
    #[arg(long, conflicts_with_all = ["server_group", "service"])]
    server: Option<String>,

    /// Server group scope
    #[arg(long, conflicts_with = "service")]
    server_group: Option<String>,

    /// Single service scope as <backend>/<protocol>
    #[arg(long)]
    service: Option<String>,

    /// Granted protocol (ssh, rdp); omitted means any
    #[arg(long)]
    protocol: Option<String>,

    /// Permitted backend logins, comma-separated; omitted means any
    #[arg(long, value_delimiter = ',')]
    logins: Vec<String>,

    /// Pin the grant to one of the subject's source entries (IP or CIDR)
    #[arg(long)]
    source_ip: Option<String>,

    /// Allow -L/-R/SOCKS channels
    #[arg(long)]
    allow_port_forwarding: bool,

    /// Validity start (RFC 3339); omitted means now
    #[arg(long)]
    starts: Option<String>,

    /// Validity end (RFC 3339)
    #[arg(long, conflicts_with = "hours")]
    until: Option<String>,

    /// Validity window length in hours from start
    #[arg(long)]
    hours: Option<u32>,

    /// Weekly window, e.g. "mon-fri 09:00-17:00 Europe/Warsaw"
    #[arg(long)]
    schedule: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(dispatch(cli.command));

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}

async fn dispatch(command: Commands) -> Result<(), GatewayError> {
    let config = Config::from_env()?;

    match command {
        Commands::Serve => {
            init_serve_logging(&config)?;
            gatehouse::daemon::run(config).await
        }
        other => {
            init_cli_logging();
            let store = SqliteStore::open(&config.db_url).await?;
            control(other, &store).await
        }
    }
}

async fn control(command: Commands, store: &SqliteStore) -> Result<(), GatewayError> {
    match command {
        Commands::Serve => unreachable!("serve is dispatched separately"),

        Commands::Bind { proxy_ip, backend } => {
            let proxy_ip = parse_ip(&proxy_ip)?;
            let backend = store
                .directory()
                .backend_by_name(&backend)
                .await?
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("backend '{backend}'"),
                })?;
            let allocation = store.allocations().bind(proxy_ip, backend.id, "cli").await?;
            println!("bound {} -> {} ({})", allocation.proxy_ip, backend.name, backend.address);
            Ok(())
        }

        Commands::Unbind { proxy_ip } => {
            let proxy_ip = parse_ip(&proxy_ip)?;
            store.allocations().release(proxy_ip, "cli").await?;
            println!("released {proxy_ip}");
            Ok(())
        }

        Commands::Grant(args) => {
            let policy = build_policy(store, args).await?;
            store.policies().create(&policy).await?;
            println!("policy {} created", policy.id);
            Ok(())
        }

        Commands::Revoke { policy_id } => {
            store.policies().revoke(policy_id, "cli").await?;
            println!("policy {policy_id} revoked");
            Ok(())
        }

        Commands::Stays { active } => {
            let stays = store.stays().list(active).await?;
            if stays.is_empty() {
                println!("no stays");
                return Ok(());
            }
            for stay in stays {
                let state = stay.termination_reason.map_or_else(
                    || "active".to_owned(),
                    |reason| reason.to_string(),
                );
                println!(
                    "{}  {}  {} -> {}  started {}  {}  in/out {}/{} bytes{}",
                    stay.id,
                    stay.protocol,
                    stay.source_ip,
                    stay.proxy_ip,
                    stay.started_at.format("%Y-%m-%d %H:%M:%S"),
                    state,
                    stay.bytes_in,
                    stay.bytes_out,
                    stay.recording_path.as_deref().map_or_else(String::new, |p| {
                        format!("  recording {}", p.display())
                    }),
                );
            }
            Ok(())
        }
    }
}

async fn build_policy(store: &SqliteStore, args: GrantArgs) -> Result<Policy, GatewayError> {
    use gatehouse::store::GroupKind;

    let (subject_kind, subject_id) = match (&args.person, &args.user_group) {
        (Some(handle), None) => {
            let person = store
                .directory()
                .person_by_handle(handle)
                .await?
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("person '{handle}'"),
                })?;
            (SubjectKind::Person, person.id)
        }
        (None, Some(name)) => {
            let group = store
                .directory()
                .group_by_name(GroupKind::User, name)
                .await?
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("user group '{name}'"),
                })?;
            (SubjectKind::UserGroup, group.id)
        }
        _ => {
            return Err(GatewayError::PolicyViolation {
                what: "exactly one of --person/--user-group is required".to_owned(),
            });
        }
    };

    let mut protocol = args
        .protocol
        .as_deref()
        .map(Protocol::from_str)
        .transpose()
        .map_err(|e| GatewayError::PolicyViolation { what: e.to_string() })?;

    let (scope_kind, scope_id) = match (&args.server, &args.server_group, &args.service) {
        (Some(name), None, None) => {
            let backend = store
                .directory()
                .backend_by_name(name)
                .await?
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("backend '{name}'"),
                })?;
            (ScopeKind::Server, backend.id)
        }
        (None, Some(name), None) => {
            let group = store
                .directory()
                .group_by_name(GroupKind::Server, name)
                .await?
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("server group '{name}'"),
                })?;
            (ScopeKind::ServerGroup, group.id)
        }
        (None, None, Some(service)) => {
            let (name, proto) =
                service
                    .split_once('/')
                    .ok_or_else(|| GatewayError::PolicyViolation {
                        what: format!("--service must be <backend>/<protocol>, got '{service}'"),
                    })?;
            let backend = store
                .directory()
                .backend_by_name(name)
                .await?
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("backend '{name}'"),
                })?;
            protocol = Some(
                Protocol::from_str(proto)
                    .map_err(|e| GatewayError::PolicyViolation { what: e.to_string() })?,
            );
            (ScopeKind::Service, backend.id)
        }
        _ => {
            return Err(GatewayError::PolicyViolation {
                what: "exactly one of --server/--server-group/--service is required".to_owned(),
            });
        }
    };

    let source_ip_id = match &args.source_ip {
        Some(cidr) => {
            if subject_kind != SubjectKind::Person {
                return Err(GatewayError::PolicyViolation {
                    what: "--source-ip pins require a --person subject".to_owned(),
                });
            }
            let wanted: ipnet::IpNet = parse_net(cidr)?;
            let entry = store
                .directory()
                .source_ips_of_person(subject_id)
                .await?
                .into_iter()
                .find(|entry| entry.cidr == wanted)
                .ok_or_else(|| GatewayError::NotFound {
                    what: format!("source entry {cidr} for the subject"),
                })?;
            Some(entry.id)
        }
        None => None,
    };

    let starts_at = match &args.starts {
        Some(text) => parse_ts(text)?,
        None => Utc::now(),
    };
    let ends_at = match (&args.until, args.hours) {
        (Some(text), _) => Some(parse_ts(text)?),
        (None, Some(hours)) => Some(starts_at + chrono::Duration::hours(i64::from(hours))),
        (None, None) => None,
    };

    let schedule = args
        .schedule
        .as_deref()
        .map(WeeklySchedule::parse)
        .transpose()
        .map_err(|e| GatewayError::PolicyViolation { what: e.to_string() })?;

    Ok(Policy {
        id: Uuid::new_v4(),
        subject_kind,
        subject_id,
        scope_kind,
        scope_id,
        protocol,
        ssh_logins: args.logins,
        source_ip_id,
        allow_port_forwarding: args.allow_port_forwarding,
        starts_at,
        ends_at,
        schedule,
        active: true,
        created_at: Utc::now(),
        created_by: "cli".to_owned(),
    })
}

fn parse_ip(text: &str) -> Result<IpAddr, GatewayError> {
    parse_proxy_ip(text).map_err(|e| GatewayError::PolicyViolation { what: e.to_string() })
}

fn parse_net(text: &str) -> Result<ipnet::IpNet, GatewayError> {
    if text.contains('/') {
        text.parse().map_err(|e| GatewayError::PolicyViolation {
            what: format!("invalid CIDR '{text}': {e}"),
        })
    } else {
        parse_ip(text).map(ipnet::IpNet::from)
    }
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, GatewayError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::PolicyViolation {
            what: format!("invalid timestamp '{text}': {e}"),
        })
}

fn init_serve_logging(config: &Config) -> Result<(), GatewayError> {
    std::fs::create_dir_all(config.logs_dir()).map_err(|e| GatewayError::Config {
        what: format!("log directory {}", config.logs_dir().display()),
        source: e.into(),
    })?;

    let file_appender = tracing_appender::rolling::daily(config.logs_dir(), "gatehouse.log");
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatehouse=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_appender),
        )
        .init();
    Ok(())
}

fn init_cli_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatehouse=warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
