//! Configuration surface: CLI flags (`clap`), an optional TOML file, and an
//! environment-variable fallback for the Postgres DSN.
//!
//! Precedence is flag > file > environment > built-in default. Every CLI
//! field that participates in that precedence is `Option<T>` (or, for the
//! two enable-only flags, a plain `bool` that can only turn a file-level
//! `false` into `true`, never the reverse) so "the user didn't pass this"
//! is representable without reaching for `ArgMatches::value_source`.

use std::{env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use canbridge_core::Direction;
use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// Errors resolving the final configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The config file named by `--config` could not be read.
    #[error("could not read config file {path}: {source}")]
    Read {
        /// Path that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The config file's contents were not valid TOML for this schema.
    #[error("could not parse config file {path}: {source}")]
    Parse {
        /// Path whose contents failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },
    /// No CAN interfaces were named by flag or file.
    #[error("no CAN interfaces configured (pass --can-if or set `interfaces` in the config file)")]
    NoInterfaces,
    /// Ingest is enabled but no DSN was supplied by any of flag, file, or `PG_DSN`.
    #[error("ingest is enabled but no Postgres DSN was supplied (--pg-dsn, config file, or PG_DSN env)")]
    MissingDsn,
    /// `--bind` (or `listen_host`/`listen_port`) did not parse as a socket address.
    #[error("invalid listen address {0:?}")]
    InvalidBind(String),
}

/// Command-line arguments for the bridge server.
#[derive(Parser, Debug)]
#[command(name = "canbridge-server")]
#[command(about = "CAN-to-TCP bridge speaking a GVRET-style binary protocol")]
#[command(version)]
pub struct Args {
    /// Optional TOML config file; CLI flags override its values field-by-field.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// CAN interface to bridge; may be repeated for multiple buses, in order.
    #[arg(long = "can-if")]
    pub can_if: Vec<String>,

    /// Enable CAN FD reception/transmission on every configured interface.
    #[arg(long)]
    pub fd: bool,

    /// TCP address to listen on, e.g. `0.0.0.0:23`.
    #[arg(long)]
    pub bind: Option<String>,

    /// Added to each interface's position in `--can-if` to form its bus number.
    #[arg(long)]
    pub bus_offset: Option<u8>,

    /// Postgres connection string for the ingest pipeline.
    #[arg(long)]
    pub pg_dsn: Option<String>,

    /// Enable the durable ingest pipeline.
    #[arg(long)]
    pub ingest: bool,

    /// Directory holding the disk spill store's backing file.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum in-memory ingest queue entries.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Maximum entries committed per ingest transaction.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Seconds between periodic stats logs; 0 disables.
    #[arg(long)]
    pub stats_interval: Option<u64>,

    /// Log level passed to `tracing_subscriber`'s `EnvFilter` when `RUST_LOG` is unset.
    #[arg(long)]
    pub log_level: Option<String>,
}

/// The TOML file schema; every field optional so a partial file only
/// overrides the defaults it mentions.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    interfaces: Option<Vec<String>>,
    bus_offset: Option<u8>,
    fd_mode: Option<bool>,
    listen_host: Option<String>,
    listen_port: Option<u16>,
    default_direction: Option<String>,
    ingest_enabled: Option<bool>,
    ingest_dsn: Option<String>,
    ingest_function_name: Option<String>,
    batch_size: Option<usize>,
    flush_interval_seconds: Option<f64>,
    queue_capacity: Option<usize>,
    queue_flush_threshold_percent: Option<f64>,
    spill_path: Option<PathBuf>,
    spill_max_megabytes: Option<u64>,
    stats_interval_seconds: Option<u64>,
    log_level: Option<String>,
    idle_timeout_seconds: Option<u64>,
}

/// The fully resolved, concrete configuration the rest of the server builds
/// its runtime pieces from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Ordered CAN interface names; position is `socket_index`.
    pub interfaces: Vec<String>,
    /// Added to `socket_index` to form the bus number exposed to clients.
    pub bus_offset: u8,
    /// Whether FD framing is enabled on every interface.
    pub fd_mode: bool,
    /// TCP address the bridge listens on for client connections.
    pub listen_addr: SocketAddr,
    /// Direction tag applied to frames enqueued from the CAN-receive path.
    pub default_direction: Direction,
    /// Whether the durable ingest pipeline runs at all.
    pub ingest_enabled: bool,
    /// Postgres DSN, required when `ingest_enabled`.
    pub ingest_dsn: Option<String>,
    /// Stored procedure name invoked once per queued entry.
    pub ingest_function_name: String,
    /// Maximum entries committed per ingest transaction.
    pub batch_size: usize,
    /// How long the ingest worker waits for the first entry of a batch.
    pub flush_interval: Duration,
    /// In-memory ingest queue capacity.
    pub queue_capacity: usize,
    /// Occupancy ratio (0.0-1.0) that triggers proactive spill.
    pub queue_flush_threshold: f64,
    /// Path to the disk spill store's backing file.
    pub spill_path: PathBuf,
    /// Disk spill store capacity in bytes.
    pub spill_max_bytes: u64,
    /// Interval between periodic stats logs; `None` disables them.
    pub stats_interval: Option<Duration>,
    /// Log level fed to `EnvFilter` when `RUST_LOG` is unset.
    pub log_level: String,
    /// How long a handshaked session may go without sending anything
    /// before the Bridge Core closes it.
    pub idle_timeout: Duration,
}

const DEFAULT_SPILL_FILE: &str = "canbridge-spill.redb";
const DEFAULT_FUNCTION_NAME: &str = "public.ingest_can_frame";

/// Resolves CLI args (plus an optional TOML file and the `PG_DSN`
/// environment variable) into a [`ResolvedConfig`].
///
/// # Errors
///
/// See [`ConfigError`]'s variants.
pub fn resolve(args: &Args) -> Result<ResolvedConfig, ConfigError> {
    let file = match &args.config {
        Some(path) => load_file(path)?,
        None => FileConfig::default(),
    };

    let interfaces =
        if args.can_if.is_empty() { file.interfaces.clone().unwrap_or_default() } else { args.can_if.clone() };
    if interfaces.is_empty() {
        return Err(ConfigError::NoInterfaces);
    }

    let bus_offset = args.bus_offset.or(file.bus_offset).unwrap_or(0);
    let fd_mode = args.fd || file.fd_mode.unwrap_or(false);

    let listen_addr = resolve_listen_addr(args, &file)?;

    let default_direction = match file.default_direction.as_deref() {
        Some("tx") => Direction::Tx,
        _ => Direction::Rx,
    };

    let ingest_enabled = args.ingest || file.ingest_enabled.unwrap_or(false);
    let ingest_dsn = args
        .pg_dsn
        .clone()
        .or_else(|| file.ingest_dsn.clone())
        .or_else(|| env::var("PG_DSN").ok());
    if ingest_enabled && ingest_dsn.is_none() {
        return Err(ConfigError::MissingDsn);
    }

    let ingest_function_name =
        file.ingest_function_name.clone().unwrap_or_else(|| DEFAULT_FUNCTION_NAME.to_string());
    let batch_size = args.batch_size.or(file.batch_size).unwrap_or(500);
    let flush_interval = Duration::from_secs_f64(file.flush_interval_seconds.unwrap_or(0.5));
    let queue_capacity = args.queue_capacity.or(file.queue_capacity).unwrap_or(50_000);
    let queue_flush_threshold = (file.queue_flush_threshold_percent.unwrap_or(50.0) / 100.0).clamp(0.0, 1.0);

    let spill_path = args
        .cache_dir
        .clone()
        .map(|dir| dir.join(DEFAULT_SPILL_FILE))
        .or_else(|| file.spill_path.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SPILL_FILE));
    let spill_max_bytes = file.spill_max_megabytes.unwrap_or(1024) * 1024 * 1024;

    let stats_interval_seconds = args.stats_interval.or(file.stats_interval_seconds).unwrap_or(30);
    let stats_interval =
        if stats_interval_seconds == 0 { None } else { Some(Duration::from_secs(stats_interval_seconds)) };

    let log_level = args.log_level.clone().or(file.log_level.clone()).unwrap_or_else(|| "info".to_string());
    let idle_timeout = Duration::from_secs(file.idle_timeout_seconds.unwrap_or(120));

    Ok(ResolvedConfig {
        interfaces,
        bus_offset,
        fd_mode,
        listen_addr,
        default_direction,
        ingest_enabled,
        ingest_dsn,
        ingest_function_name,
        batch_size,
        flush_interval,
        queue_capacity,
        queue_flush_threshold,
        spill_path,
        spill_max_bytes,
        stats_interval,
        log_level,
        idle_timeout,
    })
}

fn resolve_listen_addr(args: &Args, file: &FileConfig) -> Result<SocketAddr, ConfigError> {
    if let Some(bind) = &args.bind {
        return bind.parse().map_err(|_| ConfigError::InvalidBind(bind.clone()));
    }
    let host = file.listen_host.clone().unwrap_or_else(|| "0.0.0.0".to_string());
    let port = file.listen_port.unwrap_or(23);
    format!("{host}:{port}").parse().map_err(|_| ConfigError::InvalidBind(format!("{host}:{port}")))
}

fn load_file(path: &PathBuf) -> Result<FileConfig, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.clone(), source })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.clone(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args {
            config: None,
            can_if: vec![],
            fd: false,
            bind: None,
            bus_offset: None,
            pg_dsn: None,
            ingest: false,
            cache_dir: None,
            queue_capacity: None,
            batch_size: None,
            stats_interval: None,
            log_level: None,
        }
    }

    #[test]
    fn missing_interfaces_is_an_error() {
        let args = base_args();
        assert!(matches!(resolve(&args), Err(ConfigError::NoInterfaces)));
    }

    #[test]
    fn ingest_without_dsn_is_an_error() {
        // Relies on PG_DSN being unset in the test process; nothing else in
        // this workspace sets it.
        let mut args = base_args();
        args.can_if = vec!["can0".to_string()];
        args.ingest = true;
        assert!(matches!(resolve(&args), Err(ConfigError::MissingDsn)));
    }

    #[test]
    fn defaults_are_applied_when_nothing_is_configured() {
        let mut args = base_args();
        args.can_if = vec!["can0".to_string(), "can1".to_string()];
        let resolved = resolve(&args).expect("minimal config resolves");

        assert_eq!(resolved.interfaces, vec!["can0", "can1"]);
        assert_eq!(resolved.bus_offset, 0);
        assert!(!resolved.fd_mode);
        assert_eq!(resolved.listen_addr, "0.0.0.0:23".parse().unwrap());
        assert_eq!(resolved.batch_size, 500);
        assert_eq!(resolved.queue_capacity, 50_000);
        assert!((resolved.queue_flush_threshold - 0.5).abs() < f64::EPSILON);
        assert_eq!(resolved.stats_interval, Some(Duration::from_secs(30)));
        assert!(!resolved.ingest_enabled);
    }

    #[test]
    fn cli_flags_override_file_values() {
        let mut args = base_args();
        args.can_if = vec!["can0".to_string()];
        args.bus_offset = Some(5);
        args.batch_size = Some(10);

        let resolved = resolve(&args).expect("resolves");
        assert_eq!(resolved.bus_offset, 5);
        assert_eq!(resolved.batch_size, 10);
    }

    #[test]
    fn zero_stats_interval_disables_stats() {
        let mut args = base_args();
        args.can_if = vec!["can0".to_string()];
        args.stats_interval = Some(0);

        let resolved = resolve(&args).expect("resolves");
        assert_eq!(resolved.stats_interval, None);
    }
}
