//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{MAX_GRACE_PERIOD_MS, MIN_GRACE_PERIOD_MS, TransportKind};
use crate::resilience::RetryPolicy;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "gazette";
const ENV_PREFIX: &str = "GAZETTE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_DB_ACQUIRE_TIMEOUT_MS: u64 = 3_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
const DEFAULT_RETRY_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 2_000;
const DEFAULT_VALIDITY_WINDOW_MS: u64 = 30_000;
const DEFAULT_GRACE_PERIOD_MS: u64 = 175;
const DEFAULT_CHANNEL_CAPACITY: u64 = 256;
const DEFAULT_STORAGE_QUOTA_BYTES: usize = 5 * 1024 * 1024;

/// Command-line arguments for the Gazette binary.
#[derive(Debug, Parser)]
#[command(name = "gazette", version, about = "Gazette article service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "GAZETTE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the HTTP service.
    Serve(Box<ServeArgs>),
    /// Check store connectivity through the retry path and print the health report.
    Probe(ProbeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct DatabaseOverride {
    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub database: DatabaseOverride,

    /// Override the number of attempts the probe makes.
    #[arg(long = "retry-max-attempts", value_name = "COUNT")]
    pub retry_max_attempts: Option<u32>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL")]
    pub database_url: Option<String>,

    /// Override the database pool size.
    #[arg(long = "database-max-connections", value_name = "COUNT")]
    pub database_max_connections: Option<u32>,

    /// Override the number of attempts per store operation.
    #[arg(long = "retry-max-attempts", value_name = "COUNT")]
    pub retry_max_attempts: Option<u32>,

    /// Override the first backoff delay.
    #[arg(long = "retry-base-delay-ms", value_name = "MILLIS")]
    pub retry_base_delay_ms: Option<u64>,

    /// Serve the last good value when the store stays unreachable.
    #[arg(
        long = "smart-fallback",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub smart_fallback: Option<bool>,

    /// Override the post-mutation grace period.
    #[arg(long = "coherence-grace-period-ms", value_name = "MILLIS")]
    pub coherence_grace_period_ms: Option<u64>,

    /// Override the invalidation transport (broadcast|storage).
    #[arg(long = "coherence-transport", value_name = "KIND")]
    pub coherence_transport: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub resilience: ResilienceSettings,
    pub coherence: CoherenceSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
    pub acquire_timeout: Duration,
    pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct ResilienceSettings {
    pub retry: RetryPolicy,
    pub smart_fallback: bool,
}

#[derive(Debug, Clone)]
pub struct CoherenceSettings {
    pub validity_window_ms: u64,
    pub grace_period_ms: u64,
    pub transport: TransportKind,
    pub channel_capacity: NonZeroUsize,
    pub storage_quota_bytes: usize,
    pub eager_refresh: bool,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Probe(args)) => raw.apply_probe_overrides(args),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    resilience: RawResilienceSettings,
    coherence: RawCoherenceSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(attempts) = overrides.retry_max_attempts {
            self.resilience.max_attempts = Some(attempts);
        }
        if let Some(delay) = overrides.retry_base_delay_ms {
            self.resilience.base_delay_ms = Some(delay);
        }
        if let Some(enabled) = overrides.smart_fallback {
            self.resilience.smart_fallback = Some(enabled);
        }
        if let Some(grace) = overrides.coherence_grace_period_ms {
            self.coherence.grace_period_ms = Some(grace);
        }
        if let Some(transport) = overrides.coherence_transport.as_ref() {
            self.coherence.transport = Some(transport.clone());
        }
    }

    fn apply_probe_overrides(&mut self, args: &ProbeArgs) {
        self.apply_database_override(&args.database);
        if let Some(attempts) = args.retry_max_attempts {
            self.resilience.max_attempts = Some(attempts);
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            resilience,
            coherence,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let resilience = build_resilience_settings(resilience)?;
        let coherence = build_coherence_settings(coherence)?;

        Ok(Self {
            server,
            logging,
            database,
            resilience,
            coherence,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        u64::from(
            database
                .max_connections
                .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
        ),
        "database.max_connections",
    )?;

    let acquire_timeout_ms = database
        .acquire_timeout_ms
        .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_MS);
    if acquire_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "database.acquire_timeout_ms",
            "must be greater than zero",
        ));
    }

    Ok(DatabaseSettings {
        url,
        max_connections,
        acquire_timeout: Duration::from_millis(acquire_timeout_ms),
        run_migrations: database.run_migrations.unwrap_or(true),
    })
}

fn build_resilience_settings(
    resilience: RawResilienceSettings,
) -> Result<ResilienceSettings, LoadError> {
    let max_attempts = resilience
        .max_attempts
        .unwrap_or(DEFAULT_RETRY_MAX_ATTEMPTS);
    let base_delay_ms = resilience
        .base_delay_ms
        .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS);
    let backoff_multiplier = resilience
        .backoff_multiplier
        .unwrap_or(DEFAULT_RETRY_BACKOFF_MULTIPLIER);
    let max_delay_ms = resilience
        .max_delay_ms
        .unwrap_or(DEFAULT_RETRY_MAX_DELAY_MS);

    if max_delay_ms < base_delay_ms {
        return Err(LoadError::invalid(
            "resilience.max_delay_ms",
            "must not be smaller than resilience.base_delay_ms",
        ));
    }

    let retry = RetryPolicy::new(max_attempts, base_delay_ms, backoff_multiplier, max_delay_ms)
        .map_err(|err| LoadError::invalid("resilience", err.to_string()))?;

    Ok(ResilienceSettings {
        retry,
        smart_fallback: resilience.smart_fallback.unwrap_or(false),
    })
}

fn build_coherence_settings(
    coherence: RawCoherenceSettings,
) -> Result<CoherenceSettings, LoadError> {
    let validity_window_ms = coherence
        .validity_window_ms
        .unwrap_or(DEFAULT_VALIDITY_WINDOW_MS);
    if validity_window_ms == 0 {
        return Err(LoadError::invalid(
            "coherence.validity_window_ms",
            "must be greater than zero",
        ));
    }

    let grace_period_ms = coherence
        .grace_period_ms
        .unwrap_or(DEFAULT_GRACE_PERIOD_MS);
    if !(MIN_GRACE_PERIOD_MS..=MAX_GRACE_PERIOD_MS).contains(&grace_period_ms) {
        return Err(LoadError::invalid(
            "coherence.grace_period_ms",
            format!("must be between {MIN_GRACE_PERIOD_MS} and {MAX_GRACE_PERIOD_MS}"),
        ));
    }

    let transport = match coherence.transport.as_deref().map(str::trim) {
        None | Some("broadcast") => TransportKind::Broadcast,
        Some("storage") => TransportKind::Storage,
        Some(other) => {
            return Err(LoadError::invalid(
                "coherence.transport",
                format!("unknown transport `{other}`, expected broadcast or storage"),
            ));
        }
    };

    let capacity = coherence
        .channel_capacity
        .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
    let channel_capacity = usize::try_from(capacity)
        .ok()
        .and_then(NonZeroUsize::new)
        .ok_or_else(|| {
            LoadError::invalid("coherence.channel_capacity", "must be greater than zero")
        })?;

    Ok(CoherenceSettings {
        validity_window_ms,
        grace_period_ms,
        transport,
        channel_capacity,
        storage_quota_bytes: coherence
            .storage_quota_bytes
            .unwrap_or(DEFAULT_STORAGE_QUOTA_BYTES),
        eager_refresh: coherence.eager_refresh.unwrap_or(true),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
    acquire_timeout_ms: Option<u64>,
    run_migrations: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawResilienceSettings {
    max_attempts: Option<u32>,
    base_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    max_delay_ms: Option<u64>,
    smart_fallback: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCoherenceSettings {
    validity_window_ms: Option<u64>,
    grace_period_ms: Option<u64>,
    transport: Option<String>,
    channel_capacity: Option<u64>,
    storage_quota_bytes: Option<usize>,
    eager_refresh: Option<bool>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}
