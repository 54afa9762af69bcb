//! Run configuration and process-wide logging setup.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_MIN_DELAY_MS: u64 = 10;
pub const DEFAULT_MAX_DELAY_MS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no actions registered")]
    NoActions,
    #[error("action {action} has invalid weight {weight}")]
    InvalidWeight { action: String, weight: f64 },
    #[error("total action weight is zero")]
    ZeroTotalWeight,
    #[error("cannot sample action weights: {0}")]
    Weights(String),
    #[error("pool size must be at least 1")]
    PoolSize,
    #[error("pacing range {min_ms}..={max_ms} ms is empty")]
    Pacing { min_ms: u64, max_ms: u64 },
    #[error("validation poll interval must be positive")]
    PollInterval,
    #[error("clock year range {start}..={end} is empty or out of bounds")]
    ClockRange { start: i32, end: i32 },
    #[error("snapshot root {snapshot_root:?} lies inside the artifact directory {artifact_dir:?}")]
    SnapshotInsideArtifacts {
        snapshot_root: PathBuf,
        artifact_dir: PathBuf,
    },
    #[error("failed reading configuration {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Number of pool threads executing actions.
    pub pool_size: usize,
    pub pacing: PacingConfig,
    pub validation: ValidationConfig,
    pub clock: ClockConfig,
    pub environment: EnvironmentConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            pacing: PacingConfig::default(),
            validation: ValidationConfig::default(),
            clock: ClockConfig::default(),
            environment: EnvironmentConfig::default(),
        }
    }
}

/// Wall-clock delay between two submissions, drawn uniformly per submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PacingConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: DEFAULT_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Wall-clock sleep between two validation passes.
    pub poll_interval_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl ValidationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClockConfig {
    /// Clock store file, relative to the environment's project directory.
    pub store: PathBuf,
    pub start_year: i32,
    pub end_year: i32,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            store: PathBuf::from("tmp/faketime"),
            start_year: 2020,
            end_year: 2030,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentKind {
    /// Two MTAs brought up with `docker compose`.
    Compose,
    /// In-process loopback delivery, no external services.
    Local,
}

impl std::str::FromStr for EnvironmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compose" => Ok(Self::Compose),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown environment kind: {other}")),
        }
    }
}

impl std::fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Compose => write!(f, "compose"),
            Self::Local => write!(f, "local"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvironmentConfig {
    pub kind: EnvironmentKind,
    /// Directory holding `docker-compose.yml`; relative paths below resolve against it.
    pub project_dir: PathBuf,
    /// Where the receiving MTA delivers mail.
    pub artifact_dir: PathBuf,
    /// Parent of the per-seed snapshot directories used by the twin run.
    pub snapshot_root: PathBuf,
    /// Env file read by compose, carries the initial `FAKETIME`.
    pub env_file: PathBuf,
    pub send_service: String,
    pub receive_service: String,
    /// Config files the MTAs refuse to load unless owned by root.
    pub root_owned_configs: Vec<PathBuf>,
    /// Uid/gid the receiving MTA delivers as.
    pub mail_owner: u32,
    pub queue_poll_ms: u64,
    pub queue_timeout_ms: u64,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            kind: EnvironmentKind::Compose,
            project_dir: PathBuf::from("."),
            artifact_dir: PathBuf::from("tmp/mail"),
            snapshot_root: PathBuf::from("tmp"),
            env_file: PathBuf::from("tmp.env"),
            send_service: "exim_send".to_owned(),
            receive_service: "exim_receive".to_owned(),
            root_owned_configs: vec![
                PathBuf::from("exim/send.conf"),
                PathBuf::from("exim/receive.conf"),
            ],
            mail_owner: 101,
            queue_poll_ms: 10,
            queue_timeout_ms: 30_000,
        }
    }
}

impl EnvironmentConfig {
    /// Resolves `path` against the project directory unless it is absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.resolve(&self.artifact_dir)
    }

    pub fn snapshot_root(&self) -> PathBuf {
        self.resolve(&self.snapshot_root)
    }

    pub fn env_file(&self) -> PathBuf {
        self.resolve(&self.env_file)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

impl SimulationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        tracing::debug!(?path, "Loaded simulation configuration");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Config for an in-process run rooted at `dir`.
    pub fn local(dir: impl Into<PathBuf>) -> Self {
        Self {
            environment: EnvironmentConfig {
                kind: EnvironmentKind::Local,
                project_dir: dir.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn clock_store(&self) -> PathBuf {
        self.environment.resolve(&self.clock.store)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::PoolSize);
        }
        if self.pacing.min_delay_ms > self.pacing.max_delay_ms {
            return Err(ConfigError::Pacing {
                min_ms: self.pacing.min_delay_ms,
                max_ms: self.pacing.max_delay_ms,
            });
        }
        if self.validation.poll_interval_ms == 0 {
            return Err(ConfigError::PollInterval);
        }
        let years_valid = self.clock.start_year <= self.clock.end_year
            && chrono::NaiveDate::from_ymd_opt(self.clock.start_year, 1, 1).is_some()
            && chrono::NaiveDate::from_ymd_opt(self.clock.end_year, 12, 31).is_some();
        if !years_valid {
            return Err(ConfigError::ClockRange {
                start: self.clock.start_year,
                end: self.clock.end_year,
            });
        }
        let artifact_dir = self.environment.artifact_dir();
        let snapshot_root = self.environment.snapshot_root();
        if snapshot_root.starts_with(&artifact_dir) {
            return Err(ConfigError::SnapshotInsideArtifacts {
                snapshot_root,
                artifact_dir,
            });
        }
        Ok(())
    }
}

/// Installs the global tracing subscriber. Later calls are no-ops.
///
/// `RUST_LOG` overrides the default level, `MAILDST_LOG_FORMAT=json` switches
/// to JSON output and `MAILDST_LOG_TO_STDERR` redirects output to stderr.
pub fn set_logger(level: Option<tracing::level_filters::LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(err) = init_tracer(level) {
            eprintln!("failed tracing initialization: {err}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}

#[cfg(feature = "trace")]
fn init_tracer(
    level: Option<tracing::level_filters::LevelFilter>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    let default_filter = if cfg!(any(test, debug_assertions)) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter_layer = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(level.unwrap_or(default_filter).into())
        .from_env_lossy();

    let to_stderr = std::env::var("MAILDST_LOG_TO_STDERR").is_ok();
    let use_json = std::env::var("MAILDST_LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);
    let with_location = cfg!(any(test, debug_assertions));

    let fmt_layer = match (use_json, to_stderr) {
        (true, true) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .json()
            .with_file(with_location)
            .with_line_number(with_location)
            .with_writer(std::io::stderr)
            .boxed(),
        (true, false) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .json()
            .with_file(with_location)
            .with_line_number(with_location)
            .boxed(),
        (false, true) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_thread_names(true)
            .with_file(with_location)
            .with_line_number(with_location)
            .with_writer(std::io::stderr)
            .boxed(),
        (false, false) => tracing_subscriber::fmt::layer()
            .with_level(true)
            .with_thread_names(true)
            .with_file(with_location)
            .with_line_number(with_location)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(filter_layer))
        .try_init()?;
    Ok(())
}
