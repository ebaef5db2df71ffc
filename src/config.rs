use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const MIB: u64 = 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub max_connections: u32,
    pub log_json: bool,
    /// Transient storage for bytes of in-flight sessions.
    pub buffer: BackendConfig,
    /// Final storage for verified objects.
    pub durable: BackendConfig,
    pub upload: UploadSettings,
    pub lock: LockSettings,
    pub scheduler: SchedulerSettings,
    pub transfer: TransferSettings,
    pub pipeline: PipelineSettings,
}

#[derive(Debug, Clone)]
pub enum BackendConfig {
    Filesystem {
        root: PathBuf,
        /// Redundancy of the backend, when it shards objects.
        min_shards: Option<u32>,
    },
    S3(S3Config),
}

#[derive(Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub force_path_style: bool,
    pub min_shards: Option<u32>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("force_path_style", &self.force_path_style)
            .field("min_shards", &self.min_shards)
            .finish_non_exhaustive()
    }
}

/// What an event queue does when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for room.
    Block,
    /// Discard the event with a warning.
    Drop,
}

impl FromStr for OverflowPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" => Ok(OverflowPolicy::Block),
            "drop" => Ok(OverflowPolicy::Drop),
            other => bail!("unknown overflow policy `{}` (expected block|drop)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    /// Mount point of the chunked-upload endpoint.
    pub base_path: String,
    /// Bucket inside the buffer backend.
    pub buffer_bucket: String,
    pub max_upload_size: u64,
    /// Largest body accepted by the single-request upload endpoint.
    pub max_post_size: u64,
    /// Size of the multipart parts written to the buffer.
    pub buffer_part_size: u64,
    pub event_queue_capacity: usize,
    pub event_workers: usize,
    pub progress_overflow: OverflowPolicy,
    pub lifecycle_overflow: OverflowPolicy,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            base_path: "/upload/tus".into(),
            buffer_bucket: "tus-buffer".into(),
            max_upload_size: 10 * 1024 * MIB,
            max_post_size: 64 * MIB,
            buffer_part_size: 5 * MIB,
            event_queue_capacity: 256,
            event_workers: 4,
            progress_overflow: OverflowPolicy::Drop,
            lifecycle_overflow: OverflowPolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockerMode {
    /// Lock records in the shared database.
    Db,
    /// Process-local leases; single node only.
    Memory,
}

impl FromStr for LockerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "db" => Ok(LockerMode::Db),
            "memory" => Ok(LockerMode::Memory),
            other => bail!("unknown locker mode `{}` (expected db|memory)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockSettings {
    pub mode: LockerMode,
    pub acquirer_poll_interval: Duration,
    pub holder_poll_interval: Duration,
    pub ttl: Duration,
    /// How long a chunked-upload request waits for its session lock.
    pub acquire_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            mode: LockerMode::Db,
            acquirer_poll_interval: Duration::from_secs(2),
            holder_poll_interval: Duration::from_secs(5),
            ttl: Duration::from_secs(30 * 60),
            acquire_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub cluster_enabled: bool,
    pub max_concurrent_jobs: usize,
    /// Interval at which clustered nodes look for jobs created elsewhere.
    pub poll_interval: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            cluster_enabled: false,
            max_concurrent_jobs: 8,
            poll_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Part size when the destination has no redundancy scheme.
    pub min_part_size: u64,
    /// Backend-imposed ceiling on part count.
    pub max_parts: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            min_part_size: 5 * MIB,
            max_parts: 9500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Objects at or above this size go through a multipart transfer.
    pub multipart_threshold: u64,
    pub store_max_attempts: u32,
    pub store_retry_base: Duration,
    pub stale_session_ttl: Duration,
    pub reap_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            multipart_threshold: 32 * MIB,
            store_max_attempts: 5,
            store_retry_base: Duration::from_secs(30),
            stale_session_ttl: Duration::from_secs(24 * 60 * 60),
            reap_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            database_url: "sqlite://./data/meta/portal.db".into(),
            max_connections: 5,
            log_json: false,
            buffer: BackendConfig::Filesystem {
                root: PathBuf::from("./data/buffer"),
                min_shards: None,
            },
            durable: BackendConfig::Filesystem {
                root: PathBuf::from("./data/objects"),
                min_shards: None,
            },
            upload: UploadSettings::default(),
            lock: LockSettings::default(),
            scheduler: SchedulerSettings::default(),
            transfer: TransferSettings::default(),
            pipeline: PipelineSettings::default(),
        }
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable upload portal")]
pub struct Args {
    /// Host to bind to (overrides PORTAL_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORTAL_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides PORTAL_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Buffer directory for the filesystem buffer backend (overrides PORTAL_BUFFER_DIR)
    #[arg(long)]
    pub buffer_dir: Option<PathBuf>,

    /// Directory for the filesystem durable backend (overrides PORTAL_DURABLE_DIR)
    #[arg(long)]
    pub durable_dir: Option<PathBuf>,

    /// Lock backend: db | memory (overrides PORTAL_LOCKER_MODE)
    #[arg(long)]
    pub locker_mode: Option<String>,

    /// Serialize job runs across nodes (overrides PORTAL_CLUSTER_ENABLED)
    #[arg(long)]
    pub cluster: bool,

    /// Emit logs as JSON (overrides PORTAL_LOG_JSON)
    #[arg(long)]
    pub log_json: bool,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let defaults = Self::default();

        // --- Environment fallback ---
        let env_host = env::var("PORTAL_HOST").unwrap_or(defaults.host);
        let env_port = env_parse("PORTAL_PORT", defaults.port)?;
        let env_db = env::var("PORTAL_DATABASE_URL").unwrap_or(defaults.database_url);

        let buffer = backend_from_env("PORTAL_BUFFER", args.buffer_dir, "./data/buffer")?;
        let durable = backend_from_env("PORTAL_DURABLE", args.durable_dir, "./data/objects")?;

        let upload = UploadSettings {
            base_path: env::var("PORTAL_TUS_PATH").unwrap_or(defaults.upload.base_path),
            buffer_bucket: env::var("PORTAL_BUFFER_BUCKET")
                .unwrap_or(defaults.upload.buffer_bucket),
            max_upload_size: env_parse("PORTAL_MAX_UPLOAD_SIZE", defaults.upload.max_upload_size)?,
            max_post_size: env_parse("PORTAL_MAX_POST_SIZE", defaults.upload.max_post_size)?,
            buffer_part_size: env_parse(
                "PORTAL_BUFFER_PART_SIZE",
                defaults.upload.buffer_part_size,
            )?,
            event_queue_capacity: env_parse(
                "PORTAL_EVENT_QUEUE_CAPACITY",
                defaults.upload.event_queue_capacity,
            )?,
            event_workers: env_parse("PORTAL_EVENT_WORKERS", defaults.upload.event_workers)?,
            progress_overflow: env_parse(
                "PORTAL_PROGRESS_OVERFLOW",
                defaults.upload.progress_overflow,
            )?,
            lifecycle_overflow: env_parse(
                "PORTAL_LIFECYCLE_OVERFLOW",
                defaults.upload.lifecycle_overflow,
            )?,
        };

        let locker_mode = match args.locker_mode {
            Some(mode) => mode.parse()?,
            None => env_parse("PORTAL_LOCKER_MODE", defaults.lock.mode)?,
        };
        let lock = LockSettings {
            mode: locker_mode,
            acquirer_poll_interval: env_millis(
                "PORTAL_LOCK_ACQUIRER_POLL_MS",
                defaults.lock.acquirer_poll_interval,
            )?,
            holder_poll_interval: env_millis(
                "PORTAL_LOCK_HOLDER_POLL_MS",
                defaults.lock.holder_poll_interval,
            )?,
            ttl: env_secs("PORTAL_LOCK_TTL_SECS", defaults.lock.ttl)?,
            acquire_timeout: env_secs(
                "PORTAL_LOCK_ACQUIRE_TIMEOUT_SECS",
                defaults.lock.acquire_timeout,
            )?,
        };

        let scheduler = SchedulerSettings {
            cluster_enabled: args.cluster
                || env_parse("PORTAL_CLUSTER_ENABLED", defaults.scheduler.cluster_enabled)?,
            max_concurrent_jobs: env_parse(
                "PORTAL_MAX_CONCURRENT_JOBS",
                defaults.scheduler.max_concurrent_jobs,
            )?,
            poll_interval: env_secs(
                "PORTAL_SCHEDULER_POLL_SECS",
                defaults.scheduler.poll_interval,
            )?,
        };

        let transfer = TransferSettings {
            min_part_size: env_parse("PORTAL_MIN_PART_SIZE", defaults.transfer.min_part_size)?,
            max_parts: env_parse("PORTAL_MAX_PARTS", defaults.transfer.max_parts)?,
        };

        let pipeline = PipelineSettings {
            multipart_threshold: env_parse(
                "PORTAL_MULTIPART_THRESHOLD",
                defaults.pipeline.multipart_threshold,
            )?,
            store_max_attempts: env_parse(
                "PORTAL_STORE_MAX_ATTEMPTS",
                defaults.pipeline.store_max_attempts,
            )?,
            store_retry_base: env_secs(
                "PORTAL_STORE_RETRY_BASE_SECS",
                defaults.pipeline.store_retry_base,
            )?,
            stale_session_ttl: env_secs(
                "PORTAL_STALE_SESSION_TTL_SECS",
                defaults.pipeline.stale_session_ttl,
            )?,
            reap_interval: env_secs("PORTAL_REAP_INTERVAL_SECS", defaults.pipeline.reap_interval)?,
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            max_connections: env_parse("PORTAL_MAX_CONNECTIONS", defaults.max_connections)?,
            log_json: args.log_json || env_parse("PORTAL_LOG_JSON", defaults.log_json)?,
            buffer,
            durable,
            upload,
            lock,
            scheduler,
            transfer,
            pipeline,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `name`, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    env_parse(name, default.as_millis() as u64).map(Duration::from_millis)
}

/// `{prefix}_BACKEND` selects `filesystem` (default) or `s3`.
fn backend_from_env(
    prefix: &str,
    dir_override: Option<PathBuf>,
    default_dir: &str,
) -> Result<BackendConfig> {
    let kind = env::var(format!("{prefix}_BACKEND")).unwrap_or_else(|_| "filesystem".into());
    let min_shards = match env::var(format!("{prefix}_MIN_SHARDS")) {
        Ok(value) => Some(
            value
                .parse::<u32>()
                .with_context(|| format!("parsing {prefix}_MIN_SHARDS value `{}`", value))?,
        ),
        Err(_) => None,
    };

    match kind.to_ascii_lowercase().as_str() {
        "filesystem" | "fs" => {
            let root = dir_override
                .or_else(|| env::var(format!("{prefix}_DIR")).ok().map(PathBuf::from))
                .unwrap_or_else(|| PathBuf::from(default_dir));
            Ok(BackendConfig::Filesystem { root, min_shards })
        }
        "s3" => Ok(BackendConfig::S3(S3Config {
            endpoint: env::var(format!("{prefix}_S3_ENDPOINT")).ok(),
            region: env::var(format!("{prefix}_S3_REGION")).unwrap_or_else(|_| "us-east-1".into()),
            access_key_id: env::var(format!("{prefix}_S3_ACCESS_KEY_ID")).ok(),
            secret_access_key: env::var(format!("{prefix}_S3_SECRET_ACCESS_KEY")).ok(),
            force_path_style: env_parse(&format!("{prefix}_S3_FORCE_PATH_STYLE"), true)?,
            min_shards,
        })),
        other => bail!("unknown backend `{}` for {}_BACKEND", other, prefix),
    }
}
