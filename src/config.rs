use crate::services::{encryption::Keyring, s3_storage::S3Settings};
use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose};
use clap::Parser;
use std::{env, fmt, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "TRANSFER_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Redis for chunk sessions and counters; in-process store when absent.
    pub redis_url: Option<String>,
    /// S3/R2 object storage; local disk under `storage_dir` when absent.
    pub s3: Option<S3Settings>,
    /// Base64 of the 32 byte key new uploads are sealed with.
    pub encryption_key: String,
    pub encryption_key_id: String,
    /// `id:base64` pairs that can still open older objects.
    pub retired_keys: Vec<(String, String)>,
    pub frontend_url: String,
    pub public_url: String,
    /// Honour `X-Forwarded-For`. Only safe behind a proxy that overwrites it.
    pub trust_forwarded_for: bool,
    /// Per-IP byte budget over `upload_window`. Zero disables the budget.
    pub upload_limit_bytes: u64,
    pub upload_window: Duration,
    pub chunk_ttl: Duration,
    pub file_ttl_days: i64,
    pub direct_transfer_ttl_mins: i64,
    /// How long an emailed verification code stays valid.
    pub email_code_ttl: Duration,
    /// How long a verified sender address stays verified.
    pub email_verified_ttl: Duration,
    /// Refuse email transfers from senders that have not verified.
    pub require_verified_sender: bool,
    pub cleanup_interval: Duration,
    pub storage_timeout: Duration,
    pub notification_max_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 3000,
            storage_dir: "./data/objects".into(),
            database_url: "sqlite://./data/meta/transfers.db".into(),
            redis_url: None,
            s3: None,
            encryption_key: String::new(),
            encryption_key_id: "k1".into(),
            retired_keys: Vec::new(),
            frontend_url: "http://localhost:5173".into(),
            public_url: "http://localhost:3000".into(),
            trust_forwarded_for: false,
            upload_limit_bytes: 1024 * 1024 * 1024,
            upload_window: Duration::from_secs(24 * 60 * 60),
            chunk_ttl: Duration::from_secs(60 * 60),
            file_ttl_days: 3,
            direct_transfer_ttl_mins: 60,
            email_code_ttl: Duration::from_secs(15 * 60),
            email_verified_ttl: Duration::from_secs(24 * 60 * 60),
            require_verified_sender: false,
            cleanup_interval: Duration::from_secs(60),
            storage_timeout: Duration::from_secs(300),
            notification_max_attempts: 3,
        }
    }
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<set>"))
            .field("s3", &self.s3)
            .field("encryption_key_id", &self.encryption_key_id)
            .field("frontend_url", &self.frontend_url)
            .field("public_url", &self.public_url)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .field("upload_limit_bytes", &self.upload_limit_bytes)
            .field("upload_window", &self.upload_window)
            .field("chunk_ttl", &self.chunk_ttl)
            .field("file_ttl_days", &self.file_ttl_days)
            .field("direct_transfer_ttl_mins", &self.direct_transfer_ttl_mins)
            .field("email_code_ttl", &self.email_code_ttl)
            .field("email_verified_ttl", &self.email_verified_ttl)
            .field("require_verified_sender", &self.require_verified_sender)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("storage_timeout", &self.storage_timeout)
            .field("notification_max_attempts", &self.notification_max_attempts)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Ephemeral encrypted file transfer API")]
pub struct Args {
    /// Host to bind to (overrides TRANSFER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides TRANSFER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored without S3 (overrides TRANSFER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides TRANSFER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Redis URL (overrides TRANSFER_REDIS_URL)
    #[arg(long)]
    pub redis_url: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |name| env::var(name).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over variables from `lookup` over defaults.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(format!("{ENV_PREFIX}{name}").as_str()).filter(|value| !value.trim().is_empty())
        };
        let defaults = Self::default();

        let s3 = match var("S3_BUCKET") {
            Some(bucket) => Some(S3Settings {
                bucket,
                endpoint: var("S3_ENDPOINT"),
                region: var("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
                access_key: var("S3_ACCESS_KEY"),
                secret_key: var("S3_SECRET_KEY"),
                operation_timeout: Duration::from_secs(parse_or(
                    &var,
                    "STORAGE_TIMEOUT_SECS",
                    defaults.storage_timeout.as_secs(),
                )?),
            }),
            None => None,
        };

        let retired_keys = match var("RETIRED_KEYS") {
            Some(raw) => parse_retired_keys(&raw)?,
            None => Vec::new(),
        };

        let cfg = Self {
            host: args.host.or_else(|| var("HOST")).unwrap_or(defaults.host),
            port: match args.port {
                Some(port) => port,
                None => parse_or(&var, "PORT", defaults.port)?,
            },
            storage_dir: args
                .storage_dir
                .or_else(|| var("STORAGE_DIR"))
                .unwrap_or(defaults.storage_dir),
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or(defaults.database_url),
            redis_url: args.redis_url.or_else(|| var("REDIS_URL")),
            s3,
            encryption_key: var("ENCRYPTION_KEY").unwrap_or_default(),
            encryption_key_id: var("ENCRYPTION_KEY_ID").unwrap_or(defaults.encryption_key_id),
            retired_keys,
            frontend_url: var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            public_url: var("PUBLIC_URL").unwrap_or(defaults.public_url),
            trust_forwarded_for: parse_or(
                &var,
                "TRUST_FORWARDED_FOR",
                defaults.trust_forwarded_for,
            )?,
            upload_limit_bytes: parse_or(&var, "UPLOAD_LIMIT_BYTES", defaults.upload_limit_bytes)?,
            upload_window: Duration::from_secs(parse_or(
                &var,
                "UPLOAD_WINDOW_SECS",
                defaults.upload_window.as_secs(),
            )?),
            chunk_ttl: Duration::from_secs(parse_or(
                &var,
                "CHUNK_TTL_SECS",
                defaults.chunk_ttl.as_secs(),
            )?),
            file_ttl_days: parse_or(&var, "FILE_TTL_DAYS", defaults.file_ttl_days)?,
            direct_transfer_ttl_mins: parse_or(
                &var,
                "DIRECT_TRANSFER_TTL_MINS",
                defaults.direct_transfer_ttl_mins,
            )?,
            email_code_ttl: Duration::from_secs(parse_or(
                &var,
                "EMAIL_CODE_TTL_SECS",
                defaults.email_code_ttl.as_secs(),
            )?),
            email_verified_ttl: Duration::from_secs(parse_or(
                &var,
                "EMAIL_VERIFIED_TTL_SECS",
                defaults.email_verified_ttl.as_secs(),
            )?),
            require_verified_sender: parse_or(
                &var,
                "REQUIRE_VERIFIED_SENDER",
                defaults.require_verified_sender,
            )?,
            cleanup_interval: Duration::from_secs(parse_or(
                &var,
                "CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )?),
            storage_timeout: Duration::from_secs(parse_or(
                &var,
                "STORAGE_TIMEOUT_SECS",
                defaults.storage_timeout.as_secs(),
            )?),
            notification_max_attempts: parse_or(
                &var,
                "NOTIFICATION_MAX_ATTEMPTS",
                defaults.notification_max_attempts,
            )?,
        };

        if cfg.chunk_ttl.is_zero()
            || cfg.upload_window.is_zero()
            || cfg.cleanup_interval.is_zero()
            || cfg.email_code_ttl.is_zero()
            || cfg.email_verified_ttl.is_zero()
        {
            bail!("TTL, window and interval settings must be greater than zero");
        }
        if cfg.file_ttl_days <= 0 || cfg.direct_transfer_ttl_mins <= 0 {
            bail!("file and direct transfer lifetimes must be positive");
        }
        Ok(cfg)
    }

    /// Build the keyring from the configured key material.
    pub fn keyring(&self) -> Result<Keyring> {
        if self.encryption_key.is_empty() {
            bail!("{ENV_PREFIX}ENCRYPTION_KEY must be set");
        }
        let mut keyring = Keyring::new(
            self.encryption_key_id.clone(),
            decode_key(&self.encryption_key)
                .with_context(|| format!("decoding {ENV_PREFIX}ENCRYPTION_KEY"))?,
        )?;
        for (id, key) in &self.retired_keys {
            keyring = keyring.with_retired_key(
                id.clone(),
                decode_key(key).with_context(|| format!("decoding retired key `{id}`"))?,
            )?;
        }
        Ok(keyring)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{}`", value)),
        None => Ok(default),
    }
}

fn parse_retired_keys(raw: &str) -> Result<Vec<(String, String)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((id, key)) if !id.is_empty() && !key.is_empty() => {
                Ok((id.to_string(), key.to_string()))
            }
            _ => bail!("{ENV_PREFIX}RETIRED_KEYS entries must look like `id:base64key`"),
        })
        .collect()
}

fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(encoded.trim())?)
}
