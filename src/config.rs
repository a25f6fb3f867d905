use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

/// Centralized server configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL that signed storage URLs are issued against.
    pub public_url: String,
    pub signing_secret: String,
    pub upload: UploadConfig,
}

/// Immutable tuning of the upload protocol, shared by the coordinator and the
/// chunked uploader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Declared sizes at or below this many bytes use a single signed PUT.
    pub single_put_threshold: u64,
    /// Size of every multipart part except possibly the last.
    pub part_size: u64,
    /// Upper bound on part uploads in flight for one file.
    pub max_concurrent_parts: usize,
    /// Lifetime of every issued signed URL.
    pub url_ttl: Duration,
    /// Prepended to every generated storage key.
    pub key_prefix: String,
    /// Largest part count a multipart sequence may have.
    pub max_parts: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            single_put_threshold: 5 * MIB,
            part_size: 10 * MIB,
            max_concurrent_parts: 3,
            url_ttl: Duration::from_secs(3600),
            key_prefix: String::new(),
            max_parts: 10_000,
        }
    }
}

impl UploadConfig {
    /// Reject values the protocol cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.part_size == 0 {
            bail!("part size must be greater than zero");
        }
        if self.max_concurrent_parts == 0 {
            bail!("max concurrent parts must be at least 1");
        }
        if self.url_ttl.is_zero() {
            bail!("signed URL ttl must be greater than zero");
        }
        if self.max_parts == 0 {
            bail!("max parts must be at least 1");
        }
        Ok(())
    }

    /// Number of parts a file of `size` bytes is split into.
    pub fn parts_count(&self, size: u64) -> u64 {
        size.div_ceil(self.part_size)
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Signed-URL upload coordinator")]
pub struct Args {
    /// Host to bind to (overrides SIGNED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides SIGNED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects and staged parts are stored (overrides SIGNED_UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides SIGNED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for signed links (overrides SIGNED_UPLOAD_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Single PUT threshold in bytes (overrides SIGNED_UPLOAD_SINGLE_PUT_THRESHOLD)
    #[arg(long)]
    pub single_put_threshold: Option<u64>,

    /// Part size in bytes (overrides SIGNED_UPLOAD_PART_SIZE)
    #[arg(long)]
    pub part_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("SIGNED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("SIGNED_UPLOAD_PORT", 4000u16)?;
        let env_storage =
            env::var("SIGNED_UPLOAD_STORAGE_DIR").unwrap_or_else(|_| "./data/objects".into());
        let env_db = env::var("SIGNED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/signed_upload.db".into());

        let defaults = UploadConfig::default();
        let upload = UploadConfig {
            single_put_threshold: match args.single_put_threshold {
                Some(value) => value,
                None => env_parse(
                    "SIGNED_UPLOAD_SINGLE_PUT_THRESHOLD",
                    defaults.single_put_threshold,
                )?,
            },
            part_size: match args.part_size {
                Some(value) => value,
                None => env_parse("SIGNED_UPLOAD_PART_SIZE", defaults.part_size)?,
            },
            max_concurrent_parts: env_parse(
                "SIGNED_UPLOAD_MAX_CONCURRENT_PARTS",
                defaults.max_concurrent_parts,
            )?,
            url_ttl: Duration::from_secs(env_parse(
                "SIGNED_UPLOAD_URL_TTL_SECS",
                defaults.url_ttl.as_secs(),
            )?),
            key_prefix: env::var("SIGNED_UPLOAD_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            max_parts: defaults.max_parts,
        };
        upload.validate()?;

        let port = args.port.unwrap_or(env_port);
        let env_public = env::var("SIGNED_UPLOAD_PUBLIC_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{port}"));

        let signing_secret = match env::var("SIGNED_UPLOAD_SIGNING_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => {
                tracing::warn!(
                    "SIGNED_UPLOAD_SIGNING_SECRET not set; signed URLs will not survive a restart"
                );
                format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
            }
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_url: args
                .public_url
                .unwrap_or(env_public)
                .trim_end_matches('/')
                .to_string(),
            signing_secret,
            upload,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
