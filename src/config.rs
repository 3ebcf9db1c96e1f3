use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr, time::Duration};

/// Which search index backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IndexBackend {
    /// In-process index, lost on restart.
    Memory,
    Elasticsearch,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_dir: String,
    pub product_bucket: String,
    pub public_base_url: String,
    pub presign_secret: String,
    pub presign_expiry: Duration,
    pub index_backend: IndexBackend,
    pub elasticsearch_url: String,
    pub elasticsearch_index: String,
    pub admin_role: String,
    pub request_timeout: Duration,
    /// `None` disables the periodic index sweep.
    pub reconcile_interval: Option<Duration>,
    /// Products re-upserted per page during a sweep.
    pub reconcile_batch_size: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Product catalog API")]
pub struct Args {
    /// Host to bind to (overrides CATALOG_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CATALOG_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides CATALOG_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Directory where image objects are stored (overrides CATALOG_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Bucket holding product images (overrides CATALOG_PRODUCT_BUCKET)
    #[arg(long)]
    pub product_bucket: Option<String>,

    /// Base URL used in presigned links (overrides CATALOG_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Search index backend (overrides CATALOG_INDEX_BACKEND)
    #[arg(long, value_enum)]
    pub index_backend: Option<IndexBackend>,

    /// Elasticsearch base URL (overrides CATALOG_ELASTICSEARCH_URL)
    #[arg(long)]
    pub elasticsearch_url: Option<String>,

    /// Elasticsearch index name (overrides CATALOG_ELASTICSEARCH_INDEX)
    #[arg(long)]
    pub elasticsearch_index: Option<String>,

    /// Seconds between full index sweeps, 0 disables (overrides CATALOG_RECONCILE_INTERVAL_SECS)
    #[arg(long)]
    pub reconcile_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse())
    }

    fn resolve(args: Args) -> Result<(Self, bool)> {
        let migrate = args.migrate;

        // --- Environment fallback ---
        let env_port = env_parse("CATALOG_PORT", 3000u16)?;
        let port = args.port.unwrap_or(env_port);

        let index_backend = match args.index_backend {
            Some(backend) => backend,
            None => match env::var("CATALOG_INDEX_BACKEND") {
                Ok(value) => <IndexBackend as ValueEnum>::from_str(&value, true)
                    .map_err(anyhow::Error::msg)
                    .with_context(|| format!("parsing CATALOG_INDEX_BACKEND value `{}`", value))?,
                Err(env::VarError::NotPresent) => IndexBackend::Memory,
                Err(err) => return Err(err).context("reading CATALOG_INDEX_BACKEND"),
            },
        };

        let reconcile_secs = match args.reconcile_interval_secs {
            Some(secs) => secs,
            None => env_parse("CATALOG_RECONCILE_INTERVAL_SECS", 300u64)?,
        };
        let request_timeout = env_parse("CATALOG_REQUEST_TIMEOUT_SECS", 30u64)?;
        if request_timeout == 0 {
            bail!("CATALOG_REQUEST_TIMEOUT_SECS must be greater than zero");
        }

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or_else(|| env_or("CATALOG_HOST", "0.0.0.0")),
            port,
            database_url: args
                .database_url
                .unwrap_or_else(|| env_or("CATALOG_DATABASE_URL", "sqlite://./data/catalog.db")),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("CATALOG_STORAGE_DIR", "./data/objects")),
            product_bucket: args
                .product_bucket
                .unwrap_or_else(|| env_or("CATALOG_PRODUCT_BUCKET", "products")),
            public_base_url: args.public_base_url.unwrap_or_else(|| {
                env_or("CATALOG_PUBLIC_BASE_URL", &format!("http://localhost:{}", port))
            }),
            presign_secret: env_or("CATALOG_PRESIGN_SECRET", "change-me"),
            presign_expiry: Duration::from_secs(env_parse(
                "CATALOG_PRESIGN_EXPIRY_SECS",
                24 * 60 * 60u64,
            )?),
            index_backend,
            elasticsearch_url: args
                .elasticsearch_url
                .unwrap_or_else(|| env_or("CATALOG_ELASTICSEARCH_URL", "http://localhost:9200")),
            elasticsearch_index: args
                .elasticsearch_index
                .unwrap_or_else(|| env_or("CATALOG_ELASTICSEARCH_INDEX", "products")),
            admin_role: env_or("CATALOG_ADMIN_ROLE", "admin"),
            request_timeout: Duration::from_secs(request_timeout),
            reconcile_interval: (reconcile_secs > 0).then(|| Duration::from_secs(reconcile_secs)),
            reconcile_batch_size: env_parse("CATALOG_RECONCILE_BATCH_SIZE", 200i64)?,
        };

        Ok((cfg, migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.into())
}

/// Parse an optional environment variable, failing on malformed values.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
