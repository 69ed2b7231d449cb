use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::{models::file::BackendKind, services::object_store_client::S3Settings};

const ENV_PREFIX: &str = "UPLOAD_STORE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub store_method: BackendKind,
    /// Present exactly when `store_method` is remote.
    pub s3: Option<S3Config>,
    pub io_timeout: Duration,
    pub max_chunk_bytes: u64,
    pub max_chunk_count: u32,
}

#[derive(Clone)]
pub struct S3Config {
    pub settings: S3Settings,
    pub prefix: String,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.settings.endpoint)
            .field("bucket", &self.settings.bucket)
            .field("region", &self.settings.region)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable chunked upload service with content deduplication")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for staged chunks and local objects (overrides UPLOAD_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// `local` or `remote` (overrides UPLOAD_STORE_STORE_METHOD)
    #[arg(long)]
    pub store_method: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |name| env::var(format!("{ENV_PREFIX}{name}")).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over variables looked up through `var` (unprefixed names).
    fn resolve(args: Args, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let store_method = match args.store_method.or_else(|| var("STORE_METHOD")) {
            Some(raw) => BackendKind::from_str(&raw)
                .with_context(|| format!("parsing {ENV_PREFIX}STORE_METHOD value `{raw}`"))?,
            None => BackendKind::Local,
        };

        let s3 = match store_method {
            BackendKind::Local => None,
            BackendKind::Remote => Some(s3_config(&var)?),
        };

        let max_chunk_bytes: u64 = parsed(&var, "MAX_CHUNK_BYTES", 64 * 1024 * 1024)?;
        let max_chunk_count: u32 = parsed(&var, "MAX_CHUNK_COUNT", 1000)?;
        if max_chunk_bytes == 0 || max_chunk_count == 0 {
            bail!("{ENV_PREFIX}MAX_CHUNK_BYTES and {ENV_PREFIX}MAX_CHUNK_COUNT must be positive");
        }

        Ok(Self {
            host: args
                .host
                .or_else(|| var("HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: match args.port {
                Some(port) => port,
                None => parsed(&var, "PORT", 3000)?,
            },
            storage_dir: args
                .storage_dir
                .or_else(|| var("STORAGE_DIR"))
                .unwrap_or_else(|| "./data/uploads".into()),
            database_url: args
                .database_url
                .or_else(|| var("DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/upload_store.db".into()),
            store_method,
            s3,
            io_timeout: Duration::from_secs(parsed(&var, "IO_TIMEOUT_SECS", 30)?),
            max_chunk_bytes,
            max_chunk_count,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn s3_config(var: &impl Fn(&str) -> Option<String>) -> Result<S3Config> {
    let required = |name: &str| {
        var(name)
            .filter(|v| !v.trim().is_empty())
            .with_context(|| format!("{ENV_PREFIX}{name} is required when the store method is remote"))
    };
    Ok(S3Config {
        settings: S3Settings {
            endpoint: required("S3_ENDPOINT")?,
            bucket: required("S3_BUCKET")?,
            region: var("S3_REGION").unwrap_or_else(|| "us-east-1".into()),
            access_key: required("S3_ACCESS_KEY")?,
            secret_key: required("S3_SECRET_KEY")?,
        },
        prefix: var("S3_PREFIX").unwrap_or_else(|| "uploads".into()),
    })
}

fn parsed<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{value}`")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(args: Args, vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::resolve(args, |name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_local_store() {
        let cfg = resolve(Args::default(), &[]).unwrap();
        assert_eq!(cfg.store_method, BackendKind::Local);
        assert!(cfg.s3.is_none());
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.io_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_chunk_count, 1000);
    }

    #[test]
    fn args_override_environment() {
        let args = Args {
            port: Some(8080),
            ..Args::default()
        };
        let cfg = resolve(args, &[("PORT", "9000"), ("HOST", "127.0.0.1")]).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn remote_requires_credentials() {
        let err = resolve(
            Args::default(),
            &[("STORE_METHOD", "remote"), ("S3_ENDPOINT", "http://localhost:9000")],
        )
        .unwrap_err();
        assert!(err.to_string().contains("S3_BUCKET"));

        let cfg = resolve(
            Args::default(),
            &[
                ("STORE_METHOD", "s3"),
                ("S3_ENDPOINT", "http://localhost:9000"),
                ("S3_BUCKET", "uploads"),
                ("S3_ACCESS_KEY", "key"),
                ("S3_SECRET_KEY", "secret"),
            ],
        )
        .unwrap();
        assert_eq!(cfg.store_method, BackendKind::Remote);
        let s3 = cfg.s3.unwrap();
        assert_eq!(s3.settings.region, "us-east-1");
        assert!(!format!("{s3:?}").contains("secret"));
    }

    #[test]
    fn rejects_bad_numbers() {
        assert!(resolve(Args::default(), &[("PORT", "http")]).is_err());
        assert!(resolve(Args::default(), &[("MAX_CHUNK_COUNT", "0")]).is_err());
        assert!(resolve(Args::default(), &[("STORE_METHOD", "ftp")]).is_err());
    }
}
