use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

use crate::{
    daemons::{auditor::DEFAULT_STALENESS, cleaner::DEFAULT_MIN_AGE},
    providers::KNOWN_PROVIDERS,
    services::restore::DEFAULT_RESTORE_TIMEOUT,
};

/// Centralized application configuration.
/// CLI flags win over `BAGKEEPER_*` environment variables, which win over defaults.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Uploads are staged here before they become bags.
    pub storage_dir: String,
    /// Local bag copies (seeded uploads and restores).
    pub downloads_dir: String,
    /// Custodian-side store of the loopback network.
    pub network_dir: String,
    pub database_url: String,
    pub default_replicas: i64,
    pub replicator_workers: usize,
    pub auditor_workers: usize,
    pub pinger_workers: usize,
    pub cleaner_workers: usize,
    pub providers: Vec<String>,
    pub provider_reuse: bool,
    pub restore_timeout: Duration,
    pub cleaner_min_age: Duration,
    pub audit_staleness: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Replication keeper for custodian-stored bags")]
pub struct Args {
    /// Host to bind to (overrides BAGKEEPER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides BAGKEEPER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Upload staging directory (overrides BAGKEEPER_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Local bag copies (overrides BAGKEEPER_DOWNLOADS_DIR)
    #[arg(long)]
    pub downloads_dir: Option<String>,

    /// Loopback custodian store (overrides BAGKEEPER_NETWORK_DIR)
    #[arg(long)]
    pub network_dir: Option<String>,

    /// Database URL (overrides BAGKEEPER_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Replica target when an upload does not set one
    #[arg(long)]
    pub default_replicas: Option<i64>,

    #[arg(long)]
    pub replicator_workers: Option<usize>,

    #[arg(long)]
    pub auditor_workers: Option<usize>,

    #[arg(long)]
    pub pinger_workers: Option<usize>,

    #[arg(long)]
    pub cleaner_workers: Option<usize>,

    /// Comma-separated custodian addresses (overrides BAGKEEPER_PROVIDERS)
    #[arg(long)]
    pub providers: Option<String>,

    /// Allow rehiring a known custodian once every candidate is excluded
    #[arg(long)]
    pub provider_reuse: Option<bool>,

    #[arg(long)]
    pub restore_timeout_secs: Option<u64>,

    #[arg(long)]
    pub cleaner_min_age_secs: Option<u64>,

    #[arg(long)]
    pub audit_staleness_secs: Option<u64>,

    /// Apply the schema and exit
    #[arg(long)]
    pub migrate: bool,
}

/// CLI value, else parsed env value, else default. Unparseable env values are errors.
fn pick<T>(cli: Option<T>, env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {key} value `{raw}`")),
        None => Ok(default),
    }
}

fn parse_providers(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge `args` over values looked up through `env`.
    pub fn resolve(args: Args, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let text = |cli: Option<String>, key: &str, default: &str| {
            cli.or_else(|| env(key)).unwrap_or_else(|| default.to_string())
        };

        let providers = match args.providers.or_else(|| env("BAGKEEPER_PROVIDERS")) {
            Some(raw) => parse_providers(&raw),
            None => Vec::new(),
        };
        let providers = if providers.is_empty() {
            KNOWN_PROVIDERS.iter().map(|s| s.to_string()).collect()
        } else {
            providers
        };

        let default_replicas = pick(args.default_replicas, &env, "BAGKEEPER_DEFAULT_REPLICAS", 3)?;
        if default_replicas < 1 {
            anyhow::bail!("BAGKEEPER_DEFAULT_REPLICAS must be at least 1, got {default_replicas}");
        }

        Ok(Self {
            host: text(args.host, "BAGKEEPER_HOST", "0.0.0.0"),
            port: pick(args.port, &env, "BAGKEEPER_PORT", 3000)?,
            storage_dir: text(args.storage_dir, "BAGKEEPER_STORAGE_DIR", "./data/staging"),
            downloads_dir: text(args.downloads_dir, "BAGKEEPER_DOWNLOADS_DIR", "./data/downloads"),
            network_dir: text(args.network_dir, "BAGKEEPER_NETWORK_DIR", "./data/network"),
            database_url: text(
                args.database_url,
                "BAGKEEPER_DATABASE_URL",
                "sqlite://./data/meta/bagkeeper.db",
            ),
            default_replicas,
            replicator_workers: pick(args.replicator_workers, &env, "BAGKEEPER_REPLICATOR_WORKERS", 5)?.max(1),
            auditor_workers: pick(args.auditor_workers, &env, "BAGKEEPER_AUDITOR_WORKERS", 3)?.max(1),
            pinger_workers: pick(args.pinger_workers, &env, "BAGKEEPER_PINGER_WORKERS", 2)?.max(1),
            cleaner_workers: pick(args.cleaner_workers, &env, "BAGKEEPER_CLEANER_WORKERS", 2)?.max(1),
            providers,
            provider_reuse: pick(args.provider_reuse, &env, "BAGKEEPER_PROVIDER_REUSE", false)?,
            restore_timeout: Duration::from_secs(pick(
                args.restore_timeout_secs,
                &env,
                "BAGKEEPER_RESTORE_TIMEOUT_SECS",
                DEFAULT_RESTORE_TIMEOUT.as_secs(),
            )?),
            cleaner_min_age: Duration::from_secs(pick(
                args.cleaner_min_age_secs,
                &env,
                "BAGKEEPER_CLEANER_MIN_AGE_SECS",
                DEFAULT_MIN_AGE.as_secs(),
            )?),
            audit_staleness: Duration::from_secs(pick(
                args.audit_staleness_secs,
                &env,
                "BAGKEEPER_AUDIT_STALENESS_SECS",
                DEFAULT_STALENESS.as_secs(),
            )?),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let cfg = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.default_replicas, 3);
        assert_eq!(
            (cfg.replicator_workers, cfg.auditor_workers, cfg.pinger_workers, cfg.cleaner_workers),
            (5, 3, 2, 2)
        );
        assert_eq!(cfg.providers.len(), KNOWN_PROVIDERS.len());
        assert!(!cfg.provider_reuse);
        assert_eq!(cfg.restore_timeout, Duration::from_secs(60));
        assert_eq!(cfg.cleaner_min_age, Duration::from_secs(120));
        assert_eq!(cfg.audit_staleness, Duration::from_secs(600));
    }

    #[test]
    fn flags_win_over_env() {
        let args = Args {
            port: Some(9000),
            ..Args::default()
        };
        let env = env_of(&[("BAGKEEPER_PORT", "8000"), ("BAGKEEPER_HOST", "127.0.0.1")]);
        let cfg = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:9000");
    }

    #[test]
    fn invalid_env_number_is_an_error() {
        let err = AppConfig::resolve(Args::default(), env_of(&[("BAGKEEPER_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("BAGKEEPER_PORT"));
    }

    #[test]
    fn worker_counts_are_clamped_and_providers_split() {
        let env = env_of(&[
            ("BAGKEEPER_AUDITOR_WORKERS", "0"),
            ("BAGKEEPER_PROVIDERS", " a , b,,c "),
        ]);
        let cfg = AppConfig::resolve(Args::default(), env).unwrap();
        assert_eq!(cfg.auditor_workers, 1);
        assert_eq!(cfg.providers, vec!["a", "b", "c"]);
    }
}
