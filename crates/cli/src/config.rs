use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser, ValueEnum};
use serde::{Serialize, Serializer};
use tether_core::{parse_duration, FieldSelector, RemovalPolicy, ResourceKey, RetryPolicy, TetherError};
use tether_reconcile::ReconcilerConfig;
use tether_sink::WriteMode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Mirror one ConfigMap key into a local file")]
pub struct Cli {
    /// Absolute path to the kubeconfig file (default: $KUBECONFIG or ~/.kube/config, then in-cluster)
    #[arg(long, env = "TETHER_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Name of the configmap to watch
    #[arg(long = "configmap-name", env = "TETHER_CONFIGMAP_NAME", default_value = "traefik-rules")]
    pub configmap_name: String,

    /// Namespace of the configmap to watch
    #[arg(long = "configmap-namespace", env = "TETHER_CONFIGMAP_NAMESPACE", default_value = "default")]
    pub configmap_namespace: String,

    /// Key of the configmap to read
    #[arg(long = "configmap-key", env = "TETHER_CONFIGMAP_KEY", default_value = "rules.toml")]
    pub configmap_key: String,

    /// Name of the file to write
    #[arg(long = "outfile-name", env = "TETHER_OUTFILE_NAME", default_value = "/tmp/rules.toml")]
    pub outfile_name: PathBuf,

    /// Period after which a configmap resync is forced, e.g. "5m", "1h30m", "90s"
    #[arg(long = "resync-period", env = "TETHER_RESYNC_PERIOD", default_value = "5m")]
    pub resync_period: String,

    /// Deadline for the direct fetch performed on each resync
    #[arg(long = "fetch-timeout", env = "TETHER_FETCH_TIMEOUT", default_value = "10s")]
    pub fetch_timeout: String,

    /// What a configmap deletion does to the last written value
    #[arg(long = "on-removed", env = "TETHER_ON_REMOVED", value_enum, default_value_t = OnRemoved::Ignore)]
    pub on_removed: OnRemoved,

    /// Consecutive transient failures tolerated before exiting
    #[arg(long = "max-retries", env = "TETHER_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Exit on the first watch or fetch failure
    #[arg(long = "fail-fast", env = "TETHER_FAIL_FAST", action = ArgAction::SetTrue)]
    pub fail_fast: bool,

    /// Write through a temp file and rename instead of truncating in place
    #[arg(long = "atomic-write", env = "TETHER_ATOMIC_WRITE", action = ArgAction::SetTrue)]
    pub atomic_write: bool,

    /// Capacity of the queue between the watch task and the reconciler
    #[arg(long = "queue-cap", env = "TETHER_QUEUE_CAP", default_value_t = 1)]
    pub queue_cap: usize,

    /// Print the effective configuration as JSON and exit
    #[arg(long = "print-config", action = ArgAction::SetTrue)]
    pub print_config: bool,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OnRemoved {
    Ignore,
    Clear,
}

impl From<OnRemoved> for RemovalPolicy {
    fn from(v: OnRemoved) -> Self {
        match v {
            OnRemoved::Ignore => RemovalPolicy::Ignore,
            OnRemoved::Clear => RemovalPolicy::Clear,
        }
    }
}

fn secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// Effective, validated configuration. Built once at startup and passed
/// explicitly to every component.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub kubeconfig: Option<PathBuf>,
    pub key: ResourceKey,
    pub field: FieldSelector,
    pub outfile: PathBuf,
    #[serde(rename = "resync_period_secs", serialize_with = "secs")]
    pub resync_period: Duration,
    #[serde(rename = "fetch_timeout_secs", serialize_with = "secs")]
    pub fetch_timeout: Duration,
    pub removal: RemovalPolicy,
    pub retry: RetryPolicy,
    pub write_mode: WriteMode,
    pub queue_cap: usize,
}

fn positive(flag: &str, raw: &str) -> Result<Duration, TetherError> {
    let d = parse_duration(raw)
        .map_err(|e| TetherError::Configuration(format!("not able to parse {} (given value: {}): {}", flag, raw, e)))?;
    if d.is_zero() {
        return Err(TetherError::Configuration(format!("{} must be greater than zero (given value: {})", flag, raw)));
    }
    Ok(d)
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Result<Self, TetherError> {
        let key = ResourceKey::new(cli.configmap_name.clone(), cli.configmap_namespace.clone())?;
        let field = FieldSelector::new(cli.configmap_key.clone())?;
        let resync_period = positive("resync-period", &cli.resync_period)?;
        let fetch_timeout = positive("fetch-timeout", &cli.fetch_timeout)?;
        if cli.queue_cap == 0 {
            return Err(TetherError::Configuration("queue-cap must be at least 1".into()));
        }
        if cli.outfile_name.as_os_str().is_empty() {
            return Err(TetherError::Configuration("outfile-name must not be empty".into()));
        }
        let retry = if cli.fail_fast { RetryPolicy::fail_fast() } else { RetryPolicy::default().with_max_retries(cli.max_retries) };
        Ok(Self {
            kubeconfig: cli.kubeconfig.clone(),
            key,
            field,
            outfile: cli.outfile_name.clone(),
            resync_period,
            fetch_timeout,
            removal: cli.on_removed.into(),
            retry,
            write_mode: if cli.atomic_write { WriteMode::Atomic } else { WriteMode::Truncate },
            queue_cap: cli.queue_cap,
        })
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig::new(self.key.clone(), self.field.clone())
            .with_fetch_timeout(self.fetch_timeout)
            .with_removal(self.removal)
            .with_retry(self.retry.clone())
    }

    pub fn log(&self) {
        info!(kubeconfig = ?self.kubeconfig, "config");
        info!(configmap_name = %self.key.name, configmap_namespace = %self.key.namespace, configmap_key = %self.field, "config");
        info!(outfile_name = %self.outfile.display(), write_mode = ?self.write_mode, "config");
        info!(resync_period = ?self.resync_period, fetch_timeout = ?self.fetch_timeout, "config");
        info!(on_removed = ?self.removal, max_retries = self.retry.max_retries, queue_cap = self.queue_cap, "config");
        info!("run with --help to list all cli flags");
    }
}
