use std::path::PathBuf;

use serde::Deserialize;

/// Daemon configuration, layered: built-in defaults, then an optional
/// TOML file, then SKYFLOW__-prefixed environment variables
/// (e.g. `SKYFLOW__DAEMON__PORT=8080`).
#[derive(Deserialize, Debug, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub autoscaler: AutoscalerConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct DatabaseConfig {
    /// Defaults to <data dir>/skyflow/skyflow.db.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("skyflow")
                .join("skyflow.db")
        })
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    /// Driver tick in seconds.
    #[serde(default = "default_scheduler_tick")]
    pub tick_secs: u64,
    /// Jobs drained per pass.
    #[serde(default = "default_scheduler_batch")]
    pub batch: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PricingConfig {
    /// Refresh cadence in seconds.
    #[serde(default = "default_pricing_refresh")]
    pub refresh_secs: u64,
    /// Staleness window in seconds.
    #[serde(default = "default_pricing_freshness")]
    pub freshness_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PoolConfig {
    #[serde(default)]
    pub min_size: usize,
    #[serde(default = "default_pool_max")]
    pub max_size: usize,
    /// Idle time before a cluster may be reclaimed, in seconds.
    #[serde(default = "default_pool_idle")]
    pub idle_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct AutoscalerConfig {
    #[serde(default = "default_autoscaler_tick")]
    pub tick_secs: u64,
    /// Queue depth that triggers scale-up.
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: usize,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CostConfig {
    #[serde(default = "default_cost_tick")]
    pub tick_secs: u64,
    /// Fraction of budget that raises the warning event.
    #[serde(default = "default_budget_warn_ratio")]
    pub budget_warn_ratio: f64,
    /// Dataset size assumed when scoring egress, in GB.
    #[serde(default = "default_assumed_dataset_gb")]
    pub assumed_dataset_gb: f64,
    /// Egress fallback for providers without a published rate, USD/GB.
    #[serde(default = "default_egress_fallback")]
    pub egress_fallback_per_gb: f64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_tick")]
    pub tick_secs: u64,
    /// Provisioning older than this is reported as stuck, in seconds.
    #[serde(default = "default_provisioning_deadline")]
    pub provisioning_deadline_secs: u64,
}

/// Region lists handed to provider adapters.
#[derive(Deserialize, Debug, Clone)]
pub struct ProvidersConfig {
    #[serde(default = "default_aws_regions")]
    pub aws_regions: Vec<String>,
    #[serde(default = "default_gcp_regions")]
    pub gcp_regions: Vec<String>,
    #[serde(default = "default_azure_regions")]
    pub azure_regions: Vec<String>,
    #[serde(default)]
    pub onprem_sites: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_scheduler_tick() -> u64 {
    5
}
fn default_scheduler_batch() -> usize {
    16
}
fn default_pricing_refresh() -> u64 {
    15 * 60
}
fn default_pricing_freshness() -> u64 {
    60 * 60
}
fn default_pool_max() -> usize {
    16
}
fn default_pool_idle() -> u64 {
    30 * 60
}
fn default_autoscaler_tick() -> u64 {
    30
}
fn default_scale_up_threshold() -> usize {
    5
}
fn default_cost_tick() -> u64 {
    60
}
fn default_budget_warn_ratio() -> f64 {
    0.9
}
fn default_assumed_dataset_gb() -> f64 {
    100.0
}
fn default_egress_fallback() -> f64 {
    0.10
}
fn default_monitor_tick() -> u64 {
    30
}
fn default_provisioning_deadline() -> u64 {
    10 * 60
}
fn default_aws_regions() -> Vec<String> {
    vec!["us-east-1".into(), "us-west-2".into()]
}
fn default_gcp_regions() -> Vec<String> {
    vec!["us-central1".into()]
}
fn default_azure_regions() -> Vec<String> {
    vec!["eastus".into()]
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_scheduler_tick(),
            batch: default_scheduler_batch(),
        }
    }
}
impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_pricing_refresh(),
            freshness_secs: default_pricing_freshness(),
        }
    }
}
impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: default_pool_max(),
            idle_timeout_secs: default_pool_idle(),
        }
    }
}
impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_autoscaler_tick(),
            scale_up_threshold: default_scale_up_threshold(),
        }
    }
}
impl Default for CostConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_cost_tick(),
            budget_warn_ratio: default_budget_warn_ratio(),
            assumed_dataset_gb: default_assumed_dataset_gb(),
            egress_fallback_per_gb: default_egress_fallback(),
        }
    }
}
impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_monitor_tick(),
            provisioning_deadline_secs: default_provisioning_deadline(),
        }
    }
}
impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            aws_regions: default_aws_regions(),
            gcp_regions: default_gcp_regions(),
            azure_regions: default_azure_regions(),
            onprem_sites: vec![],
        }
    }
}

/// Load configuration from an optional file plus the environment.
pub fn load_config(config_path: Option<&PathBuf>) -> Result<Config, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.as_path()));
        } else {
            return Err(config::ConfigError::NotFound(format!(
                "config file {path:?} does not exist"
            )));
        }
    }
    builder
        .add_source(
            config::Environment::with_prefix("SKYFLOW")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.daemon.port, 8080);
        assert_eq!(config.scheduler.tick_secs, 5);
        assert_eq!(config.pricing.refresh_secs, 900);
        assert_eq!(config.pricing.freshness_secs, 3600);
        assert_eq!(config.cost.tick_secs, 60);
        assert!((config.cost.budget_warn_ratio - 0.9).abs() < 1e-9);
        assert_eq!(config.monitor.tick_secs, 30);
        assert_eq!(config.autoscaler.tick_secs, 30);
    }

    #[test]
    fn test_file_overrides() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        write!(
            file,
            "[daemon]\nport = 9999\n[pool]\nmax_size = 4\n[cost]\nassumed_dataset_gb = 250.0\n"
        )
        .unwrap();
        let config = load_config(Some(&file.path().to_path_buf())).unwrap();
        assert_eq!(config.daemon.port, 9999);
        assert_eq!(config.pool.max_size, 4);
        assert!((config.cost.assumed_dataset_gb - 250.0).abs() < 1e-9);
        // untouched sections keep their defaults
        assert_eq!(config.scheduler.batch, 16);
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let missing = PathBuf::from("/tmp/definitely-not-here.toml");
        assert!(load_config(Some(&missing)).is_err());
    }
}
