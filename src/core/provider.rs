use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Compute provider. On-prem sites participate in placement like any
/// cloud, they just carry amortized prices and no spot tier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
    Onprem,
}

/// Execution substrate that realizes a cluster.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Vm,
    K8s,
    Slurm,
    Ray,
}

/// Network interconnect tier. Multi-node synchronous training requires
/// `High` (low-latency fabric); `Standard` is a general-purpose NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InterconnectTier {
    Standard,
    High,
}

/// A priced placement candidate, keyed by (provider, region, instance_type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuInstance {
    pub provider: Provider,
    pub region: String,
    pub instance_type: String,
    pub gpu_type: String,
    pub gpus_per_instance: u32,
    pub memory_per_gpu_gb: u32,
    pub interconnect: InterconnectTier,
    pub on_demand_price: f64,
    pub spot_price: Option<f64>,
    pub spot_availability: Option<f64>,
    pub interruption_rate: Option<f64>,
    pub last_updated: DateTime<Utc>,
}

impl GpuInstance {
    /// Effective hourly price: the spot quote when the job allows spot and
    /// a positive one exists, on-demand otherwise. The bool reports which
    /// tier was chosen.
    pub fn effective_price(&self, allow_spot: bool) -> (f64, bool) {
        match self.spot_price {
            Some(spot) if allow_spot && spot > 0.0 => (spot, true),
            _ => (self.on_demand_price, false),
        }
    }

    /// Price per single GPU, used for greedy ordering.
    pub fn price_per_gpu(&self, allow_spot: bool) -> f64 {
        let (price, _) = self.effective_price(allow_spot);
        price / self.gpus_per_instance.max(1) as f64
    }

    /// Lexicographic identity used for deterministic tie-breaking.
    pub fn sort_key(&self) -> (String, String, String) {
        (
            self.provider.to_string(),
            self.region.clone(),
            self.instance_type.clone(),
        )
    }
}

/// One line of a scheduling plan: a homogeneous group of instances.
/// Immutable once written; `price_per_hour` is captured at decision time
/// and never re-resolved, so reprocessed jobs reproduce their original
/// decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub provider: Provider,
    pub region: String,
    pub backend: Backend,
    pub instance_type: String,
    pub count: u32,
    pub spot: bool,
    pub price_per_hour: f64,
    pub estimated_hours: f64,
    pub estimated_cost: f64,
}

impl Allocation {
    pub fn sort_key(&self) -> (String, String, String) {
        (
            self.provider.to_string(),
            self.region.clone(),
            self.instance_type.clone(),
        )
    }
}

/// A member of a cluster. Identity is stable for the cluster's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub instance_id: String,
    pub provider: Provider,
    pub region: String,
    pub vpc: String,
    pub private_ip: String,
    pub gpus: u32,
    pub gpu_type: String,
    pub gpu_memory_gb: u32,
}

/// A logical network domain: nodes sharing provider+region+vpc, able to
/// run synchronous collectives against each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub provider: Provider,
    pub region: String,
    pub vpc: String,
    pub backend: Backend,
    pub nodes: Vec<Node>,
}

impl Cluster {
    pub fn total_gpus(&self) -> u32 {
        self.nodes.iter().map(|n| n.gpus).sum()
    }
}

/// Hard limit on nodes that can share one low-latency network domain.
/// Provider-parametrized data, not code.
pub fn max_cluster_nodes(provider: Provider) -> u32 {
    match provider {
        Provider::Aws => 16,
        Provider::Gcp => 32,
        Provider::Azure => 16,
        Provider::Onprem => 100,
    }
}

/// Egress pricing in USD/GB. Providers without a published rate fall
/// back to a conservative constant, surfaced in configuration.
#[derive(Debug, Clone)]
pub struct EgressTable {
    pub fallback_per_gb: f64,
}

impl Default for EgressTable {
    fn default() -> Self {
        Self {
            fallback_per_gb: 0.10,
        }
    }
}

impl EgressTable {
    pub fn rate_per_gb(&self, provider: Provider) -> f64 {
        match provider {
            Provider::Aws => 0.09,
            Provider::Gcp => 0.12,
            Provider::Azure => 0.087,
            Provider::Onprem => self.fallback_per_gb,
        }
    }
}

/// Where a dataset lives, derived from its URI scheme.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetLocation {
    pub provider: Provider,
    pub region: Option<String>,
}

impl DatasetLocation {
    /// Parse a dataset URI scheme into the provider's home location.
    /// Unknown schemes yield `None`; callers treat that as "no locality
    /// signal" rather than an error.
    pub fn parse(uri: &str) -> Option<Self> {
        let (scheme, _) = uri.split_once("://")?;
        match scheme {
            "s3" => Some(Self {
                provider: Provider::Aws,
                region: Some("us-east-1".to_string()),
            }),
            "gs" => Some(Self {
                provider: Provider::Gcp,
                region: Some("us-central1".to_string()),
            }),
            "az" => Some(Self {
                provider: Provider::Azure,
                region: Some("eastus".to_string()),
            }),
            "minio" => Some(Self {
                provider: Provider::Onprem,
                region: None,
            }),
            _ => None,
        }
    }
}

/// Test fixture shared across modules.
#[cfg(test)]
pub(crate) fn test_instance(
    provider: Provider,
    region: &str,
    instance_type: &str,
) -> GpuInstance {
    GpuInstance {
        provider,
        region: region.to_string(),
        instance_type: instance_type.to_string(),
        gpu_type: "A100".to_string(),
        gpus_per_instance: 8,
        memory_per_gpu_gb: 40,
        interconnect: InterconnectTier::High,
        on_demand_price: 32.77,
        spot_price: Some(9.83),
        spot_availability: Some(0.7),
        interruption_rate: None,
        last_updated: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(provider: Provider, region: &str, instance_type: &str) -> GpuInstance {
        test_instance(provider, region, instance_type)
    }

    #[test]
    fn test_provider_round_trip() {
        assert_eq!(Provider::Onprem.to_string(), "onprem");
        assert_eq!("gcp".parse::<Provider>().unwrap(), Provider::Gcp);
    }

    #[test]
    fn test_effective_price_prefers_spot_when_allowed() {
        let inst = instance(Provider::Aws, "us-east-1", "p4d.24xlarge");
        assert_eq!(inst.effective_price(true), (9.83, true));
        assert_eq!(inst.effective_price(false), (32.77, false));
        assert!((inst.price_per_gpu(true) - 9.83 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_dataset_location_schemes() {
        let loc = DatasetLocation::parse("gs://bucket/path").unwrap();
        assert_eq!(loc.provider, Provider::Gcp);
        assert_eq!(loc.region.as_deref(), Some("us-central1"));

        let loc = DatasetLocation::parse("minio://endpoint/bucket").unwrap();
        assert_eq!(loc.provider, Provider::Onprem);
        assert_eq!(loc.region, None);

        assert!(DatasetLocation::parse("ftp://nope").is_none());
        assert!(DatasetLocation::parse("not-a-uri").is_none());
    }

    #[test]
    fn test_max_cluster_nodes_table() {
        assert_eq!(max_cluster_nodes(Provider::Aws), 16);
        assert_eq!(max_cluster_nodes(Provider::Onprem), 100);
    }

    #[test]
    fn test_egress_rates() {
        let table = EgressTable::default();
        assert!((table.rate_per_gb(Provider::Aws) - 0.09).abs() < 1e-9);
        assert!((table.rate_per_gb(Provider::Onprem) - 0.10).abs() < 1e-9);
    }
}
