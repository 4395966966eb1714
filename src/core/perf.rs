use std::collections::HashMap;

use crate::core::job::Framework;

/// Throughput baseline for a (framework, GPU, model-class) combination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceMetrics {
    pub steps_per_hour: f64,
    pub tokens_per_hour: f64,
    pub storage_throughput_mbs: f64,
    pub network_bandwidth_gbps: f64,
}

/// Static benchmark table. Keys are "framework:gpu_type:model_class".
/// Historical telemetry would replace these numbers; the lookup contract
/// stays the same.
pub struct PerformanceStore {
    benchmarks: HashMap<String, PerformanceMetrics>,
}

impl PerformanceStore {
    pub fn new() -> Self {
        let mut benchmarks = HashMap::new();
        benchmarks.insert(
            "pytorch_ddp:A100:resnet50".to_string(),
            PerformanceMetrics {
                steps_per_hour: 1200.0,
                tokens_per_hour: 0.0,
                storage_throughput_mbs: 500.0,
                network_bandwidth_gbps: 100.0,
            },
        );
        benchmarks.insert(
            "pytorch_ddp:A100:bert".to_string(),
            PerformanceMetrics {
                steps_per_hour: 800.0,
                tokens_per_hour: 0.0,
                storage_throughput_mbs: 400.0,
                network_bandwidth_gbps: 100.0,
            },
        );
        benchmarks.insert(
            "pytorch_ddp:A100:llama".to_string(),
            PerformanceMetrics {
                steps_per_hour: 200.0,
                tokens_per_hour: 50_000.0,
                storage_throughput_mbs: 300.0,
                network_bandwidth_gbps: 100.0,
            },
        );
        benchmarks.insert(
            "pytorch_ddp:V100:resnet50".to_string(),
            PerformanceMetrics {
                steps_per_hour: 600.0,
                tokens_per_hour: 0.0,
                storage_throughput_mbs: 300.0,
                network_bandwidth_gbps: 25.0,
            },
        );
        benchmarks.insert(
            "horovod:A100:resnet50".to_string(),
            PerformanceMetrics {
                steps_per_hour: 1100.0,
                tokens_per_hour: 0.0,
                storage_throughput_mbs: 450.0,
                network_bandwidth_gbps: 100.0,
            },
        );
        Self { benchmarks }
    }

    /// Benchmark lookup with a conservative default for unknown
    /// combinations.
    pub fn metrics(
        &self,
        framework: Framework,
        gpu_type: &str,
        model_class: &str,
    ) -> PerformanceMetrics {
        let key = format!("{framework}:{gpu_type}:{model_class}");
        self.benchmarks.get(&key).cloned().unwrap_or(PerformanceMetrics {
            steps_per_hour: 500.0,
            tokens_per_hour: 0.0,
            storage_throughput_mbs: 200.0,
            network_bandwidth_gbps: 10.0,
        })
    }
}

impl Default for PerformanceStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_benchmark() {
        let store = PerformanceStore::new();
        let metrics = store.metrics(Framework::PyTorchDdp, "A100", "resnet50");
        assert_eq!(metrics.steps_per_hour, 1200.0);
    }

    #[test]
    fn test_unknown_combination_gets_conservative_default() {
        let store = PerformanceStore::new();
        let metrics = store.metrics(Framework::TfMultiWorker, "H100", "mixtral");
        assert_eq!(metrics.steps_per_hour, 500.0);
        assert_eq!(metrics.network_bandwidth_gbps, 10.0);
    }
}
