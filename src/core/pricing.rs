use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

use crate::core::db::Database;
use crate::core::provider::{GpuInstance, Provider};
use crate::error::Result;

/// Per-provider pricing surface. Real implementations call the cloud
/// billing/spot APIs; on-prem fleets are served by [`StaticAdapter`].
/// Preemptible tiers are reported through `fetch_spot` with a higher
/// availability.
pub trait ProviderAdapter: Send + Sync {
    fn provider(&self) -> Provider;
    fn regions(&self) -> Vec<String>;
    fn fetch_on_demand(&self) -> Result<Vec<GpuInstance>>;
    fn fetch_spot(&self) -> Result<Vec<GpuInstance>>;
}

/// Adapter over a fixed catalog. On-prem sites publish amortized prices
/// this way; tests use it to seed deterministic candidate sets.
pub struct StaticAdapter {
    provider: Provider,
    instances: Vec<GpuInstance>,
}

impl StaticAdapter {
    pub fn new(provider: Provider, instances: Vec<GpuInstance>) -> Self {
        Self {
            provider,
            instances,
        }
    }
}

impl ProviderAdapter for StaticAdapter {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn regions(&self) -> Vec<String> {
        let mut regions: Vec<String> = self.instances.iter().map(|i| i.region.clone()).collect();
        regions.sort();
        regions.dedup();
        regions
    }

    fn fetch_on_demand(&self) -> Result<Vec<GpuInstance>> {
        Ok(self.instances.clone())
    }

    fn fetch_spot(&self) -> Result<Vec<GpuInstance>> {
        Ok(self
            .instances
            .iter()
            .filter(|i| i.spot_price.is_some())
            .cloned()
            .collect())
    }
}

/// Key of a pricing row queued for background refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingKey {
    pub provider: Provider,
    pub region: String,
    pub instance_type: String,
}

/// Read surface over the gpu_pricing table. Stale reads are served as-is
/// but schedule a non-blocking refresh of the key.
#[derive(Clone)]
pub struct PricingCache {
    db: Database,
    freshness: Duration,
    refresh_tx: mpsc::UnboundedSender<PricingKey>,
}

impl PricingCache {
    /// Returns the cache plus the receiving end the refresher drains.
    pub fn new(db: Database, freshness: Duration) -> (Self, mpsc::UnboundedReceiver<PricingKey>) {
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        (
            Self {
                db,
                freshness,
                refresh_tx,
            },
            refresh_rx,
        )
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness
    }

    /// Price for one key. Rows older than the freshness window are still
    /// returned, but a background refresh is enqueued for them.
    pub fn price(
        &self,
        provider: Provider,
        region: &str,
        instance_type: &str,
        spot: bool,
    ) -> Result<Option<(f64, DateTime<Utc>)>> {
        let Some((price, last_updated)) =
            self.db.lookup_price(provider, region, instance_type, spot)?
        else {
            return Ok(None);
        };
        let age = Utc::now().signed_duration_since(last_updated);
        if age.num_seconds() > self.freshness.as_secs() as i64 {
            tracing::debug!(
                %provider, region, instance_type,
                age_secs = age.num_seconds(),
                "stale pricing row, scheduling refresh"
            );
            // Receiver gone means the refresher stopped; stale data is
            // still an answer.
            let _ = self.refresh_tx.send(PricingKey {
                provider,
                region: region.to_string(),
                instance_type: instance_type.to_string(),
            });
        }
        Ok(Some((price, last_updated)))
    }

    /// Candidate enumeration for the optimizer: rows inside the
    /// freshness window only.
    pub fn fresh_instances(&self) -> Result<Vec<GpuInstance>> {
        self.db.fresh_instances(self.freshness.as_secs() as i64)
    }
}

/// One refresh pass over every registered adapter. Adapter failures are
/// swallowed per provider so one failing cloud cannot poison the cache
/// for the others.
pub fn refresh_all(db: &Database, adapters: &[Arc<dyn ProviderAdapter>]) {
    for adapter in adapters {
        let provider = adapter.provider();
        match adapter.fetch_on_demand() {
            Ok(instances) => {
                for instance in &instances {
                    if let Err(e) = db.upsert_on_demand(instance) {
                        tracing::warn!(%provider, error = %e, "failed to upsert on-demand row");
                    }
                }
                tracing::debug!(%provider, rows = instances.len(), "refreshed on-demand pricing");
            }
            Err(e) => tracing::warn!(%provider, error = %e, "on-demand pricing fetch failed"),
        }
        match adapter.fetch_spot() {
            Ok(instances) => {
                for instance in &instances {
                    if let Err(e) = db.upsert_spot(instance) {
                        tracing::warn!(%provider, error = %e, "failed to upsert spot row");
                    }
                }
                tracing::debug!(%provider, rows = instances.len(), "refreshed spot pricing");
            }
            Err(e) => tracing::warn!(%provider, error = %e, "spot pricing fetch failed"),
        }
    }
}

/// Periodic refresher worker. Runs one pass immediately, then on every
/// interval tick, and services stale-key requests in between. Returns
/// after the current iteration when the shutdown signal flips.
pub async fn run_refresher(
    db: Database,
    adapters: Vec<Arc<dyn ProviderAdapter>>,
    interval: Duration,
    mut refresh_rx: mpsc::UnboundedReceiver<PricingKey>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh_all(&db, &adapters);
            }
            key = refresh_rx.recv() => {
                match key {
                    // Per-key refresh goes through the owning adapter only.
                    Some(key) => {
                        if let Some(adapter) =
                            adapters.iter().find(|a| a.provider() == key.provider)
                        {
                            refresh_all(&db, std::slice::from_ref(adapter));
                        }
                    }
                    None => break,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("pricing refresher stopping");
                    break;
                }
            }
        }
    }
}
