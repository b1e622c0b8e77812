use std::time::Duration;

use anyhow::{Context, Result};
use lazyloader_service::{LazyLoader, LoadOptions};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    /// Parses workload definitions from YAML and validates them.
    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        let config: Self =
            serde_yaml::from_reader(reader).context("failed to parse workloads YAML")?;
        for workload in &config.workloads {
            anyhow::ensure!(
                workload.failure_rate.is_finite(),
                "workload `{}` has a non-finite failure rate",
                workload.resource_type,
            );
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Workload {
    /// The resource type requested by this workload.
    ///
    /// Workloads sharing a type also share its backend, the last definition wins.
    pub resource_type: String,
    /// The number of requests in flight at any time.
    pub concurrency: usize,
    /// Requests pick their id from `0..ids`.
    #[serde(default = "default_ids")]
    pub ids: u64,
    #[serde(default)]
    pub priority: i64,
    /// The mean latency of the backend. Individual calls vary by up to 50%.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// The share of backend calls failing, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
}

fn default_ids() -> u64 {
    1000
}

impl Workload {
    /// A random id out of this workload's key space.
    pub fn pick_id(&self) -> String {
        rand::random_range(0..self.ids.max(1)).to_string()
    }

    pub fn options(&self) -> LoadOptions {
        LoadOptions::default()
            .with_priority(self.priority)
            .with_metadata("workload", self.resource_type.clone())
    }
}

/// A simulated backend for one resource type.
#[derive(Debug, Clone)]
struct SyntheticBackend {
    resource_type: String,
    latency: Duration,
    failure_rate: f64,
}

impl SyntheticBackend {
    fn new(workload: &Workload) -> Self {
        Self {
            resource_type: workload.resource_type.clone(),
            latency: workload.latency,
            failure_rate: workload.failure_rate.clamp(0.0, 1.0),
        }
    }

    async fn fetch(self, id: String) -> Result<String> {
        if !self.latency.is_zero() {
            let jitter = rand::random_range(0.5..1.5);
            tokio::time::sleep(self.latency.mul_f64(jitter)).await;
        }

        if rand::random_bool(self.failure_rate) {
            anyhow::bail!("backend for `{}` failed to fetch `{id}`", self.resource_type);
        }
        Ok(format!("{}:{id}", self.resource_type))
    }
}

/// Registers a synthetic backend for the resource type of every workload.
pub fn register_workloads(loader: &LazyLoader<String>, workloads: &[Workload]) {
    for workload in workloads {
        let backend = SyntheticBackend::new(workload);
        loader.register_loader(&workload.resource_type, move |id| {
            backend.clone().fetch(id)
        });
    }
}
