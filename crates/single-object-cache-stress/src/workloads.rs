use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use single_object_cache::{CacheError, CancellationCheck, ComputationDriver};
use tokio::time::Instant;

/// How often a cooperative computation checks whether it was superseded.
const CHECK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        let config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (i, workload) in self.workloads.iter().enumerate() {
            anyhow::ensure!(workload.concurrency > 0, "workload {i} has no concurrency");
            anyhow::ensure!(!workload.inputs.is_empty(), "workload {i} has no inputs");
            anyhow::ensure!(
                (0.0..=1.0).contains(&workload.late_cancel_ratio),
                "workload {i} has a late_cancel_ratio outside of [0, 1]"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Maximum number of requests in flight at the same time.
    pub concurrency: usize,
    /// Share of requests that lose interest right after being registered.
    #[serde(default)]
    pub late_cancel_ratio: f64,
    /// Whether computations give up once superseded.
    #[serde(default = "default_cooperative")]
    pub cooperative: bool,
    /// The inputs requests are picked from at random.
    pub inputs: Vec<InputSpec>,
}

fn default_cooperative() -> bool {
    true
}

/// An input whose "computation" takes `delay` and yields the length of `name`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InputSpec {
    pub name: String,
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    /// Computations for this input always fail.
    #[serde(default)]
    pub fail: bool,
}

/// Simulates an expensive computation according to an [`InputSpec`].
#[derive(Debug)]
pub struct StressDriver {
    cooperative: bool,
}

impl StressDriver {
    pub fn new(cooperative: bool) -> Self {
        Self { cooperative }
    }
}

impl ComputationDriver for StressDriver {
    type Input = Arc<InputSpec>;
    type Key = String;
    type Value = usize;

    const NAME: &'static str = "stress";

    fn key_of(&self, input: &Self::Input) -> Self::Key {
        input.name.clone()
    }

    fn compute(
        &self,
        input: Self::Input,
        check: CancellationCheck,
    ) -> BoxFuture<'static, Result<Self::Value, CacheError>> {
        let cooperative = self.cooperative;

        Box::pin(async move {
            let deadline = Instant::now() + input.delay;
            loop {
                if cooperative {
                    check.ensure_not_cancelled()?;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(remaining.min(CHECK_INTERVAL)).await;
            }

            if input.fail {
                tracing::debug!(input = %input.name, "Simulating a failed computation");
                return Err(CacheError::failed(anyhow::anyhow!(
                    "computation for {} failed",
                    input.name
                )));
            }
            Ok(input.name.len())
        })
    }
}
