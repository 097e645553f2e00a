//! Anomaly likelihood scoring: sample cache, distribution estimator and the
//! batch helper that schedules statistics refreshes.

pub mod cache;
pub mod estimator;
pub mod helper;

pub use cache::SampleCache;
pub use estimator::{GaussianTailEstimator, LikelihoodEstimator};
pub use helper::{AnomalyLikelihoodHelper, BootstrapState, RefreshOutcome};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LikelihoodError {
    #[error("metric {metric_id} is not active (status: {status})")]
    MetricNotActive { metric_id: String, status: MetricStatus },

    #[error("distribution fit failed: {0}")]
    Estimator(#[from] EstimatorError),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum EstimatorError {
    #[error("no samples with a raw anomaly score to fit")]
    EmptySamples,
}

/// Lifecycle status of a monitored metric. Set by the host, read here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricStatus {
    Unmonitored,
    Active,
    CreatePending,
    Error,
    PendingData,
}

impl std::fmt::Display for MetricStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricStatus::Unmonitored => write!(f, "unmonitored"),
            MetricStatus::Active => write!(f, "active"),
            MetricStatus::CreatePending => write!(f, "create_pending"),
            MetricStatus::Error => write!(f, "error"),
            MetricStatus::PendingData => write!(f, "pending_data"),
        }
    }
}

impl std::str::FromStr for MetricStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unmonitored" => Ok(MetricStatus::Unmonitored),
            "active" => Ok(MetricStatus::Active),
            "create_pending" => Ok(MetricStatus::CreatePending),
            "error" => Ok(MetricStatus::Error),
            "pending_data" => Ok(MetricStatus::PendingData),
            other => anyhow::bail!("unknown metric status '{}'", other),
        }
    }
}

/// One value of a metric stream together with its scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub row_id: u64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub raw_anomaly_score: Option<f64>,
    pub anomaly_score: Option<f64>,
}

impl MetricSample {
    pub fn new(row_id: u64, timestamp: DateTime<Utc>, value: f64, raw_anomaly_score: f64) -> Self {
        Self {
            row_id,
            timestamp,
            value,
            raw_anomaly_score: Some(raw_anomaly_score),
            anomaly_score: None,
        }
    }
}

/// Fitted distribution of raw anomaly scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Distribution {
    pub mean: f64,
    pub variance: f64,
    pub stdev: f64,
}

/// Parameters produced by a [`LikelihoodEstimator`] fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyParams {
    pub distribution: Distribution,
    /// Likelihoods of the most recent fitted samples, kept for diagnostics.
    #[serde(default)]
    pub historical_likelihoods: Vec<f64>,
}

/// Likelihood params as stored alongside a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyLikelihoodParams {
    /// Row id of the newest sample the params were fitted on.
    pub last_row_id_for_stats: u64,
    pub params: AnomalyParams,
}

/// Serialized model parameters of a metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricModelParams {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub min_resolution: Option<f64>,
    #[serde(default)]
    pub anomaly_likelihood_params: Option<AnomalyLikelihoodParams>,
    #[serde(default)]
    pub model_config: Option<serde_json::Value>,
    #[serde(default)]
    pub inference_args: Option<serde_json::Value>,
    #[serde(default)]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: String,
    pub name: String,
    pub status: MetricStatus,
    pub model_params: MetricModelParams,
}

impl Metric {
    pub fn ensure_active(&self) -> Result<(), LikelihoodError> {
        if self.status != MetricStatus::Active {
            return Err(LikelihoodError::MetricNotActive {
                metric_id: self.id.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

/// Authoritative history of already processed samples for a metric.
pub trait SampleHistory {
    /// Number of rows of `metric_id` that already carry a raw anomaly score.
    fn count_processed(&self, metric_id: &str) -> anyhow::Result<u64>;

    /// Up to `limit` most recent samples with a raw anomaly score, ascending.
    fn fetch_tail(&self, metric_id: &str, limit: usize) -> anyhow::Result<Vec<MetricSample>>;
}

/// Tunables of the likelihood helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LikelihoodSettings {
    pub min_sample_size: usize,
    pub max_sample_size: usize,
    pub min_refresh_interval: u64,
    /// Leading records ignored by the fit while the upstream model converges.
    pub skip_records: usize,
    pub forced_refresh_score_threshold: f64,
    /// Row ids that must elapse past the last refresh before a severe score
    /// forces another one.
    pub forced_refresh_grace_rows: u64,
    pub refresh_batch_fraction: f64,
}

impl Default for LikelihoodSettings {
    fn default() -> Self {
        Self {
            min_sample_size: 200,
            max_sample_size: 1000,
            min_refresh_interval: 10,
            skip_records: 288,
            forced_refresh_score_threshold: 0.99,
            forced_refresh_grace_rows: 1,
            refresh_batch_fraction: 0.1,
        }
    }
}
