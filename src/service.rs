//! Batch driver: metric records in, persisted anomaly scores out.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::likelihood::{
    AnomalyLikelihoodHelper, AnomalyLikelihoodParams, GaussianTailEstimator, LikelihoodSettings, Metric,
    MetricModelParams, MetricSample, MetricStatus,
};
use crate::model::encoder::parse_timestamp;
use crate::model::swapper::CommandOutcome;
use crate::model::{
    CheckpointStore, FieldMeta, FieldSpecial, FieldType, InferenceArgs, InputFieldSchema, InputRow, ModelCommand,
    ModelDefinition, ModelFactory, ModelParams, ModelSwapperInterface,
};
use crate::storage::MetricRepository;

pub const TIMESTAMP_FIELD: &str = "c0";
pub const VALUE_FIELD: &str = "c1";

/// One observed value of a metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub row_id: u64,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl MetricRecord {
    fn to_input_row(&self) -> InputRow {
        InputRow {
            row_id: self.row_id,
            values: vec![self.timestamp.to_rfc3339(), self.value.to_string()],
        }
    }
}

/// Parse `row_id,timestamp,value` lines. Blank lines, `#` comments and a
/// leading header are skipped.
pub fn parse_records_csv(input: &str) -> Result<Vec<MetricRecord>> {
    let mut records = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || (idx == 0 && line.starts_with("row_id")) {
            continue;
        }

        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() != 3 {
            anyhow::bail!("line {}: expected 'row_id,timestamp,value', got '{}'", idx + 1, line);
        }
        let row_id = parts[0]
            .parse()
            .with_context(|| format!("line {}: invalid row id '{}'", idx + 1, parts[0]))?;
        let timestamp = parse_timestamp(parts[1])
            .with_context(|| format!("line {}: invalid timestamp '{}'", idx + 1, parts[1]))?;
        let value = parts[2]
            .parse()
            .with_context(|| format!("line {}: invalid value '{}'", idx + 1, parts[2]))?;

        records.push(MetricRecord {
            row_id,
            timestamp,
            value,
        });
    }
    Ok(records)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub metric_id: String,
    pub received: usize,
    /// Rows dropped because they were already stored or repeated in the batch.
    pub duplicates: usize,
    pub scored: usize,
    pub unscored: usize,
    pub last_row_id_for_stats: Option<u64>,
    pub max_anomaly_score: Option<f64>,
}

/// Definition of a model over the standard `(timestamp, value)` metric row.
pub fn metric_model_definition(model_params: ModelParams, aggregation_period_secs: Option<i64>) -> ModelDefinition {
    ModelDefinition {
        model_params,
        inference_args: InferenceArgs {
            predicted_field: VALUE_FIELD.to_string(),
        },
        input_schema: InputFieldSchema {
            fields: vec![
                FieldMeta {
                    name: TIMESTAMP_FIELD.to_string(),
                    field_type: FieldType::Datetime,
                    special: FieldSpecial::Timestamp,
                },
                FieldMeta {
                    name: VALUE_FIELD.to_string(),
                    field_type: FieldType::Float,
                    special: FieldSpecial::None,
                },
            ],
            aggregation_period_secs,
        },
    }
}

/// Drives metrics through their models and the likelihood helper. Work on
/// one metric is serialized; distinct metrics run in parallel.
pub struct AnomalyService {
    repo: MetricRepository,
    helper: AnomalyLikelihoodHelper<GaussianTailEstimator, MetricRepository>,
    swapper: ModelSwapperInterface,
    metric_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AnomalyService {
    pub fn new(
        repo: MetricRepository,
        store: Arc<dyn CheckpointStore>,
        factory: Arc<dyn ModelFactory>,
        settings: LikelihoodSettings,
    ) -> Self {
        let helper = AnomalyLikelihoodHelper::new(settings, GaussianTailEstimator, repo.clone());
        Self {
            repo,
            helper,
            swapper: ModelSwapperInterface::new(store, factory),
            metric_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &MetricRepository {
        &self.repo
    }

    /// Register a metric and define its model. The metric becomes `Active`
    /// once the model definition is stored.
    pub fn create_metric(&self, uid: &str, name: &str, definition: ModelDefinition) -> Result<()> {
        let model_params = MetricModelParams {
            model_config: Some(serde_json::to_value(&definition.model_params)?),
            inference_args: Some(serde_json::to_value(&definition.inference_args)?),
            input_schema: Some(serde_json::to_value(&definition.input_schema)?),
            ..Default::default()
        };
        let lock = self.metric_lock(uid);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.repo
            .create_metric(uid, name, MetricStatus::CreatePending, &model_params)?;

        let defined = self.swapper.submit(uid, ModelCommand::DefineModel { definition });
        if let Err(e) = defined {
            self.repo.set_status(uid, MetricStatus::Error)?;
            return Err(e).with_context(|| format!("Failed to define model for metric '{}'", uid));
        }

        self.repo.set_status(uid, MetricStatus::Active)?;
        info!(metric_id = %uid, %name, "metric created");
        Ok(())
    }

    pub fn delete_metric(&self, uid: &str) -> Result<()> {
        let lock = self.metric_lock(uid);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        self.swapper.submit(uid, ModelCommand::DeleteModel)?;
        self.repo.delete_metric(uid)?;
        info!(metric_id = %uid, "metric deleted");
        Ok(())
    }

    /// Score a batch on the blocking pool.
    pub async fn process_batch(self: &Arc<Self>, metric_id: &str, records: Vec<MetricRecord>) -> Result<BatchReport> {
        let service = Arc::clone(self);
        let metric_id = metric_id.to_string();
        tokio::task::spawn_blocking(move || service.process_batch_blocking(&metric_id, records)).await?
    }

    pub fn process_batch_blocking(&self, metric_id: &str, mut records: Vec<MetricRecord>) -> Result<BatchReport> {
        let lock = self.metric_lock(metric_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let metric = self
            .repo
            .get_metric(metric_id)?
            .with_context(|| format!("Metric '{}' not found", metric_id))?;
        metric.ensure_active()?;

        let received = records.len();
        let last_stored = self.repo.last_row_id(metric_id)?;
        records.sort_by_key(|r| r.row_id);
        records.dedup_by_key(|r| r.row_id);
        records.retain(|r| last_stored.map_or(true, |last| r.row_id > last));
        let duplicates = received - records.len();

        if duplicates > 0 {
            warn!(%metric_id, duplicates, ?last_stored, "dropping already processed rows");
        }

        let mut report = BatchReport {
            metric_id: metric_id.to_string(),
            received,
            duplicates,
            scored: 0,
            unscored: 0,
            last_row_id_for_stats: metric
                .model_params
                .anomaly_likelihood_params
                .as_ref()
                .map(|p| p.last_row_id_for_stats),
            max_anomaly_score: None,
        };
        if records.is_empty() {
            return Ok(report);
        }

        let rows = records.iter().map(MetricRecord::to_input_row).collect();
        let result = self.swapper.submit(metric_id, ModelCommand::ProcessRows { rows })?;

        // Until the rows are committed the model has learned from rows the
        // store does not hold. On failure drop that state so a redelivered
        // batch is learned exactly once.
        let (samples, anomaly_params) = match self.score_and_commit(&metric, &records, result.outcome) {
            Ok(scored) => scored,
            Err(e) => {
                self.swapper.discard(metric_id);
                return Err(e);
            }
        };
        self.swapper.checkpoint(metric_id)?;

        report.scored = samples.iter().filter(|s| s.anomaly_score.is_some()).count();
        report.unscored = samples.len() - report.scored;
        report.last_row_id_for_stats = anomaly_params.as_ref().map(|p| p.last_row_id_for_stats);
        report.max_anomaly_score = samples
            .iter()
            .filter_map(|s| s.anomaly_score)
            .fold(None, |acc: Option<f64>, s| Some(acc.map_or(s, |a| a.max(s))));

        debug!(
            %metric_id,
            scored = report.scored,
            unscored = report.unscored,
            last_row_id_for_stats = ?report.last_row_id_for_stats,
            "batch processed"
        );
        Ok(report)
    }

    fn score_and_commit(
        &self,
        metric: &Metric,
        records: &[MetricRecord],
        outcome: CommandOutcome,
    ) -> Result<(Vec<MetricSample>, Option<AnomalyLikelihoodParams>)> {
        let CommandOutcome::Inferences { results } = outcome else {
            anyhow::bail!("unexpected outcome for processRows on metric '{}'", metric.id);
        };

        let mut samples: Vec<MetricSample> = records
            .iter()
            .zip(&results)
            .map(|(record, inference)| {
                MetricSample::new(record.row_id, record.timestamp, record.value, inference.raw_anomaly_score)
            })
            .collect();

        let anomaly_params = self.helper.update_model_anomaly_scores(metric, &mut samples)?;
        self.repo
            .commit_batch(&metric.id, &samples, anomaly_params.as_ref())
            .with_context(|| format!("Failed to persist batch for metric '{}'", metric.id))?;
        Ok((samples, anomaly_params))
    }

    /// Checkpoint and release all loaded models.
    pub fn shutdown(&self) -> Result<()> {
        self.swapper.close_all()?;
        Ok(())
    }

    fn metric_lock(&self, metric_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.metric_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(metric_id.to_string()).or_default().clone()
    }
}
