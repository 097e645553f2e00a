//! Converts raw anomaly scores into calibrated anomaly likelihood scores.
//!
//! The helper keeps a rolling window of samples per metric, refits the
//! distribution every `refresh interval` row ids and scores each new row
//! against the latest fit. Every cursor it uses is derived from row ids in
//! the batch or the persisted params, so redelivering a batch reproduces the
//! same params and scores.

use crate::likelihood::{
    AnomalyLikelihoodParams, LikelihoodError, LikelihoodEstimator, LikelihoodSettings, Metric,
    MetricSample, SampleCache, SampleHistory,
};
use tracing::{debug, info, warn};

/// Result of the bootstrap step for a metric that has no params yet.
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapState {
    pub anomaly_params: Option<AnomalyLikelihoodParams>,
    pub sample_cache: Option<SampleCache>,
    /// Index of the first row in the batch that still needs scoring.
    pub start_row_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshOutcome {
    pub anomaly_params: Option<AnomalyLikelihoodParams>,
    pub sample_cache: SampleCache,
}

pub struct AnomalyLikelihoodHelper<E, H> {
    settings: LikelihoodSettings,
    estimator: E,
    history: H,
}

impl<E, H> AnomalyLikelihoodHelper<E, H>
where
    E: LikelihoodEstimator,
    H: SampleHistory,
{
    pub fn new(settings: LikelihoodSettings, estimator: E, history: H) -> Self {
        Self {
            settings,
            estimator,
            history,
        }
    }

    /// Fit params on the most recent samples, or hand back `default` when
    /// there are not enough samples yet.
    pub fn generate_anomaly_params(
        &self,
        metric_id: &str,
        samples: &[MetricSample],
        default: Option<AnomalyLikelihoodParams>,
    ) -> Result<Option<AnomalyLikelihoodParams>, LikelihoodError> {
        if samples.len() < self.settings.min_sample_size {
            debug!(
                %metric_id,
                have = samples.len(),
                needed = self.settings.min_sample_size,
                "insufficient samples for anomaly params"
            );
            return Ok(default);
        }

        let take = samples.len().min(self.settings.max_sample_size);
        let recent = &samples[samples.len() - take..];
        let params = self.estimator.fit(recent, self.settings.skip_records)?;
        let last_row_id_for_stats = recent[recent.len() - 1].row_id;

        debug!(
            %metric_id,
            samples = take,
            last_row_id_for_stats,
            mean = params.distribution.mean,
            stdev = params.distribution.stdev,
            "generated anomaly params"
        );

        Ok(Some(AnomalyLikelihoodParams {
            last_row_id_for_stats,
            params,
        }))
    }

    /// Number of row ids to score between statistics refreshes. Larger
    /// batches mean backlog catch-up, so refreshes get proportionally rarer.
    pub fn statistics_refresh_interval(&self, batch_size: i64) -> u64 {
        let scaled = (batch_size as f64 * self.settings.refresh_batch_fraction).round();
        let min = self.settings.min_refresh_interval;
        if scaled > min as f64 {
            scaled as u64
        } else {
            min
        }
    }

    /// Bootstrap params for a metric that has none. Rows consumed here feed
    /// the first fit and stay unscored.
    pub fn init_anomaly_likelihood_model(
        &self,
        metric: &Metric,
        rows: &[MetricSample],
    ) -> Result<BootstrapState, LikelihoodError> {
        metric.ensure_active()?;

        let historical_count = self.history.count_processed(&metric.id)? as usize;
        let min = self.settings.min_sample_size;

        if historical_count + rows.len() < min {
            debug!(
                metric_id = %metric.id,
                historical_count,
                batch = rows.len(),
                "not enough history for anomaly likelihood model yet"
            );
            return Ok(BootstrapState {
                anomaly_params: metric.model_params.anomaly_likelihood_params.clone(),
                sample_cache: None,
                start_row_index: rows.len(),
            });
        }

        let num_to_consume = min.saturating_sub(historical_count);
        let consumed = rows[..num_to_consume].to_vec();
        let outcome = self.refresh_anomaly_params(
            &metric.id,
            None,
            consumed,
            metric.model_params.anomaly_likelihood_params.clone(),
        )?;

        info!(
            metric_id = %metric.id,
            historical_count,
            consumed = num_to_consume,
            cache = outcome.sample_cache.len(),
            last_row_id_for_stats = outcome.anomaly_params.as_ref().map(|p| p.last_row_id_for_stats),
            "bootstrapped anomaly likelihood model"
        );

        Ok(BootstrapState {
            anomaly_params: outcome.anomaly_params,
            sample_cache: Some(outcome.sample_cache),
            start_row_index: num_to_consume,
        })
    }

    /// Fold `consumed` into the cache (seeding it from history when unset)
    /// and refit.
    pub fn refresh_anomaly_params(
        &self,
        metric_id: &str,
        sample_cache: Option<SampleCache>,
        consumed: Vec<MetricSample>,
        default: Option<AnomalyLikelihoodParams>,
    ) -> Result<RefreshOutcome, LikelihoodError> {
        let max = self.settings.max_sample_size;
        let mut cache = match sample_cache {
            Some(cache) => cache,
            None => {
                let limit = max.saturating_sub(consumed.len());
                let tail = if limit > 0 {
                    self.history.fetch_tail(metric_id, limit)?
                } else {
                    Vec::new()
                };
                debug!(%metric_id, seeded = tail.len(), limit, "seeded sample cache from history");
                SampleCache::seeded(tail, max)
            }
        };
        cache.extend(consumed);

        let previous = default.as_ref().map(|p| p.last_row_id_for_stats);
        let mut anomaly_params = self.generate_anomaly_params(metric_id, cache.as_slice(), default.clone())?;

        if let (Some(prev), Some(new)) = (previous, anomaly_params.as_ref()) {
            if new.last_row_id_for_stats < prev {
                warn!(
                    %metric_id,
                    previous = prev,
                    refreshed = new.last_row_id_for_stats,
                    "refreshed params predate current params, keeping current"
                );
                anomaly_params = default;
            }
        }

        Ok(RefreshOutcome {
            anomaly_params,
            sample_cache: cache,
        })
    }

    /// Score `rows` (ascending by row id) in place and return the params the
    /// caller should persist with them.
    pub fn update_model_anomaly_scores(
        &self,
        metric: &Metric,
        rows: &mut [MetricSample],
    ) -> Result<Option<AnomalyLikelihoodParams>, LikelihoodError> {
        metric.ensure_active()?;

        let refresh_interval = self.statistics_refresh_interval(rows.len() as i64);
        let min = self.settings.min_sample_size;

        let BootstrapState {
            anomaly_params: mut params,
            sample_cache: mut cache,
            start_row_index: mut start,
        } = match metric.model_params.anomaly_likelihood_params.clone() {
            Some(existing) => BootstrapState {
                anomaly_params: Some(existing),
                sample_cache: None,
                start_row_index: 0,
            },
            None => self.init_anomaly_likelihood_model(metric, rows)?,
        };

        while start < rows.len() {
            let next_row_id = rows[start].row_id;

            let end_row_id = match (cache.as_ref(), params.as_ref()) {
                (Some(c), _) if c.len() < min => {
                    // Previous refresh lacked samples; widen the run so the
                    // cache can reach the minimum.
                    next_row_id + min.saturating_sub(c.len()).saturating_sub(1) as u64
                }
                (_, Some(current)) => {
                    let mut end = current.last_row_id_for_stats + refresh_interval;
                    if end < next_row_id {
                        warn!(
                            metric_id = %metric.id,
                            end_row_id = end,
                            next_row_id,
                            start_row_index = start,
                            rows = rows.len(),
                            refresh_interval,
                            "anomaly run cutoff precedes samples"
                        );
                        if cache.is_some() {
                            // A refresh already ran in this call; move the
                            // cutoff so the next pass consumes at least one row.
                            end = next_row_id;
                            warn!(metric_id = %metric.id, end_row_id = end, "advanced anomaly run cutoff");
                        }
                    }
                    end
                }
                (_, None) => break,
            };

            let limit = if end_row_id < next_row_id {
                start
            } else {
                let span = (end_row_id + 1 - next_row_id) as usize;
                start + span.min(rows.len() - start)
            };

            debug!(
                metric_id = %metric.id,
                start_row_index = start,
                limit_index = limit,
                end_row_id,
                refresh_interval,
                "starting anomaly run"
            );

            let mut consumed: Vec<MetricSample> = Vec::with_capacity(limit - start);
            for row in rows[start..limit].iter_mut() {
                let Some(current) = params.as_ref() else {
                    consumed.push(row.clone());
                    continue;
                };

                let likelihood = self.estimator.score(row, &current.params);
                let score = (1.0 - likelihood).clamp(0.0, 1.0);
                row.anomaly_score = Some(score);
                consumed.push(row.clone());

                let elapsed = row.row_id.saturating_sub(current.last_row_id_for_stats);
                if score > self.settings.forced_refresh_score_threshold
                    && elapsed >= self.settings.forced_refresh_grace_rows
                {
                    let fills_cache = cache
                        .as_ref()
                        .map_or(true, |c| c.len() + consumed.len() >= min);
                    if fills_cache {
                        info!(
                            metric_id = %metric.id,
                            row_id = row.row_id,
                            anomaly_score = score,
                            "forcing refresh of anomaly params after severe anomaly"
                        );
                        break;
                    }
                }
            }

            start += consumed.len();
            let reached_end = consumed.last().map_or(false, |r| r.row_id >= end_row_id);

            if start < rows.len() || reached_end {
                let outcome = self.refresh_anomaly_params(&metric.id, cache.take(), consumed, params.clone())?;
                params = outcome.anomaly_params;
                cache = Some(outcome.sample_cache);
            }
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::likelihood::{
        AnomalyParams, EstimatorError, GaussianTailEstimator, MetricModelParams, MetricStatus,
    };
    use chrono::{TimeZone, Utc};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Mutex;

    /// Processed history held in memory.
    #[derive(Default)]
    struct MemoryHistory {
        samples: Vec<MetricSample>,
    }

    impl SampleHistory for MemoryHistory {
        fn count_processed(&self, _metric_id: &str) -> anyhow::Result<u64> {
            Ok(self.samples.iter().filter(|s| s.raw_anomaly_score.is_some()).count() as u64)
        }

        fn fetch_tail(&self, _metric_id: &str, limit: usize) -> anyhow::Result<Vec<MetricSample>> {
            let scored: Vec<MetricSample> = self
                .samples
                .iter()
                .filter(|s| s.raw_anomaly_score.is_some())
                .cloned()
                .collect();
            let start = scored.len().saturating_sub(limit);
            Ok(scored[start..].to_vec())
        }
    }

    /// History whose stored tail is shorter than its processed count, as
    /// when older rows were purged.
    struct TruncatedHistory {
        processed: u64,
        tail: Vec<MetricSample>,
    }

    impl SampleHistory for TruncatedHistory {
        fn count_processed(&self, _metric_id: &str) -> anyhow::Result<u64> {
            Ok(self.processed)
        }

        fn fetch_tail(&self, _metric_id: &str, limit: usize) -> anyhow::Result<Vec<MetricSample>> {
            let start = self.tail.len().saturating_sub(limit);
            Ok(self.tail[start..].to_vec())
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Fit { last_row_id: u64 },
        Score { row_id: u64 },
    }

    /// Wraps the Gaussian estimator and records the order of calls.
    #[derive(Default)]
    struct RecordingEstimator {
        inner: GaussianTailEstimator,
        calls: Mutex<Vec<Call>>,
    }

    impl LikelihoodEstimator for RecordingEstimator {
        fn fit(&self, samples: &[MetricSample], skip_records: usize) -> Result<AnomalyParams, EstimatorError> {
            let last_row_id = samples.last().map(|s| s.row_id).unwrap_or_default();
            self.calls.lock().unwrap().push(Call::Fit { last_row_id });
            self.inner.fit(samples, skip_records)
        }

        fn score(&self, sample: &MetricSample, params: &AnomalyParams) -> f64 {
            self.calls.lock().unwrap().push(Call::Score { row_id: sample.row_id });
            self.inner.score(sample, params)
        }
    }

    fn rows(ids: std::ops::Range<u64>, raw: impl Fn(u64) -> f64) -> Vec<MetricSample> {
        ids.map(|id| {
            let ts = Utc.timestamp_opt(1_700_000_000 + id as i64 * 300, 0).unwrap();
            MetricSample::new(id, ts, id as f64, raw(id))
        })
        .collect()
    }

    fn steady(id: u64) -> f64 {
        0.1 + 0.01 * (id % 3) as f64
    }

    fn metric(params: Option<AnomalyLikelihoodParams>) -> Metric {
        Metric {
            id: "m1".to_string(),
            name: "cpu".to_string(),
            status: MetricStatus::Active,
            model_params: MetricModelParams {
                anomaly_likelihood_params: params,
                ..Default::default()
            },
        }
    }

    fn helper(history: MemoryHistory) -> AnomalyLikelihoodHelper<GaussianTailEstimator, MemoryHistory> {
        AnomalyLikelihoodHelper::new(LikelihoodSettings::default(), GaussianTailEstimator, history)
    }

    #[test]
    fn test_refresh_interval() {
        let h = helper(MemoryHistory::default());
        assert_eq!(h.statistics_refresh_interval(-1), 10);
        assert_eq!(h.statistics_refresh_interval(0), 10);
        assert_eq!(h.statistics_refresh_interval(200), 20);
        assert_eq!(h.statistics_refresh_interval(1000), 100);
        assert_eq!(h.statistics_refresh_interval(104), 10);
        assert_eq!(h.statistics_refresh_interval(115), 12);
    }

    #[test]
    fn test_generate_passes_default_through_when_insufficient() {
        let h = helper(MemoryHistory::default());
        let default = Some(AnomalyLikelihoodParams {
            last_row_id_for_stats: 42,
            params: GaussianTailEstimator.fit(&rows(0..5, steady), 0).unwrap(),
        });
        let out = h
            .generate_anomaly_params("m1", &rows(0..199, steady), default.clone())
            .unwrap();
        assert_eq!(out, default);
        assert_eq!(h.generate_anomaly_params("m1", &rows(0..10, steady), None).unwrap(), None);
    }

    #[test]
    fn test_generate_uses_most_recent_window() {
        let h = helper(MemoryHistory::default());
        let out = h
            .generate_anomaly_params("m1", &rows(0..1500, steady), None)
            .unwrap()
            .unwrap();
        assert_eq!(out.last_row_id_for_stats, 1499);
    }

    #[test]
    fn test_metric_not_active_is_rejected() {
        let h = helper(MemoryHistory::default());
        let mut m = metric(None);
        m.status = MetricStatus::PendingData;
        let mut batch = rows(0..10, steady);
        let err = h.update_model_anomaly_scores(&m, &mut batch).unwrap_err();
        assert!(matches!(
            err,
            LikelihoodError::MetricNotActive { status: MetricStatus::PendingData, .. }
        ));
        assert!(h.init_anomaly_likelihood_model(&m, &batch).is_err());
    }

    #[test]
    fn test_scenario_insufficient_history() {
        let h = helper(MemoryHistory::default());
        let batch = rows(0..150, steady);
        let state = h.init_anomaly_likelihood_model(&metric(None), &batch).unwrap();
        assert_eq!(state.start_row_index, 150);
        assert_eq!(state.anomaly_params, None);
        assert_eq!(state.sample_cache, None);

        let mut batch = batch;
        let params = h.update_model_anomaly_scores(&metric(None), &mut batch).unwrap();
        assert_eq!(params, None);
        assert!(batch.iter().all(|r| r.anomaly_score.is_none()));
    }

    #[test]
    fn test_scenario_bootstrap_then_score_rest() {
        let h = helper(MemoryHistory::default());
        let mut batch = rows(0..500, steady);

        let state = h.init_anomaly_likelihood_model(&metric(None), &batch).unwrap();
        assert_eq!(state.start_row_index, 200);
        assert_eq!(state.anomaly_params.as_ref().unwrap().last_row_id_for_stats, 199);
        assert_eq!(state.sample_cache.as_ref().unwrap().len(), 200);

        let params = h.update_model_anomaly_scores(&metric(None), &mut batch).unwrap();
        assert!(params.is_some());
        assert!(batch[..200].iter().all(|r| r.anomaly_score.is_none()));
        assert!(batch[200..].iter().all(|r| r.anomaly_score.is_some()));
    }

    #[test]
    fn test_bootstrap_counts_existing_history() {
        let history = MemoryHistory {
            samples: rows(0..120, steady),
        };
        let h = helper(history);
        let batch = rows(120..220, steady);
        let state = h.init_anomaly_likelihood_model(&metric(None), &batch).unwrap();
        assert_eq!(state.start_row_index, 80);
        assert_eq!(state.anomaly_params.unwrap().last_row_id_for_stats, 199);
    }

    #[test]
    fn test_scenario_severe_anomaly_forces_refresh() {
        let history = MemoryHistory {
            samples: rows(0..300, steady),
        };
        let seed = GaussianTailEstimator
            .fit(&history.samples, LikelihoodSettings::default().skip_records)
            .unwrap();
        let m = metric(Some(AnomalyLikelihoodParams {
            last_row_id_for_stats: 299,
            params: seed,
        }));

        let estimator = RecordingEstimator::default();
        let h = AnomalyLikelihoodHelper::new(LikelihoodSettings::default(), estimator, history);

        let mut batch = rows(300..340, |id| if id == 315 { 5.0 } else { steady(id) });
        h.update_model_anomaly_scores(&m, &mut batch).unwrap();

        let spike = &batch[15];
        assert_eq!(spike.row_id, 315);
        assert!(spike.anomaly_score.unwrap() > 0.99);

        let calls = h.estimator.calls.lock().unwrap().clone();
        let pos = calls
            .iter()
            .position(|c| *c == Call::Score { row_id: 315 })
            .unwrap();
        // The cache was already full from the first refresh at row 309.
        assert!(calls[..pos].contains(&Call::Fit { last_row_id: 309 }));
        assert_eq!(calls[pos + 1], Call::Fit { last_row_id: 315 });
        assert_eq!(calls[pos + 2], Call::Score { row_id: 316 });
        assert!(batch.iter().all(|r| r.anomaly_score.is_some()));
    }

    #[test]
    fn test_severe_anomaly_before_first_refresh() {
        let history = MemoryHistory {
            samples: rows(0..300, steady),
        };
        let seed = GaussianTailEstimator
            .fit(&history.samples, LikelihoodSettings::default().skip_records)
            .unwrap();
        let m = metric(Some(AnomalyLikelihoodParams {
            last_row_id_for_stats: 299,
            params: seed,
        }));

        let estimator = RecordingEstimator::default();
        let h = AnomalyLikelihoodHelper::new(LikelihoodSettings::default(), estimator, history);

        let mut batch = rows(300..340, |id| if id == 301 { 5.0 } else { steady(id) });
        let params = h.update_model_anomaly_scores(&m, &mut batch).unwrap().unwrap();
        assert!(batch[1].anomaly_score.unwrap() > 0.99);

        // No cache exists yet, so the stop does not wait for one to fill:
        // the cache is seeded from history and refit right after the spike.
        let calls = h.estimator.calls.lock().unwrap().clone();
        assert_eq!(
            calls[..4],
            [
                Call::Score { row_id: 300 },
                Call::Score { row_id: 301 },
                Call::Fit { last_row_id: 301 },
                Call::Score { row_id: 302 },
            ]
        );
        assert!(params.last_row_id_for_stats >= 301);
        assert!(batch.iter().all(|r| r.anomaly_score.is_some()));
    }

    #[test]
    fn test_short_cache_widens_next_run() {
        let history = TruncatedHistory {
            processed: 150,
            tail: rows(100..150, steady),
        };
        let h = AnomalyLikelihoodHelper::new(LikelihoodSettings::default(), RecordingEstimator::default(), history);
        let mut batch = rows(150..600, steady);

        // Bootstrap takes 50 rows but the cache only reaches 100 samples.
        let state = h.init_anomaly_likelihood_model(&metric(None), &batch).unwrap();
        assert_eq!(state.start_row_index, 50);
        assert_eq!(state.anomaly_params, None);
        assert_eq!(state.sample_cache.as_ref().unwrap().len(), 100);

        // The next run ends at 200 + (200 - 100) - 1 = 299, which fills the
        // cache; scoring starts right after it.
        let params = h.update_model_anomaly_scores(&metric(None), &mut batch).unwrap().unwrap();
        assert!(batch[..150].iter().all(|r| r.anomaly_score.is_none()));
        assert!(batch[150..].iter().all(|r| r.anomaly_score.is_some()));

        let calls = h.estimator.calls.lock().unwrap().clone();
        assert_eq!(calls[0], Call::Fit { last_row_id: 299 });
        assert_eq!(calls[1], Call::Score { row_id: 300 });
        // Refresh interval for 450 rows is 45.
        assert_eq!(params.last_row_id_for_stats, 569);
    }

    #[test]
    fn test_cutoff_before_batch_is_advanced() {
        // Params are far behind the batch: a scoring gap.
        let history = MemoryHistory {
            samples: rows(0..250, steady),
        };
        let seed = GaussianTailEstimator.fit(&history.samples[..200], 0).unwrap();
        let m = metric(Some(AnomalyLikelihoodParams {
            last_row_id_for_stats: 199,
            params: seed,
        }));
        let h = helper(history);

        let mut batch = rows(400..430, steady);
        let params = h.update_model_anomaly_scores(&m, &mut batch).unwrap().unwrap();
        assert!(batch.iter().all(|r| r.anomaly_score.is_some()));
        assert!(params.last_row_id_for_stats >= 249);
    }

    #[test]
    fn test_redelivery_is_idempotent() {
        let h = helper(MemoryHistory {
            samples: rows(0..50, steady),
        });
        let mut rng = StdRng::seed_from_u64(7);
        let raw: Vec<f64> = (0..600).map(|_| rng.gen_range(0.0..0.3)).collect();
        let batch = rows(50..650, |id| raw[(id - 50) as usize]);

        let mut first = batch.clone();
        let mut second = batch;
        let p1 = h.update_model_anomaly_scores(&metric(None), &mut first).unwrap();
        let p2 = h.update_model_anomaly_scores(&metric(None), &mut second).unwrap();

        assert_eq!(p1, p2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_cursor_monotonic_and_scores_bounded() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut history = MemoryHistory::default();
        let mut m = metric(None);
        let mut last_cursor = 0;
        let mut next_id = 0u64;

        for batch_len in [120usize, 90, 300, 15, 1, 700, 40] {
            let raw: Vec<f64> = (0..batch_len)
                .map(|_| {
                    if rng.gen_bool(0.02) {
                        rng.gen_range(0.8..1.0)
                    } else {
                        rng.gen_range(0.0..0.2)
                    }
                })
                .collect();
            let base = next_id;
            let mut batch = rows(base..base + batch_len as u64, |id| raw[(id - base) as usize]);
            next_id += batch_len as u64;

            let h = helper(history);
            let params = h.update_model_anomaly_scores(&m, &mut batch).unwrap();
            history = h.history;

            if let Some(p) = &params {
                assert!(p.last_row_id_for_stats >= last_cursor);
                last_cursor = p.last_row_id_for_stats;
            }
            for row in &batch {
                if let Some(score) = row.anomaly_score {
                    assert!((0.0..=1.0).contains(&score));
                }
            }

            history.samples.extend(batch);
            m.model_params.anomaly_likelihood_params = params;
        }

        assert!(m.model_params.anomaly_likelihood_params.is_some());
    }

    #[test]
    fn test_refresh_keeps_cache_bounded() {
        let h = helper(MemoryHistory {
            samples: rows(0..990, steady),
        });
        let outcome = h
            .refresh_anomaly_params("m1", None, rows(990..1010, steady), None)
            .unwrap();
        assert_eq!(outcome.sample_cache.len(), 1000);
        let outcome = h
            .refresh_anomaly_params("m1", Some(outcome.sample_cache), rows(1010..1400, steady), None)
            .unwrap();
        assert_eq!(outcome.sample_cache.len(), 1000);
        assert_eq!(outcome.anomaly_params.unwrap().last_row_id_for_stats, 1399);
    }
}
