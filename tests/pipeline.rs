//! End-to-end scoring through the public API against a throwaway database.

use chrono::{TimeZone, Utc};
use streamscore::config::EngineConfig;
use streamscore::model::{EwmaParams, ModelParams};
use streamscore::service::{metric_model_definition, MetricRecord};
use streamscore::storage::metrics::display_value;

fn config(dir: &tempfile::TempDir) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.storage.db_path = dir.path().join("nested").join("engine.db");
    cfg.likelihood.min_sample_size = 100;
    cfg.likelihood.skip_records = 0;
    cfg
}

fn record(row_id: u64, value: f64) -> MetricRecord {
    MetricRecord {
        row_id,
        timestamp: Utc.timestamp_opt(1_700_000_000 + row_id as i64 * 300, 0).unwrap(),
        value,
    }
}

fn steady(ids: std::ops::Range<u64>) -> Vec<MetricRecord> {
    ids.map(|id| record(id, 50.0 + (id % 7) as f64)).collect()
}

#[tokio::test]
async fn test_spike_scores_as_anomalous() {
    let dir = tempfile::tempdir().unwrap();
    let svc = streamscore::open_service(&config(&dir)).unwrap();
    svc.create_metric(
        "latency",
        "Gateway latency",
        metric_model_definition(ModelParams::Ewma(EwmaParams::default()), Some(300)),
    )
    .unwrap();

    let warmup = svc.process_batch("latency", steady(0..300)).await.unwrap();
    assert_eq!(warmup.unscored, 100);
    assert_eq!(warmup.scored, 200);

    let mut batch = steady(300..305);
    batch[2].value = 5_000.0;
    let report = svc.process_batch("latency", batch).await.unwrap();
    assert_eq!(report.scored, 5);

    let stored = svc.repository().samples("latency").unwrap();
    assert_eq!(stored.len(), 305);

    let spike = &stored[302];
    assert_eq!(spike.row_id, 302);
    let score = spike.anomaly_score.unwrap();
    assert!(score > 0.99, "spike scored {}", score);
    assert!(display_value(score) > 2000);

    let calm = stored[300].anomaly_score.unwrap();
    assert!(calm < score);

    // The severe anomaly forced a refresh that covers the spike.
    let params = svc
        .repository()
        .get_metric("latency")
        .unwrap()
        .unwrap()
        .model_params
        .anomaly_likelihood_params
        .unwrap();
    assert!(params.last_row_id_for_stats >= 302);

    svc.shutdown().unwrap();
}

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(&dir);
    {
        let svc = streamscore::open_service(&cfg).unwrap();
        svc.create_metric(
            "cpu",
            "CPU load",
            metric_model_definition(ModelParams::Ewma(EwmaParams::default()), None),
        )
        .unwrap();
        svc.process_batch("cpu", steady(0..150)).await.unwrap();
        svc.shutdown().unwrap();
    }

    let svc = streamscore::open_service(&cfg).unwrap();
    let before = svc.repository().get_metric("cpu").unwrap().unwrap();
    let cursor = before
        .model_params
        .anomaly_likelihood_params
        .as_ref()
        .map(|p| p.last_row_id_for_stats)
        .unwrap();

    // Rows already stored are dropped on redelivery.
    let again = svc.process_batch("cpu", steady(100..160)).await.unwrap();
    assert_eq!(again.duplicates, 50);
    assert_eq!(again.scored, 10);

    let after = svc.repository().get_metric("cpu").unwrap().unwrap();
    let advanced = after.model_params.anomaly_likelihood_params.unwrap().last_row_id_for_stats;
    assert!(advanced >= cursor);
    assert_eq!(svc.repository().last_row_id("cpu").unwrap(), Some(159));
}
