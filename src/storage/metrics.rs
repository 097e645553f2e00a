//! Metrics, their data rows and persisted likelihood params.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::likelihood::{
    AnomalyLikelihoodParams, Metric, MetricModelParams, MetricSample, MetricStatus, SampleHistory,
};
use crate::storage::Pool;

/// Severity bucket shown to users: `-log10(1 - score)` scaled by 1000, so
/// 0.9 maps to 1000 and 0.999 to 3000.
pub fn display_value(anomaly_score: f64) -> i64 {
    let tail = (1.0 - anomaly_score).max(1e-5);
    (-tail.log10() * 1000.0).round() as i64
}

#[derive(Clone)]
pub struct MetricRepository {
    pool: Pool,
}

impl MetricRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn create_metric(
        &self,
        uid: &str,
        name: &str,
        status: MetricStatus,
        model_params: &MetricModelParams,
    ) -> Result<()> {
        let conn = self.pool.get()?;
        let json = serde_json::to_string(model_params)?;
        conn.execute(
            "INSERT INTO metrics (uid, name, status, parameters_json) VALUES (?1, ?2, ?3, ?4)",
            params![uid, name, status.to_string(), json],
        )
        .with_context(|| format!("Failed to insert metric '{}'", uid))?;
        Ok(())
    }

    pub fn set_status(&self, uid: &str, status: MetricStatus) -> Result<()> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE metrics SET status = ?2, updated_at = datetime('now') WHERE uid = ?1",
            params![uid, status.to_string()],
        )?;
        if changed == 0 {
            anyhow::bail!("Metric '{}' not found", uid);
        }
        Ok(())
    }

    pub fn get_metric(&self, uid: &str) -> Result<Option<Metric>> {
        let conn = self.pool.get()?;
        let row: Option<(String, String, String)> = conn
            .query_row(
                "SELECT name, status, parameters_json FROM metrics WHERE uid = ?1",
                params![uid],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        row.map(|(name, status, json)| metric_from_row(uid.to_string(), name, status, json))
            .transpose()
    }

    pub fn list_metrics(&self) -> Result<Vec<Metric>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT uid, name, status, parameters_json FROM metrics ORDER BY uid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut metrics = Vec::new();
        for r in rows {
            let (uid, name, status, json) = r?;
            metrics.push(metric_from_row(uid, name, status, json)?);
        }
        Ok(metrics)
    }

    /// Highest stored row id for the metric.
    pub fn last_row_id(&self, uid: &str) -> Result<Option<u64>> {
        let conn = self.pool.get()?;
        let max: Option<i64> = conn.query_row(
            "SELECT MAX(row_id) FROM metric_data WHERE uid = ?1",
            params![uid],
            |row| row.get(0),
        )?;
        Ok(max.map(|v| v as u64))
    }

    /// All stored rows of a metric, ascending.
    pub fn samples(&self, uid: &str) -> Result<Vec<MetricSample>> {
        self.query_samples(
            "SELECT row_id, timestamp, metric_value, raw_anomaly_score, anomaly_score
             FROM metric_data WHERE uid = ?1 ORDER BY row_id ASC LIMIT ?2",
            uid,
            i64::MAX,
        )
    }

    /// Persist scored rows and the params that go with them atomically.
    pub fn commit_batch(
        &self,
        uid: &str,
        rows: &[MetricSample],
        anomaly_params: Option<&AnomalyLikelihoodParams>,
    ) -> Result<()> {
        let mut conn = self.pool.get()?;
        // Reads then writes; take the write lock up front so concurrent
        // batches wait on busy_timeout instead of failing the upgrade.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let json: String = tx
            .query_row(
                "SELECT parameters_json FROM metrics WHERE uid = ?1",
                params![uid],
                |row| row.get(0),
            )
            .optional()?
            .with_context(|| format!("Metric '{}' not found", uid))?;
        let mut model_params: MetricModelParams =
            serde_json::from_str(&json).with_context(|| format!("Corrupt parameters for metric '{}'", uid))?;
        model_params.anomaly_likelihood_params = anomaly_params.cloned();

        {
            let mut insert = tx.prepare(
                "INSERT INTO metric_data
                    (uid, row_id, timestamp, metric_value, raw_anomaly_score, anomaly_score, display_value)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(uid, row_id) DO UPDATE SET
                    raw_anomaly_score = excluded.raw_anomaly_score,
                    anomaly_score = excluded.anomaly_score,
                    display_value = excluded.display_value",
            )?;
            for row in rows {
                insert.execute(params![
                    uid,
                    row.row_id as i64,
                    row.timestamp.to_rfc3339(),
                    row.value,
                    row.raw_anomaly_score,
                    row.anomaly_score,
                    row.anomaly_score.map(display_value),
                ])?;
            }
        }

        tx.execute(
            "UPDATE metrics SET parameters_json = ?2, updated_at = datetime('now') WHERE uid = ?1",
            params![uid, serde_json::to_string(&model_params)?],
        )?;
        tx.commit().context("Failed to commit metric batch")?;
        Ok(())
    }

    pub fn delete_metric(&self, uid: &str) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute("DELETE FROM metrics WHERE uid = ?1", params![uid])?;
        Ok(())
    }

    fn query_samples(&self, sql: &str, uid: &str, limit: i64) -> Result<Vec<MetricSample>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![uid, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Option<f64>>(4)?,
            ))
        })?;

        let mut samples = Vec::new();
        for r in rows {
            let (row_id, ts, value, raw_anomaly_score, anomaly_score) = r?;
            let timestamp = DateTime::parse_from_rfc3339(&ts)
                .with_context(|| format!("Bad timestamp '{}' for row {}", ts, row_id))?
                .with_timezone(&Utc);
            samples.push(MetricSample {
                row_id: row_id as u64,
                timestamp,
                value,
                raw_anomaly_score,
                anomaly_score,
            });
        }
        Ok(samples)
    }
}

impl SampleHistory for MetricRepository {
    fn count_processed(&self, metric_id: &str) -> Result<u64> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM metric_data WHERE uid = ?1 AND raw_anomaly_score IS NOT NULL",
            params![metric_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn fetch_tail(&self, metric_id: &str, limit: usize) -> Result<Vec<MetricSample>> {
        let mut tail = self.query_samples(
            "SELECT row_id, timestamp, metric_value, raw_anomaly_score, anomaly_score
             FROM metric_data
             WHERE uid = ?1 AND raw_anomaly_score IS NOT NULL
             ORDER BY row_id DESC LIMIT ?2",
            metric_id,
            limit as i64,
        )?;
        tail.reverse();
        Ok(tail)
    }
}

fn metric_from_row(uid: String, name: String, status: String, json: String) -> Result<Metric> {
    let model_params = serde_json::from_str(&json)
        .with_context(|| format!("Corrupt parameters for metric '{}'", uid))?;
    Ok(Metric {
        status: status.parse()?,
        id: uid,
        name,
        model_params,
    })
}
