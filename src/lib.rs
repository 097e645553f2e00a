//! streamscore -- online anomaly likelihood scoring for metric streams.
//!
//! This crate provides the likelihood helper that turns raw anomaly scores
//! into calibrated anomaly scores, the per-model runner with checkpointed
//! lazy loading, and the SQLite-backed service that drives both.

pub mod config;
pub mod likelihood;
pub mod model;
pub mod service;
pub mod storage;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::EngineConfig;
use crate::model::{BuiltinModelFactory, SqliteCheckpointStore};
use crate::service::AnomalyService;
use crate::storage::MetricRepository;

/// Open the database named in `config` and assemble the scoring service.
pub fn open_service(config: &EngineConfig) -> Result<Arc<AnomalyService>> {
    let db_path = &config.storage.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }

    let db_path = db_path
        .to_str()
        .with_context(|| format!("database path is not valid UTF-8: {}", db_path.display()))?;
    tracing::info!(%db_path, "Initializing database");
    let pool = storage::open_pool(db_path)?;

    Ok(Arc::new(AnomalyService::new(
        MetricRepository::new(pool.clone()),
        Arc::new(SqliteCheckpointStore::new(pool)),
        Arc::new(BuiltinModelFactory),
        config.likelihood.clone(),
    )))
}
