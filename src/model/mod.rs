//! Per-model lifecycle: definitions, checkpoints, row encoding and the
//! command processor that runs rows through a model.

pub mod checkpoint;
pub mod encoder;
pub mod ewma;
pub mod runner;
pub mod swapper;

pub use checkpoint::{CheckpointStore, MemoryCheckpointStore, SqliteCheckpointStore};
pub use encoder::{EncodedRecord, FieldValue, RowEncoder};
pub use ewma::{BuiltinModelFactory, EwmaModel, EwmaParams};
pub use runner::ModelRunner;
pub use swapper::{ModelCommand, ModelCommandResult, ModelSwapperInterface};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Error, PartialEq)]
pub enum EncodeError {
    #[error("row has {got} values but the schema declares {expected} fields")]
    FieldCountMismatch { expected: usize, got: usize },

    #[error("invalid value '{value}' for field '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("schema declares more than one timestamp field: {0:?}")]
    MultipleTimestampFields(Vec<String>),
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("model not found: {model_id}")]
    ModelNotFound { model_id: String },

    #[error("failed to encode row {row_id}: {source}")]
    Encode {
        row_id: u64,
        #[source]
        source: EncodeError,
    },

    #[error("inference failed for row {row_id}: {source}")]
    Inference {
        row_id: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<CheckpointError> for RunnerError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::ModelNotFound { model_id } => RunnerError::ModelNotFound { model_id },
            CheckpointError::Storage(e) => RunnerError::Storage(e),
        }
    }
}

/// Declared type of an input field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Float,
    Int,
    String,
    Datetime,
}

/// Role a field plays beyond carrying a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldSpecial {
    #[default]
    None,
    Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMeta {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub special: FieldSpecial,
}

/// Static description of the columns of an input row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFieldSchema {
    pub fields: Vec<FieldMeta>,
    /// Aggregation period in seconds; `None` when rows are not aggregated.
    #[serde(default)]
    pub aggregation_period_secs: Option<i64>,
}

/// Parameters used to construct a fresh model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelParams {
    Ewma(EwmaParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceArgs {
    /// Field whose value the model predicts and scores.
    pub predicted_field: String,
}

/// Everything needed to rebuild a model from scratch. Immutable once defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub model_params: ModelParams,
    pub inference_args: InferenceArgs,
    pub input_schema: InputFieldSchema,
}

/// One raw input row: ordered string values matching the schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRow {
    pub row_id: u64,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    pub row_id: u64,
    pub raw_anomaly_score: f64,
}

/// Serialized state of a running model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub kind: String,
    pub state: serde_json::Value,
}

/// Learning model producing a raw anomaly magnitude per record.
pub trait Model: Send {
    fn enable_learning(&mut self);

    fn enable_inference(&mut self, args: &InferenceArgs);

    /// Run one inference step; may also learn from the record.
    fn infer(&mut self, record: &EncodedRecord) -> anyhow::Result<f64>;

    fn snapshot(&self) -> anyhow::Result<ModelSnapshot>;
}

/// Builds models from params or restores them from snapshots.
pub trait ModelFactory: Send + Sync {
    fn create(&self, params: &ModelParams) -> anyhow::Result<Box<dyn Model>>;

    fn restore(&self, snapshot: &ModelSnapshot) -> anyhow::Result<Box<dyn Model>>;
}
