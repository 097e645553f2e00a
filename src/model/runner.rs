//! Per-model command processor.
//!
//! A runner owns at most one loaded model instance. The instance is created
//! lazily on the first row: restored from its checkpoint when one exists,
//! otherwise built fresh from the stored definition.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::model::{
    CheckpointError, CheckpointStore, InferenceResult, InputRow, Model, ModelDefinition, ModelFactory,
    RowEncoder, RunnerError,
};

/// Where a model id sits in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelState {
    Undefined,
    Defined,
    Loaded,
}

struct LoadedModel {
    model: Box<dyn Model>,
    definition: ModelDefinition,
}

pub struct ModelRunner {
    model_id: String,
    store: Arc<dyn CheckpointStore>,
    factory: Arc<dyn ModelFactory>,
    loaded: Option<LoadedModel>,
    encoder: Option<RowEncoder>,
}

impl ModelRunner {
    pub fn new(model_id: impl Into<String>, store: Arc<dyn CheckpointStore>, factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            model_id: model_id.into(),
            store,
            factory,
            loaded: None,
            encoder: None,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn state(&self) -> Result<ModelState, RunnerError> {
        if self.loaded.is_some() {
            return Ok(ModelState::Loaded);
        }
        Ok(match self.store.load_definition(&self.model_id)? {
            Some(_) => ModelState::Defined,
            None => ModelState::Undefined,
        })
    }

    /// Store the model definition. Re-sending an identical definition is a
    /// no-op; a different one replaces it and discards learned state.
    pub fn define_model(&mut self, definition: ModelDefinition) -> Result<(), RunnerError> {
        let existing = self.store.load_definition(&self.model_id)?;
        if existing.as_ref() == Some(&definition) {
            debug!(model_id = %self.model_id, "model already defined with the same definition");
            return Ok(());
        }

        self.store.define(&self.model_id, &definition)?;
        if existing.is_some() {
            self.store.discard_snapshot(&self.model_id)?;
            self.loaded = None;
            info!(model_id = %self.model_id, "model redefined, discarded checkpoint");
        } else {
            info!(model_id = %self.model_id, "model defined");
        }
        Ok(())
    }

    /// Run one row through the model and return its raw anomaly score.
    pub fn process_input_row(&mut self, row: InputRow) -> Result<InferenceResult, RunnerError> {
        let loaded = match self.loaded.take() {
            Some(loaded) => loaded,
            None => self.load_model()?,
        };
        let loaded = self.loaded.insert(loaded);

        let schema = &loaded.definition.input_schema;
        let encoder = match self.encoder.take() {
            Some(enc) if enc.schema() == schema => enc,
            _ => RowEncoder::new(schema.clone()).map_err(|source| RunnerError::Encode {
                row_id: row.row_id,
                source,
            })?,
        };
        let encoder = self.encoder.insert(encoder);

        encoder.set_row(row.values);
        let record = encoder.encode().map_err(|source| RunnerError::Encode {
            row_id: row.row_id,
            source,
        })?;

        let raw_anomaly_score = loaded
            .model
            .infer(&record)
            .map_err(|source| RunnerError::Inference {
                row_id: row.row_id,
                source,
            })?;

        Ok(InferenceResult {
            row_id: row.row_id,
            raw_anomaly_score,
        })
    }

    /// Persist the loaded instance, if any. Returns whether a checkpoint was
    /// written.
    pub fn checkpoint(&self) -> Result<bool, RunnerError> {
        let Some(loaded) = self.loaded.as_ref() else {
            return Ok(false);
        };
        let snapshot = loaded.model.snapshot()?;
        self.store.save(&self.model_id, &snapshot)?;
        debug!(model_id = %self.model_id, "model checkpoint saved");
        Ok(true)
    }

    /// Checkpoint and release the loaded instance.
    pub fn close(&mut self) -> Result<(), RunnerError> {
        self.checkpoint()?;
        self.loaded = None;
        self.encoder = None;
        Ok(())
    }

    /// Drop the loaded instance without checkpointing it. The next row reloads
    /// from the last checkpoint, forgetting whatever was learned since.
    pub fn discard(&mut self) {
        if self.loaded.take().is_some() {
            warn!(model_id = %self.model_id, "discarded loaded model without checkpoint");
        }
        self.encoder = None;
    }

    /// Remove checkpoint and definition. Deleting an unknown model succeeds.
    pub fn delete_model(&mut self) -> Result<(), RunnerError> {
        self.loaded = None;
        self.encoder = None;
        self.store.remove(&self.model_id)?;
        info!(model_id = %self.model_id, "model deleted");
        Ok(())
    }

    /// Restore from the checkpoint, or build from the definition when there
    /// is none. The definition is read either way since it carries the
    /// encoder schema and inference args.
    fn load_model(&self) -> Result<LoadedModel, RunnerError> {
        let snapshot = match self.store.load(&self.model_id) {
            Ok(snapshot) => Some(snapshot),
            Err(CheckpointError::ModelNotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let definition = self
            .store
            .load_definition(&self.model_id)?
            .ok_or_else(|| RunnerError::ModelNotFound {
                model_id: self.model_id.clone(),
            })?;

        let model = match snapshot {
            Some(snapshot) => {
                let mut model = self.factory.restore(&snapshot)?;
                model.enable_inference(&definition.inference_args);
                debug!(model_id = %self.model_id, "model restored from checkpoint");
                model
            }
            None => {
                let mut model = self.factory.create(&definition.model_params)?;
                model.enable_learning();
                model.enable_inference(&definition.inference_args);
                info!(model_id = %self.model_id, "no checkpoint, created model from definition");
                model
            }
        };

        Ok(LoadedModel { model, definition })
    }
}
