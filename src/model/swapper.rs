//! Command façade over per-model runners. A transport layer hands commands
//! to [`ModelSwapperInterface::submit`]; this module only defines the
//! synchronous contract.
//!
//! Each runner sits behind its own lock, so commands for distinct model ids
//! proceed in parallel while commands for one model id are serialized.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{CheckpointStore, InferenceResult, InputRow, ModelDefinition, ModelFactory, ModelRunner, RunnerError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ModelCommand {
    DefineModel { definition: ModelDefinition },
    DeleteModel,
    ProcessRows { rows: Vec<InputRow> },
}

impl ModelCommand {
    fn name(&self) -> &'static str {
        match self {
            ModelCommand::DefineModel { .. } => "defineModel",
            ModelCommand::DeleteModel => "deleteModel",
            ModelCommand::ProcessRows { .. } => "processRows",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum CommandOutcome {
    Defined,
    Deleted,
    Inferences { results: Vec<InferenceResult> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCommandResult {
    pub command_id: Uuid,
    pub model_id: String,
    pub outcome: CommandOutcome,
}

/// Routes commands to one [`ModelRunner`] per model id.
pub struct ModelSwapperInterface {
    store: Arc<dyn CheckpointStore>,
    factory: Arc<dyn ModelFactory>,
    runners: Mutex<HashMap<String, Arc<Mutex<ModelRunner>>>>,
}

impl ModelSwapperInterface {
    pub fn new(store: Arc<dyn CheckpointStore>, factory: Arc<dyn ModelFactory>) -> Self {
        Self {
            store,
            factory,
            runners: Mutex::new(HashMap::new()),
        }
    }

    pub fn submit(&self, model_id: &str, command: ModelCommand) -> Result<ModelCommandResult, RunnerError> {
        self.submit_with_id(Uuid::new_v4(), model_id, command)
    }

    /// Dispatch `command` under a caller-chosen id, echoed in the result.
    pub fn submit_with_id(
        &self,
        command_id: Uuid,
        model_id: &str,
        command: ModelCommand,
    ) -> Result<ModelCommandResult, RunnerError> {
        debug!(%command_id, %model_id, method = command.name(), "dispatching model command");

        let outcome = match command {
            ModelCommand::DefineModel { definition } => {
                self.with_runner(model_id, |runner| runner.define_model(definition))?;
                CommandOutcome::Defined
            }
            ModelCommand::DeleteModel => {
                let removed = self.runners_map().remove(model_id);
                match removed {
                    Some(runner) => {
                        lock_runner(model_id, &runner).delete_model()?;
                    }
                    None => self.store.remove(model_id)?,
                }
                CommandOutcome::Deleted
            }
            ModelCommand::ProcessRows { rows } => {
                let results = self.with_runner(model_id, |runner| {
                    let results = rows
                        .into_iter()
                        .map(|row| runner.process_input_row(row))
                        .collect::<Result<Vec<_>, _>>();
                    if results.is_err() {
                        // Rows before the failing one were already learned.
                        runner.discard();
                    }
                    results
                })?;
                CommandOutcome::Inferences { results }
            }
        };

        Ok(ModelCommandResult {
            command_id,
            model_id: model_id.to_string(),
            outcome,
        })
    }

    /// Run `f` on the runner for `model_id`, creating it on first use. The
    /// map lock is released before the runner lock is taken.
    fn with_runner<T>(&self, model_id: &str, f: impl FnOnce(&mut ModelRunner) -> T) -> T {
        let runner = self
            .runners_map()
            .entry(model_id.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(ModelRunner::new(
                    model_id,
                    self.store.clone(),
                    self.factory.clone(),
                )))
            })
            .clone();
        let mut guard = lock_runner(model_id, &runner);
        f(&mut guard)
    }

    pub fn checkpoint(&self, model_id: &str) -> Result<bool, RunnerError> {
        let Some(runner) = self.existing(model_id) else {
            return Ok(false);
        };
        let written = lock_runner(model_id, &runner).checkpoint()?;
        Ok(written)
    }

    /// Forget whatever the loaded instance learned since its last checkpoint.
    pub fn discard(&self, model_id: &str) {
        if let Some(runner) = self.existing(model_id) {
            lock_runner(model_id, &runner).discard();
        }
    }

    /// Checkpoint and release every loaded model.
    pub fn close_all(&self) -> Result<(), RunnerError> {
        let runners: Vec<_> = self.runners_map().drain().collect();
        for (model_id, runner) in runners {
            lock_runner(&model_id, &runner).close()?;
        }
        Ok(())
    }

    fn existing(&self, model_id: &str) -> Option<Arc<Mutex<ModelRunner>>> {
        self.runners_map().get(model_id).cloned()
    }

    fn runners_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<Mutex<ModelRunner>>>> {
        self.runners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A runner whose holder panicked may hold a half-updated model, so a
/// poisoned lock drops the loaded instance before handing the runner out.
fn lock_runner<'a>(model_id: &str, runner: &'a Mutex<ModelRunner>) -> std::sync::MutexGuard<'a, ModelRunner> {
    runner.lock().unwrap_or_else(|poisoned| {
        warn!(%model_id, "model runner lock poisoned, reloading from checkpoint");
        let mut guard = poisoned.into_inner();
        guard.discard();
        guard
    })
}
