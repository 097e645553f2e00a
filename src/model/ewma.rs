//! Built-in exponentially weighted predictor.
//!
//! Predicts the next value as the EWMA of past values and reports the
//! prediction error relative to the EWMA of past absolute errors, squashed
//! into `[0, 1]`. It learns online while learning is enabled.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::{EncodedRecord, InferenceArgs, Model, ModelFactory, ModelParams, ModelSnapshot};

pub const EWMA_KIND: &str = "ewma";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EwmaParams {
    /// Smoothing factor in `(0, 1]`.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Error, in mean absolute deviations, that maps to a raw score of 1.
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
}

fn default_alpha() -> f64 {
    0.1
}

fn default_sensitivity() -> f64 {
    4.0
}

impl Default for EwmaParams {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            sensitivity: default_sensitivity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EwmaModel {
    params: EwmaParams,
    predicted_field: Option<String>,
    learning: bool,
    mean: f64,
    mad: f64,
    seen: u64,
}

impl EwmaModel {
    pub fn new(params: EwmaParams) -> Result<Self> {
        if !(params.alpha > 0.0 && params.alpha <= 1.0) {
            anyhow::bail!("ewma alpha must be in (0, 1], got {}", params.alpha);
        }
        if params.sensitivity <= 0.0 {
            anyhow::bail!("ewma sensitivity must be positive, got {}", params.sensitivity);
        }
        Ok(Self {
            params,
            predicted_field: None,
            learning: false,
            mean: 0.0,
            mad: 0.0,
            seen: 0,
        })
    }

    fn learn(&mut self, value: f64) {
        let alpha = self.params.alpha;
        if self.seen == 0 {
            self.mean = value;
        } else {
            let err = (value - self.mean).abs();
            self.mad = if self.seen == 1 { err } else { alpha * err + (1.0 - alpha) * self.mad };
            self.mean = alpha * value + (1.0 - alpha) * self.mean;
        }
        self.seen += 1;
    }
}

impl Model for EwmaModel {
    fn enable_learning(&mut self) {
        self.learning = true;
    }

    fn enable_inference(&mut self, args: &InferenceArgs) {
        self.predicted_field = Some(args.predicted_field.clone());
    }

    fn infer(&mut self, record: &EncodedRecord) -> Result<f64> {
        let field = self
            .predicted_field
            .as_deref()
            .context("inference not enabled on model")?;
        let value = record.value(field).with_context(|| format!("record has no field '{}'", field))?;

        // Missing values carry no evidence either way.
        let Some(value) = value.as_f64() else {
            return Ok(0.0);
        };

        let raw = if self.seen < 2 {
            0.0
        } else {
            let scale = self.params.sensitivity * self.mad.max(f64::EPSILON);
            ((value - self.mean).abs() / scale).min(1.0)
        };

        if self.learning {
            self.learn(value);
        }
        Ok(raw)
    }

    fn snapshot(&self) -> Result<ModelSnapshot> {
        Ok(ModelSnapshot {
            kind: EWMA_KIND.to_string(),
            state: serde_json::to_value(self)?,
        })
    }
}

/// Factory for the models this crate ships.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinModelFactory;

impl ModelFactory for BuiltinModelFactory {
    fn create(&self, params: &ModelParams) -> Result<Box<dyn Model>> {
        match params {
            ModelParams::Ewma(p) => Ok(Box::new(EwmaModel::new(p.clone())?)),
        }
    }

    fn restore(&self, snapshot: &ModelSnapshot) -> Result<Box<dyn Model>> {
        match snapshot.kind.as_str() {
            EWMA_KIND => {
                let model: EwmaModel = serde_json::from_value(snapshot.state.clone())
                    .context("failed to restore ewma model snapshot")?;
                Ok(Box::new(model))
            }
            other => anyhow::bail!("unknown model kind '{}'", other),
        }
    }
}
