//! The training step orchestrator.
//!
//! `run_step` owns the strict ordering contract of one iteration:
//! forward -> loss -> backward -> gradient capture -> optimizer update.
//! The snapshot is taken from the gradients returned by `backward()` before
//! `GradientsParams::from_grads` moves them into the optimizer step, so no
//! hook can ever observe cleared or half-updated gradients, and nothing can
//! clear gradients between capture and update.

use crate::hooks::{GradientSnapshot, HookRegistry};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use models::{masked_cross_entropy, BoundarySegNet};
use seg_dataset::{SegBatch, SegDatasetError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("numerical failure at iteration {iteration}: {detail}")]
    Numerical { iteration: usize, detail: String },
    #[error(transparent)]
    Data(#[from] SegDatasetError),
}

/// Relative weight of each loss term in the total.
#[derive(Debug, Clone, Copy)]
pub struct LossWeights {
    pub segmentation: f32,
    pub boundary: f32,
}

impl Default for LossWeights {
    fn default() -> Self {
        Self {
            segmentation: 1.0,
            boundary: 0.4,
        }
    }
}

impl LossWeights {
    pub fn validate(&self) -> Result<(), TrainError> {
        for (name, w) in [
            ("segmentation", self.segmentation),
            ("boundary", self.boundary),
        ] {
            if !w.is_finite() || w < 0.0 {
                return Err(TrainError::InvalidConfig(format!(
                    "{name} loss weight must be finite and non-negative, got {w}"
                )));
            }
        }
        if self.segmentation == 0.0 && self.boundary == 0.0 {
            return Err(TrainError::InvalidConfig(
                "at least one loss weight must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loop-level context for one step: the iteration index and a handle for
/// invoking externally registered hooks. Deliberately narrow; the orchestrator
/// never sees the driver that owns the loop.
pub struct StepContext<'a> {
    pub iteration: usize,
    pub hooks: Option<&'a mut HookRegistry>,
}

/// Scalar outcome of one training step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub total_loss: f32,
    pub seg_loss: f32,
    pub boundary_loss: f32,
    /// Non-fatal instrumentation failures from gradient hooks.
    pub hook_warnings: Vec<String>,
}

/// Owns the model and optimizer for the duration of training; exactly one
/// `run_step` may execute at a time since both are mutated in place.
pub struct TrainStep<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<BoundarySegNet<B>, B>,
{
    model: BoundarySegNet<B>,
    optim: O,
    weights: LossWeights,
    lr: f64,
    ignore_label: u8,
}

impl<B, O> TrainStep<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<BoundarySegNet<B>, B>,
{
    pub fn new(
        model: BoundarySegNet<B>,
        optim: O,
        weights: LossWeights,
        lr: f64,
        ignore_label: u8,
    ) -> Result<Self, TrainError> {
        weights.validate()?;
        if !lr.is_finite() || lr <= 0.0 {
            return Err(TrainError::InvalidConfig(format!(
                "learning rate must be positive and finite, got {lr}"
            )));
        }
        Ok(Self {
            model,
            optim,
            weights,
            lr,
            ignore_label,
        })
    }

    pub fn model(&self) -> &BoundarySegNet<B> {
        &self.model
    }

    pub fn into_model(self) -> BoundarySegNet<B> {
        self.model
    }

    /// Run one training iteration over `batch`.
    ///
    /// On a non-finite loss the step returns `Numerical` before any backward
    /// or optimizer work, leaving model and optimizer state untouched so the
    /// caller's failure policy decides what happens next.
    pub fn run_step(
        &mut self,
        batch: &SegBatch<B>,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult, TrainError> {
        let output = self.model.forward(batch.images.clone());

        let seg_loss = masked_cross_entropy(output.seg_logits, batch.labels.clone(), self.ignore_label);
        let boundary_loss = masked_cross_entropy(
            output.boundary_logits,
            batch.boundary.clone(),
            self.ignore_label,
        );
        let total = seg_loss.clone().mul_scalar(self.weights.segmentation)
            + boundary_loss.clone().mul_scalar(self.weights.boundary);

        let seg_val: f32 = seg_loss.into_scalar().elem();
        let boundary_val: f32 = boundary_loss.into_scalar().elem();
        let total_val: f32 = total.clone().into_scalar().elem();
        if !total_val.is_finite() {
            return Err(TrainError::Numerical {
                iteration: ctx.iteration,
                detail: format!(
                    "loss is not finite (total={total_val}, seg={seg_val}, boundary={boundary_val})"
                ),
            });
        }

        let grads = total.backward();

        // Gradient capture point: backward is complete, nothing has been
        // cleared. Hook failures become warnings; the update must still run.
        let mut hook_warnings = Vec::new();
        if let Some(hooks) = ctx.hooks.as_mut() {
            if !hooks.is_empty() {
                let snapshot = GradientSnapshot::capture::<B, _>(ctx.iteration, &self.model, &grads);
                hook_warnings = hooks.invoke(&snapshot);
                for warning in &hook_warnings {
                    eprintln!("Warning: iteration {}: {warning}", ctx.iteration);
                }
                if snapshot.has_non_finite() {
                    return Err(TrainError::Numerical {
                        iteration: ctx.iteration,
                        detail: format!(
                            "{} NaN gradient values detected",
                            snapshot.nan_total()
                        ),
                    });
                }
            }
        }

        // Moving `grads` here is what clears them: they are consumed into the
        // parameter update and dropped with it.
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optim.step(self.lr, self.model.clone(), grads);

        Ok(StepResult {
            total_loss: total_val,
            seg_loss: seg_val,
            boundary_loss: boundary_val,
            hook_warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_weight_is_invalid() {
        let w = LossWeights {
            segmentation: -1.0,
            boundary: 0.4,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn all_zero_weights_are_invalid() {
        let w = LossWeights {
            segmentation: 0.0,
            boundary: 0.0,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn default_weights_are_valid() {
        assert!(LossWeights::default().validate().is_ok());
    }
}
