//! The outermost training loop: drives iterations, builds a fresh
//! `StepContext` per step, and owns the policy for what happens when a step
//! fails. The orchestrator never decides skip-vs-abort itself.

use crate::hooks::HookRegistry;
use crate::step::{StepContext, TrainError, TrainStep};
use burn::optim::Optimizer;
use burn::tensor::backend::AutodiffBackend;
use models::BoundarySegNet;
use seg_dataset::{Normalizer, PrefetchLoader};

/// What the loop does when a step reports a numerical failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop training immediately.
    Abort,
    /// Skip the offending iteration, up to a budget of skips per run.
    Skip { max_skips: usize },
}

#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    pub iterations: usize,
    pub skipped: usize,
    pub avg_total_loss: f32,
    pub avg_seg_loss: f32,
    pub avg_boundary_loss: f32,
}

/// Iteration driver. Holds loop-level bookkeeping only; model, optimizer,
/// and hooks are borrowed per call.
pub struct TrainLoop {
    policy: FailurePolicy,
    iteration: usize,
    skipped: usize,
}

impl TrainLoop {
    pub fn new(policy: FailurePolicy) -> Self {
        Self {
            policy,
            iteration: 0,
            skipped: 0,
        }
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Drain the loader, running one step per batch.
    ///
    /// Data errors (shape mismatches, corrupted samples) always abort: they
    /// mean the supervision signal cannot be trusted. Numerical failures go
    /// through the configured policy.
    pub fn run_epoch<B, O>(
        &mut self,
        step: &mut TrainStep<B, O>,
        loader: &PrefetchLoader,
        normalizer: &Normalizer,
        device: &B::Device,
        hooks: &mut HookRegistry,
    ) -> Result<EpochStats, TrainError>
    where
        B: AutodiffBackend,
        O: Optimizer<BoundarySegNet<B>, B>,
    {
        let mut stats = EpochStats::default();
        let mut total = 0.0f32;
        let mut seg = 0.0f32;
        let mut boundary = 0.0f32;

        while let Some(batch) = loader.next_batch::<B>(normalizer, device)? {
            let mut ctx = StepContext {
                iteration: self.iteration,
                hooks: Some(hooks),
            };
            let result = step.run_step(&batch, &mut ctx);
            self.iteration += 1;

            match result {
                Ok(res) => {
                    stats.iterations += 1;
                    total += res.total_loss;
                    seg += res.seg_loss;
                    boundary += res.boundary_loss;
                }
                Err(e @ TrainError::Numerical { .. }) => match self.policy {
                    FailurePolicy::Abort => return Err(e),
                    FailurePolicy::Skip { max_skips } => {
                        self.skipped += 1;
                        stats.skipped += 1;
                        eprintln!("Warning: skipping iteration: {e}");
                        if self.skipped > max_skips {
                            return Err(TrainError::Numerical {
                                iteration: self.iteration - 1,
                                detail: format!(
                                    "exceeded skip budget of {max_skips} failed iterations"
                                ),
                            });
                        }
                    }
                },
                Err(e) => return Err(e),
            }
        }

        if stats.iterations > 0 {
            let n = stats.iterations as f32;
            stats.avg_total_loss = total / n;
            stats.avg_seg_loss = seg / n;
            stats.avg_boundary_loss = boundary / n;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_starts_at_iteration_zero() {
        let looper = TrainLoop::new(FailurePolicy::Abort);
        assert_eq!(looper.iteration(), 0);
    }
}
