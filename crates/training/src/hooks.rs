//! Gradient capture: per-parameter statistics read after backpropagation and
//! before the optimizer consumes the gradients.
//!
//! Hooks receive an immutable `GradientSnapshot` — statistics are computed
//! once from the live gradients and copied out, so no hook can mutate what
//! the optimizer is about to apply. A failing hook is reported as a warning
//! and never stops training.

use burn::module::{AutodiffModule, ModuleVisitor, ParamId};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Summary statistics for one parameter's gradient.
#[derive(Debug, Clone, Serialize)]
pub struct GradientStat {
    pub param: String,
    pub shape: Vec<usize>,
    pub elements: usize,
    pub l2_norm: f32,
    pub abs_max: f32,
    pub nan_count: usize,
}

/// All gradient statistics for one iteration, captured at the point between
/// backward completion and the optimizer update.
#[derive(Debug, Clone, Serialize)]
pub struct GradientSnapshot {
    pub iteration: usize,
    pub stats: Vec<GradientStat>,
}

impl GradientSnapshot {
    /// Walk the model's parameters and summarize each one's gradient.
    /// Read-only: the gradients themselves are left untouched for the
    /// optimizer step that follows.
    pub fn capture<B, M>(iteration: usize, model: &M, grads: &B::Gradients) -> Self
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        struct GradVisitor<'a, B: AutodiffBackend> {
            grads: &'a B::Gradients,
            stats: Vec<GradientStat>,
        }

        impl<'a, B: AutodiffBackend> ModuleVisitor<B> for GradVisitor<'a, B> {
            fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
                let Some(grad) = tensor.grad(self.grads) else {
                    return;
                };
                let shape = grad.dims().to_vec();
                let elements = shape.iter().product();
                let sum_sq: f32 = grad.clone().powf_scalar(2.0).sum().into_scalar().elem();
                let abs_max: f32 = grad.clone().abs().max().into_scalar().elem();
                let nan_count: f32 = grad.is_nan().float().sum().into_scalar().elem();
                self.stats.push(GradientStat {
                    param: format!("{id:?}"),
                    shape,
                    elements,
                    l2_norm: sum_sq.sqrt(),
                    abs_max,
                    nan_count: nan_count as usize,
                });
            }
        }

        let mut visitor = GradVisitor::<B> {
            grads,
            stats: Vec::new(),
        };
        model.visit(&mut visitor);
        GradientSnapshot {
            iteration,
            stats: visitor.stats,
        }
    }

    /// Euclidean norm over all parameters' gradients.
    pub fn global_norm(&self) -> f32 {
        self.stats
            .iter()
            .map(|s| s.l2_norm * s.l2_norm)
            .sum::<f32>()
            .sqrt()
    }

    pub fn nan_total(&self) -> usize {
        self.stats.iter().map(|s| s.nan_count).sum()
    }

    pub fn has_non_finite(&self) -> bool {
        self.nan_total() > 0 || self.stats.iter().any(|s| !s.l2_norm.is_finite())
    }
}

/// A consumer of gradient snapshots, invoked once per iteration between
/// backpropagation and the optimizer update.
pub trait GradientHook: Send {
    fn name(&self) -> &str;
    fn on_gradients(&mut self, snapshot: &GradientSnapshot) -> anyhow::Result<()>;
}

/// Registered gradient hooks. Failures are collected as warnings; they never
/// propagate into the training step.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn GradientHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Box<dyn GradientHook>) {
        self.hooks.push(hook);
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Invoke every hook with the snapshot. Returns one warning message per
    /// failed hook.
    pub fn invoke(&mut self, snapshot: &GradientSnapshot) -> Vec<String> {
        let mut warnings = Vec::new();
        for hook in &mut self.hooks {
            if let Err(e) = hook.on_gradients(snapshot) {
                warnings.push(format!("hook {} failed: {e}", hook.name()));
            }
        }
        warnings
    }
}

/// Writes gradient-flow statistics as JSON lines, one snapshot per line,
/// every `interval` iterations.
pub struct GradFlowHook<W: Write + Send> {
    interval: usize,
    writer: W,
}

impl<W: Write + Send> GradFlowHook<W> {
    pub fn new(interval: usize, writer: W) -> Self {
        Self {
            interval: interval.max(1),
            writer,
        }
    }
}

impl GradFlowHook<std::io::BufWriter<std::fs::File>> {
    pub fn to_path(path: &Path, interval: usize) -> anyhow::Result<Self> {
        let file = std::fs::File::create(path)?;
        Ok(Self::new(interval, std::io::BufWriter::new(file)))
    }
}

impl<W: Write + Send> GradientHook for GradFlowHook<W> {
    fn name(&self) -> &str {
        "grad_flow"
    }

    fn on_gradients(&mut self, snapshot: &GradientSnapshot) -> anyhow::Result<()> {
        if snapshot.iteration % self.interval != 0 {
            return Ok(());
        }
        let line = serde_json::to_string(snapshot)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        Ok(())
    }
}
