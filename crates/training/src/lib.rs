//! Training core for boundary-aware segmentation.
//!
//! - `step`: the training step orchestrator and its ordering contract
//! - `hooks`: gradient capture between backpropagation and the optimizer
//! - `run`: the iteration driver and failure policy
//! - `util`: clap argument surface and end-to-end wiring

pub mod hooks;
pub mod run;
pub mod step;
pub mod util;

pub use hooks::{GradFlowHook, GradientHook, GradientSnapshot, GradientStat, HookRegistry};
pub use run::{EpochStats, FailurePolicy, TrainLoop};
pub use step::{LossWeights, StepContext, StepResult, TrainError, TrainStep};
pub use util::{run_train, ConnectivityKind, OnFailure, TrainArgs, TrainBackend};
