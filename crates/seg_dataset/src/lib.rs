//! Segmentation dataset utilities with on-the-fly boundary ground truth.
//!
//! This crate provides:
//! - Label map and sample types shared across the training stack
//! - Boundary ground-truth synthesis from semantic label maps
//! - A per-sample augmentation pipeline that keeps image, labels, and
//!   boundary spatially aligned
//! - Burn-compatible batch collation with per-channel normalization
//! - A bounded-queue prefetching loader

pub mod aug;
pub mod boundary;
pub mod source;
pub mod types;

#[cfg(feature = "burn-runtime")]
pub mod batch;
#[cfg(feature = "burn-runtime")]
pub mod loader;

pub use aug::{SegPipelineBuilder, SegPipelineConfig, SegTransformPipeline};
pub use boundary::{synthesize_boundary, BoundaryConfig, Connectivity};
pub use source::{split_indices, DirectorySource, InMemorySource, RawSample, SampleSource};
pub use types::*;

#[cfg(feature = "burn-runtime")]
pub use batch::{collate, SegBatch};
#[cfg(feature = "burn-runtime")]
pub use loader::{LoaderConfig, PrefetchLoader};
