//! Burn models for boundary-aware semantic segmentation.
//!
//! `BoundarySegNet` is a small fully-convolutional network with two task
//! heads: per-pixel class logits and per-pixel boundary logits. It is a pure
//! Burn Module with no awareness of the training loop; the `training` crate
//! wraps it into the step orchestrator.

use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::PaddingConfig2d;
use burn::tensor::activation::{log_softmax, relu};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

#[derive(Debug, Clone, Copy)]
pub struct BoundarySegNetConfig {
    pub channels: usize,
    pub num_classes: usize,
}

impl Default for BoundarySegNetConfig {
    fn default() -> Self {
        Self {
            channels: 32,
            num_classes: 19,
        }
    }
}

/// Predictions for one batch: both heads share the input's spatial shape.
#[derive(Debug, Clone)]
pub struct SegOutput<B: Backend> {
    /// [batch, num_classes, height, width]
    pub seg_logits: Tensor<B, 4>,
    /// [batch, 2, height, width] — boundary / not-boundary
    pub boundary_logits: Tensor<B, 4>,
}

#[derive(Debug, Module)]
pub struct BoundarySegNet<B: Backend> {
    stem: Conv2d<B>,
    block1: Conv2d<B>,
    block2: Conv2d<B>,
    seg_head: Conv2d<B>,
    boundary_head: Conv2d<B>,
    num_classes: usize,
}

impl<B: Backend> BoundarySegNet<B> {
    pub fn new(cfg: BoundarySegNetConfig, device: &B::Device) -> Self {
        let conv = |input, output| {
            Conv2dConfig::new([input, output], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };
        Self {
            stem: conv(3, cfg.channels),
            block1: conv(cfg.channels, cfg.channels),
            block2: conv(cfg.channels, cfg.channels),
            seg_head: conv(cfg.channels, cfg.num_classes),
            boundary_head: conv(cfg.channels, 2),
            num_classes: cfg.num_classes,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> SegOutput<B> {
        let x = relu(self.stem.forward(images));
        let x = relu(self.block1.forward(x));
        let x = relu(self.block2.forward(x));
        SegOutput {
            seg_logits: self.seg_head.forward(x.clone()),
            boundary_logits: self.boundary_head.forward(x),
        }
    }
}

/// Per-pixel cross entropy with an ignore label.
///
/// Pixels whose target equals `ignore_label` contribute nothing to either
/// the numerator or the averaging denominator; a batch of only ignore pixels
/// yields zero loss. Used for both heads so ignore semantics stay symmetric.
pub fn masked_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    targets: Tensor<B, 3, Int>,
    ignore_label: u8,
) -> Tensor<B, 1> {
    let [b, c, h, w] = logits.dims();
    let n = b * h * w;
    let log_probs = log_softmax(logits, 1)
        .permute([0, 2, 3, 1])
        .reshape([n, c]);
    let targets = targets.reshape([n, 1]);
    let mask = targets
        .clone()
        .not_equal_elem(ignore_label as i32)
        .float();
    // Ignore targets are out of class range; clamp before gather, the mask
    // already zeroes their contribution.
    let picked = log_probs.gather(1, targets.clamp(0, (c - 1) as i32));
    let denom = mask.clone().sum().clamp_min(1.0);
    -(picked * mask).sum() / denom
}
