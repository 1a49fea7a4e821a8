//! CLI argument surface and end-to-end wiring for the train binary.

use crate::hooks::{GradFlowHook, HookRegistry};
use crate::run::{FailurePolicy, TrainLoop};
use crate::step::{LossWeights, TrainStep};
use burn::backend::autodiff::Autodiff;
use burn::module::Module;
use burn::optim::AdamConfig;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use clap::{Parser, ValueEnum};
use models::{masked_cross_entropy, BoundarySegNet, BoundarySegNetConfig};
use seg_dataset::{
    split_indices, BoundaryConfig, Connectivity, DirectorySource, LoaderConfig, Normalizer,
    PrefetchLoader, SampleSource, SegPipelineBuilder, SegTransformPipeline,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Backend used for training (NdArray; autodiff wrapped on top).
pub type TrainBackend = burn::backend::ndarray::NdArray<f32>;
type ADBackend = Autodiff<TrainBackend>;

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum ConnectivityKind {
    Four,
    Eight,
}

impl From<ConnectivityKind> for Connectivity {
    fn from(kind: ConnectivityKind) -> Self {
        match kind {
            ConnectivityKind::Four => Connectivity::Four,
            ConnectivityKind::Eight => Connectivity::Eight,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum OnFailure {
    /// Abort the run on a numerical failure.
    Abort,
    /// Skip the failed iteration, bounded by --max-skips.
    Skip,
}

#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train BoundarySegNet with on-the-fly boundary ground truth"
)]
pub struct TrainArgs {
    /// Dataset root containing images/ and labels/ subdirectories.
    #[arg(long)]
    pub dataset_root: String,
    /// Fraction of samples held out for validation.
    #[arg(long, default_value_t = 0.1)]
    pub val_ratio: f32,
    /// Number of epochs.
    #[arg(long, default_value_t = 10)]
    pub epochs: usize,
    /// Batch size.
    #[arg(long, default_value_t = 4)]
    pub batch_size: usize,
    /// Learning rate.
    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,
    /// Resize samples to this square size before cropping.
    #[arg(long)]
    pub target_size: Option<u32>,
    /// Random square crop applied after resize (training only).
    #[arg(long)]
    pub crop_size: Option<u32>,
    /// Probability of a horizontal flip (training only).
    #[arg(long, default_value_t = 0.5)]
    pub flip_prob: f32,
    /// Probability of brightness/contrast jitter (training only).
    #[arg(long, default_value_t = 0.0)]
    pub color_jitter_prob: f32,
    /// Jitter strength.
    #[arg(long, default_value_t = 0.1)]
    pub color_jitter_strength: f32,
    /// Number of semantic classes.
    #[arg(long, default_value_t = 19)]
    pub num_classes: usize,
    /// Stem/backbone channel width.
    #[arg(long, default_value_t = 32)]
    pub channels: usize,
    /// Boundary neighborhood radius, at full input resolution.
    #[arg(long, default_value_t = 2)]
    pub boundary_width: u32,
    /// Class id treated as unlabeled/void.
    #[arg(long, default_value_t = 255)]
    pub ignore_label: u8,
    /// Neighborhood shape for boundary synthesis.
    #[arg(long, value_enum, default_value_t = ConnectivityKind::Eight)]
    pub connectivity: ConnectivityKind,
    /// Loss weight for the segmentation head.
    #[arg(long, default_value_t = 1.0)]
    pub seg_loss_weight: f32,
    /// Loss weight for the boundary head.
    #[arg(long, default_value_t = 0.4)]
    pub boundary_loss_weight: f32,
    /// Per-channel normalization mean (comma separated, 3 values).
    #[arg(long, value_delimiter = ',', num_args = 3)]
    pub norm_mean: Option<Vec<f32>>,
    /// Per-channel normalization std (comma separated, 3 values).
    #[arg(long, value_delimiter = ',', num_args = 3)]
    pub norm_std: Option<Vec<f32>>,
    /// Write gradient-flow statistics (JSON lines) to this path.
    #[arg(long)]
    pub grad_trace: Option<String>,
    /// Capture gradient statistics every N iterations.
    #[arg(long, default_value_t = 100)]
    pub grad_flow_interval: usize,
    /// What to do when a step hits a numerical failure.
    #[arg(long, value_enum, default_value_t = OnFailure::Abort)]
    pub on_failure: OnFailure,
    /// Skip budget when --on-failure skip is active.
    #[arg(long, default_value_t = 10)]
    pub max_skips: usize,
    /// Seed for reproducible shuffling and augmentation.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Number of prefetched batches held by the loader queue.
    #[arg(long, default_value_t = 2)]
    pub prefetch: usize,
    /// Checkpoint output path.
    #[arg(long)]
    pub checkpoint_out: Option<String>,
}

impl TrainArgs {
    fn normalizer(&self) -> anyhow::Result<Normalizer> {
        let mut normalizer = Normalizer::default();
        if let Some(mean) = &self.norm_mean {
            normalizer.mean = [mean[0], mean[1], mean[2]];
        }
        if let Some(std) = &self.norm_std {
            normalizer.std = [std[0], std[1], std[2]];
        }
        normalizer.validate()?;
        Ok(normalizer)
    }

    fn boundary(&self) -> BoundaryConfig {
        BoundaryConfig {
            width: self.boundary_width,
            ignore_label: self.ignore_label,
            connectivity: self.connectivity.into(),
        }
    }

    fn train_pipeline(&self) -> anyhow::Result<SegTransformPipeline> {
        Ok(SegPipelineBuilder::new()
            .target_size(self.target_size.map(|s| (s, s)))
            .crop_size(self.crop_size.map(|s| (s, s)))
            .flip_horizontal_prob(self.flip_prob)
            .color_jitter(self.color_jitter_prob, self.color_jitter_strength)
            .boundary(self.boundary())
            .seed(self.seed)
            .build()?)
    }

    /// Validation pipeline: no augmentation, resized straight to the training
    /// output size so batch shapes line up.
    fn val_pipeline(&self) -> anyhow::Result<SegTransformPipeline> {
        let out_size = self.crop_size.or(self.target_size);
        Ok(SegPipelineBuilder::new()
            .target_size(out_size.map(|s| (s, s)))
            .boundary(self.boundary())
            .seed(self.seed)
            .build()?)
    }
}

pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let normalizer = args.normalizer()?;
    let weights = LossWeights {
        segmentation: args.seg_loss_weight,
        boundary: args.boundary_loss_weight,
    };

    let root = Path::new(&args.dataset_root);
    let source = Arc::new(DirectorySource::index(root)?);
    if source.is_empty() {
        anyhow::bail!("no samples found under {}", root.display());
    }
    let (train_idx, val_idx) = split_indices(source.len(), args.val_ratio, args.seed);
    if train_idx.is_empty() {
        anyhow::bail!("val split of {} left no training samples", args.val_ratio);
    }

    let train_pipeline = args.train_pipeline()?;
    let val_pipeline = args.val_pipeline()?;

    let device = <ADBackend as burn::tensor::backend::Backend>::Device::default();
    let model = BoundarySegNet::<ADBackend>::new(
        BoundarySegNetConfig {
            channels: args.channels,
            num_classes: args.num_classes,
        },
        &device,
    );
    let optim = AdamConfig::new().init();
    let mut step = TrainStep::new(model, optim, weights, args.lr, args.ignore_label)?;

    let mut hooks = HookRegistry::new();
    if let Some(path) = &args.grad_trace {
        hooks.register(Box::new(GradFlowHook::to_path(
            Path::new(path),
            args.grad_flow_interval,
        )?));
    }

    let policy = match args.on_failure {
        OnFailure::Abort => FailurePolicy::Abort,
        OnFailure::Skip => FailurePolicy::Skip {
            max_skips: args.max_skips,
        },
    };
    let mut looper = TrainLoop::new(policy);

    for epoch in 0..args.epochs {
        let loader = PrefetchLoader::spawn(
            source.clone(),
            train_pipeline.clone(),
            train_idx.clone(),
            LoaderConfig {
                batch_size: args.batch_size,
                shuffle: true,
                seed: args.seed.map(|s| s.wrapping_add(epoch as u64)),
                drop_last: false,
                prefetch: args.prefetch,
            },
        );
        let stats = looper.run_epoch(&mut step, &loader, &normalizer, &device, &mut hooks)?;
        println!(
            "epoch {epoch}: avg loss {:.4} (seg {:.4}, boundary {:.4}), {} iterations, {} skipped",
            stats.avg_total_loss,
            stats.avg_seg_loss,
            stats.avg_boundary_loss,
            stats.iterations,
            stats.skipped
        );

        if !val_idx.is_empty() {
            let val_loader = PrefetchLoader::spawn(
                source.clone(),
                val_pipeline.clone(),
                val_idx.clone(),
                LoaderConfig {
                    batch_size: args.batch_size,
                    shuffle: false,
                    seed: None,
                    drop_last: false,
                    prefetch: args.prefetch,
                },
            );
            let val_loss = eval_loss(
                step.model(),
                &val_loader,
                &normalizer,
                &device,
                weights,
                args.ignore_label,
            )?;
            println!("epoch {epoch}: val loss {val_loss:.4}");
        }
    }

    if let Some(ckpt) = &args.checkpoint_out {
        let path = Path::new(ckpt);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        step.into_model()
            .save_file(path, &recorder)
            .map_err(|e| anyhow::anyhow!("failed to save checkpoint: {e}"))?;
        println!("Saved checkpoint to {ckpt}");
    }

    Ok(())
}

/// Weighted loss over a validation loader, no gradients involved.
fn eval_loss(
    model: &BoundarySegNet<ADBackend>,
    loader: &PrefetchLoader,
    normalizer: &Normalizer,
    device: &<TrainBackend as burn::tensor::backend::Backend>::Device,
    weights: LossWeights,
    ignore_label: u8,
) -> anyhow::Result<f32> {
    use burn::module::AutodiffModule;
    use burn::tensor::ElementConversion;

    let model = model.valid();
    let mut total = 0.0f32;
    let mut batches = 0usize;
    while let Some(batch) = loader.next_batch::<TrainBackend>(normalizer, device)? {
        let output = model.forward(batch.images);
        let seg: f32 = masked_cross_entropy(output.seg_logits, batch.labels, ignore_label)
            .into_scalar()
            .elem();
        let boundary: f32 =
            masked_cross_entropy(output.boundary_logits, batch.boundary, ignore_label)
                .into_scalar()
                .elem();
        total += seg * weights.segmentation + boundary * weights.boundary;
        batches += 1;
    }
    Ok(if batches == 0 {
        0.0
    } else {
        total / batches as f32
    })
}
