//! Ordering and isolation properties of the gradient-capture seam.

use burn::backend::{autodiff::Autodiff, ndarray::NdArray};
use burn::optim::AdamConfig;
use burn::tensor::{Int, Tensor};
use models::{masked_cross_entropy, BoundarySegNet, BoundarySegNetConfig};
use seg_dataset::{collate, synthesize_boundary, BoundaryConfig, LabelMap, Normalizer, SegBatch, SegSample};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use training::{
    GradientHook, GradientSnapshot, HookRegistry, LossWeights, StepContext, TrainError, TrainStep,
};

type B = NdArray<f32>;
type AD = Autodiff<B>;

fn quadrant_sample(id: u64) -> SegSample {
    let labels = LabelMap::new(
        4,
        4,
        vec![
            0, 0, 1, 1, //
            0, 0, 1, 1, //
            2, 2, 3, 3, //
            2, 2, 3, 3,
        ],
    )
    .unwrap();
    let boundary = synthesize_boundary(
        &labels,
        &BoundaryConfig {
            width: 1,
            ..Default::default()
        },
    )
    .unwrap();
    let image_chw: Vec<f32> = (0..4 * 4 * 3)
        .map(|i| ((i as f32) + id as f32) / 48.0)
        .collect();
    SegSample {
        id,
        image_chw,
        width: 4,
        height: 4,
        labels,
        boundary: Some(boundary),
    }
}

fn train_batch(device: &<AD as burn::tensor::backend::Backend>::Device) -> SegBatch<AD> {
    let samples = vec![quadrant_sample(0), quadrant_sample(1)];
    collate::<AD>(&samples, &Normalizer::default(), device).unwrap()
}

fn model(device: &<AD as burn::tensor::backend::Backend>::Device) -> BoundarySegNet<AD> {
    BoundarySegNet::new(
        BoundarySegNetConfig {
            channels: 4,
            num_classes: 4,
        },
        device,
    )
}

fn probe_logits(
    model: &BoundarySegNet<AD>,
    device: &<AD as burn::tensor::backend::Backend>::Device,
) -> Vec<f32> {
    let probe = Tensor::<AD, 4>::ones([1, 3, 4, 4], device);
    model
        .forward(probe)
        .seg_logits
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

struct CountingHook {
    count: Arc<AtomicUsize>,
    norms: Arc<Mutex<Vec<f32>>>,
}

impl GradientHook for CountingHook {
    fn name(&self) -> &str {
        "counting"
    }
    fn on_gradients(&mut self, snapshot: &GradientSnapshot) -> anyhow::Result<()> {
        // Gradients must already be populated when the hook fires.
        assert!(!snapshot.stats.is_empty());
        assert!(snapshot.stats.iter().all(|s| s.elements > 0));
        self.count.fetch_add(1, Ordering::SeqCst);
        self.norms.lock().unwrap().push(snapshot.global_norm());
        Ok(())
    }
}

struct FailingHook;

impl GradientHook for FailingHook {
    fn name(&self) -> &str {
        "failing"
    }
    fn on_gradients(&mut self, _snapshot: &GradientSnapshot) -> anyhow::Result<()> {
        anyhow::bail!("instrumentation exploded")
    }
}

#[test]
fn snapshot_covers_every_parameter() {
    let device = Default::default();
    let batch = train_batch(&device);
    let model = model(&device);

    let output = model.forward(batch.images.clone());
    let loss = masked_cross_entropy(output.seg_logits, batch.labels.clone(), 255)
        + masked_cross_entropy(output.boundary_logits, batch.boundary.clone(), 255);
    let grads = loss.backward();

    let snapshot = GradientSnapshot::capture::<AD, _>(4, &model, &grads);
    assert_eq!(snapshot.iteration, 4);
    // Five convs, each with a weight and a bias.
    assert_eq!(snapshot.stats.len(), 10);
    for stat in &snapshot.stats {
        assert!(!stat.param.is_empty());
        assert_eq!(stat.shape.iter().product::<usize>(), stat.elements);
        assert!(stat.elements > 0);
        assert!(stat.l2_norm.is_finite());
        assert!(stat.abs_max.is_finite());
        assert_eq!(stat.nan_count, 0);
    }
    assert!(snapshot.global_norm() > 0.0);
}

#[test]
fn hook_fires_exactly_once_per_iteration() {
    let device = Default::default();
    let batch = train_batch(&device);
    let mut step = TrainStep::new(
        model(&device),
        AdamConfig::new().init(),
        LossWeights::default(),
        1e-3,
        255,
    )
    .unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let norms = Arc::new(Mutex::new(Vec::new()));
    let mut hooks = HookRegistry::new();
    hooks.register(Box::new(CountingHook {
        count: count.clone(),
        norms: norms.clone(),
    }));

    for iteration in 0..3 {
        let mut ctx = StepContext {
            iteration,
            hooks: Some(&mut hooks),
        };
        let result = step.run_step(&batch, &mut ctx).unwrap();
        assert!(result.total_loss.is_finite());
        assert!(result.hook_warnings.is_empty());
    }

    // Exactly once per iteration: never zero, never twice.
    assert_eq!(count.load(Ordering::SeqCst), 3);
    let norms = norms.lock().unwrap();
    assert_eq!(norms.len(), 3);
    for norm in norms.iter() {
        assert!(norm.is_finite());
        assert!(*norm > 0.0, "gradients were populated at capture time");
    }
}

#[test]
fn failing_hook_does_not_block_the_update_or_change_parameters() {
    let device = Default::default();
    let batch = train_batch(&device);
    let initial = model(&device);
    let before = probe_logits(&initial, &device);

    // Two identical runs from the same initial parameters; one run carries a
    // hook that always fails.
    let mut clean = TrainStep::new(
        initial.clone(),
        AdamConfig::new().init(),
        LossWeights::default(),
        1e-3,
        255,
    )
    .unwrap();
    let mut hooked = TrainStep::new(
        initial,
        AdamConfig::new().init(),
        LossWeights::default(),
        1e-3,
        255,
    )
    .unwrap();

    let mut registry = HookRegistry::new();
    registry.register(Box::new(FailingHook));

    for iteration in 0..2 {
        let mut clean_ctx = StepContext {
            iteration,
            hooks: None,
        };
        clean.run_step(&batch, &mut clean_ctx).unwrap();

        let mut hooked_ctx = StepContext {
            iteration,
            hooks: Some(&mut registry),
        };
        let result = hooked.run_step(&batch, &mut hooked_ctx).unwrap();
        assert_eq!(result.hook_warnings.len(), 1);
        assert!(result.hook_warnings[0].contains("failing"));
    }

    let clean_out = probe_logits(clean.model(), &device);
    let hooked_out = probe_logits(hooked.model(), &device);
    // The optimizer ran in both cases and produced identical parameters.
    assert_eq!(clean_out, hooked_out);
    assert_ne!(clean_out, before, "parameters were actually updated");
}

#[test]
fn non_finite_loss_leaves_parameters_untouched() {
    let device = Default::default();
    let mut step = TrainStep::new(
        model(&device),
        AdamConfig::new().init(),
        LossWeights::default(),
        1e-3,
        255,
    )
    .unwrap();
    let before = probe_logits(step.model(), &device);

    let nan_batch = SegBatch::<AD> {
        images: Tensor::<AD, 4>::full([1, 3, 4, 4], f32::NAN, &device),
        labels: Tensor::<AD, 3, Int>::zeros([1, 4, 4], &device),
        boundary: Tensor::<AD, 3, Int>::zeros([1, 4, 4], &device),
        sample_ids: vec![0],
    };
    let mut ctx = StepContext {
        iteration: 7,
        hooks: None,
    };
    let err = step.run_step(&nan_batch, &mut ctx).unwrap_err();
    assert!(matches!(err, TrainError::Numerical { iteration: 7, .. }));

    let after = probe_logits(step.model(), &device);
    assert_eq!(before, after, "aborted step must not mutate parameters");
}

#[test]
fn invalid_loss_weights_are_rejected_at_construction() {
    let device = Default::default();
    let result = TrainStep::new(
        model(&device),
        AdamConfig::new().init(),
        LossWeights {
            segmentation: f32::NAN,
            boundary: 1.0,
        },
        1e-3,
        255,
    );
    assert!(matches!(result, Err(TrainError::InvalidConfig(_))));
}
