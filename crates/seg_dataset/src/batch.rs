//! Batch assembly: stacking samples into device-resident Burn tensors.

use crate::types::{Normalizer, SegDatasetError, SegDatasetResult, SegSample};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// One collated training batch. Sample order is preserved from the input
/// sequence so predictions can be correlated back to inputs.
#[derive(Debug, Clone)]
pub struct SegBatch<B: Backend> {
    /// Normalized images, [batch, 3, height, width].
    pub images: Tensor<B, 4>,
    /// Semantic class ids, [batch, height, width].
    pub labels: Tensor<B, 3, Int>,
    /// Boundary ground truth, [batch, height, width].
    pub boundary: Tensor<B, 3, Int>,
    /// Sample ids in batch order.
    pub sample_ids: Vec<u64>,
}

impl<B: Backend> SegBatch<B> {
    pub fn len(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sample_ids.is_empty()
    }
}

/// Collate an ordered sequence of samples into one batch.
///
/// Every sample must carry a boundary map and share spatial dimensions;
/// anything else is a `ShapeMismatch` for the whole batch rather than a
/// silently patched-up training signal.
pub fn collate<B: Backend>(
    samples: &[SegSample],
    normalizer: &Normalizer,
    device: &B::Device,
) -> SegDatasetResult<SegBatch<B>> {
    normalizer.validate()?;
    if samples.is_empty() {
        return Err(SegDatasetError::Other(
            "cannot collate empty batch".to_string(),
        ));
    }

    let (width, height) = (samples[0].width, samples[0].height);
    let plane = width as usize * height as usize;
    let batch = samples.len();

    let mut image_buf: Vec<f32> = Vec::with_capacity(batch * 3 * plane);
    let mut label_buf: Vec<i32> = Vec::with_capacity(batch * plane);
    let mut boundary_buf: Vec<i32> = Vec::with_capacity(batch * plane);
    let mut sample_ids = Vec::with_capacity(batch);

    for sample in samples {
        if (sample.width, sample.height) != (width, height) {
            return Err(SegDatasetError::ShapeMismatch(format!(
                "sample {} is {}x{} but batch is {}x{}",
                sample.id, sample.width, sample.height, width, height
            )));
        }
        if sample.labels.dimensions() != (width, height) {
            return Err(SegDatasetError::ShapeMismatch(format!(
                "sample {}: label map {}x{} does not match image {}x{}",
                sample.id,
                sample.labels.width(),
                sample.labels.height(),
                width,
                height
            )));
        }
        let boundary = sample.boundary.as_ref().ok_or_else(|| {
            SegDatasetError::ShapeMismatch(format!(
                "sample {} has no boundary map; run the pipeline's boundary stage first",
                sample.id
            ))
        })?;
        if boundary.dimensions() != (width, height) {
            return Err(SegDatasetError::ShapeMismatch(format!(
                "sample {}: boundary map {}x{} does not match image {}x{}",
                sample.id,
                boundary.width(),
                boundary.height(),
                width,
                height
            )));
        }
        if sample.image_chw.len() != 3 * plane {
            return Err(SegDatasetError::ShapeMismatch(format!(
                "sample {}: image buffer holds {} values, expected {}",
                sample.id,
                sample.image_chw.len(),
                3 * plane
            )));
        }

        for c in 0..3 {
            let mean = normalizer.mean[c];
            let std = normalizer.std[c];
            for &v in &sample.image_chw[c * plane..(c + 1) * plane] {
                image_buf.push((v - mean) / std);
            }
        }
        label_buf.extend(sample.labels.data().iter().map(|&v| v as i32));
        boundary_buf.extend(boundary.data().iter().map(|&v| v as i32));
        sample_ids.push(sample.id);
    }

    let image_shape = [batch, 3, height as usize, width as usize];
    let map_shape = [batch, height as usize, width as usize];

    let images = Tensor::<B, 1>::from_floats(image_buf.as_slice(), device).reshape(image_shape);
    let labels = Tensor::<B, 1, Int>::from_ints(label_buf.as_slice(), device).reshape(map_shape);
    let boundary =
        Tensor::<B, 1, Int>::from_ints(boundary_buf.as_slice(), device).reshape(map_shape);

    Ok(SegBatch {
        images,
        labels,
        boundary,
        sample_ids,
    })
}
