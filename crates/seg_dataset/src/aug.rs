//! Per-sample transform pipeline with on-the-fly boundary ground truth.
//!
//! Geometric transforms (resize, crop, flip) are applied identically to the
//! image and the label map; photometric transforms touch the image only.
//! Boundary synthesis runs last, after every geometric op, so the boundary
//! map is always spatially consistent with the final label map.

use crate::boundary::{synthesize_boundary, BoundaryConfig};
use crate::types::{LabelMap, SegDatasetError, SegDatasetResult, SegSample};
use image::imageops::FilterType;
use image::RgbImage;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
pub struct SegPipelineConfig {
    /// Resize all samples to this (width, height). If None, samples must
    /// already share shape for batching to succeed.
    pub target_size: Option<(u32, u32)>,
    /// Fixed-size random crop applied after resize, (width, height).
    pub crop_size: Option<(u32, u32)>,
    /// Probability of a horizontal flip.
    pub flip_horizontal_prob: f32,
    /// Probability of a light brightness/contrast jitter (image only).
    pub color_jitter_prob: f32,
    /// Max jitter scale for brightness/contrast.
    pub color_jitter_strength: f32,
    /// Boundary synthesis settings; runs after all geometric transforms.
    pub boundary: BoundaryConfig,
    /// Seed for reproducible per-sample augmentation.
    pub seed: Option<u64>,
}

impl Default for SegPipelineConfig {
    fn default() -> Self {
        Self {
            target_size: Some((512, 512)),
            crop_size: None,
            flip_horizontal_prob: 0.0,
            color_jitter_prob: 0.0,
            color_jitter_strength: 0.1,
            boundary: BoundaryConfig::default(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SegTransformPipeline {
    target_size: Option<(u32, u32)>,
    crop_size: Option<(u32, u32)>,
    flip_horizontal_prob: f32,
    color_jitter_prob: f32,
    color_jitter_strength: f32,
    boundary: BoundaryConfig,
    seed: Option<u64>,
}

impl SegTransformPipeline {
    pub fn from_config(cfg: &SegPipelineConfig) -> SegDatasetResult<Self> {
        cfg.boundary.validate()?;
        if let (Some((tw, th)), Some((cw, ch))) = (cfg.target_size, cfg.crop_size) {
            if cw > tw || ch > th {
                return Err(SegDatasetError::InvalidConfig(format!(
                    "crop size {cw}x{ch} exceeds target size {tw}x{th}"
                )));
            }
        }
        Ok(Self {
            target_size: cfg.target_size,
            crop_size: cfg.crop_size,
            flip_horizontal_prob: cfg.flip_horizontal_prob,
            color_jitter_prob: cfg.color_jitter_prob,
            color_jitter_strength: cfg.color_jitter_strength,
            boundary: cfg.boundary,
            seed: cfg.seed,
        })
    }

    pub fn boundary_config(&self) -> &BoundaryConfig {
        &self.boundary
    }

    /// Run the full pipeline for one sample.
    pub fn apply(&self, id: u64, img: RgbImage, labels: LabelMap) -> SegDatasetResult<SegSample> {
        let (iw, ih) = img.dimensions();
        if (iw, ih) != labels.dimensions() {
            return Err(SegDatasetError::ShapeMismatch(format!(
                "sample {id}: image is {iw}x{ih} but label map is {}x{}",
                labels.width(),
                labels.height()
            )));
        }

        // Per-sample deterministic RNG when seeded, thread-local otherwise.
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.seed {
            seeded_rng = rand::rngs::StdRng::seed_from_u64(seed ^ id);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let mut img = img;
        let mut labels = labels;

        if let Some((w, h)) = self.target_size {
            if (w, h) != img.dimensions() {
                img = image::imageops::resize(&img, w, h, FilterType::Triangle);
                labels = labels.resize_nearest(w, h);
            }
        }

        if let Some((cw, ch)) = self.crop_size {
            let (w, h) = img.dimensions();
            if cw > w || ch > h {
                return Err(SegDatasetError::ShapeMismatch(format!(
                    "sample {id}: crop {cw}x{ch} exceeds sample {w}x{h}"
                )));
            }
            let x0 = if w > cw { rng.random_range(0..=w - cw) } else { 0 };
            let y0 = if h > ch { rng.random_range(0..=h - ch) } else { 0 };
            img = image::imageops::crop_imm(&img, x0, y0, cw, ch).to_image();
            labels = labels.crop(x0, y0, cw, ch)?;
        }

        maybe_hflip(&mut img, &mut labels, self.flip_horizontal_prob, rng);
        maybe_jitter(
            &mut img,
            self.color_jitter_prob,
            self.color_jitter_strength,
            rng,
        );

        // OTFGT: derive the boundary map from the final label map. The label
        // map itself is left untouched.
        let boundary = synthesize_boundary(&labels, &self.boundary)?;

        build_sample(id, img, labels, Some(boundary))
    }
}

#[derive(Debug, Clone, Default)]
pub struct SegPipelineBuilder {
    cfg: SegPipelineConfig,
}

impl SegPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn target_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.cfg.target_size = size;
        self
    }
    pub fn crop_size(mut self, size: Option<(u32, u32)>) -> Self {
        self.cfg.crop_size = size;
        self
    }
    pub fn flip_horizontal_prob(mut self, p: f32) -> Self {
        self.cfg.flip_horizontal_prob = p;
        self
    }
    pub fn color_jitter(mut self, prob: f32, strength: f32) -> Self {
        self.cfg.color_jitter_prob = prob;
        self.cfg.color_jitter_strength = strength;
        self
    }
    pub fn boundary(mut self, boundary: BoundaryConfig) -> Self {
        self.cfg.boundary = boundary;
        self
    }
    pub fn seed(mut self, seed: Option<u64>) -> Self {
        self.cfg.seed = seed;
        self
    }
    pub fn build(self) -> SegDatasetResult<SegTransformPipeline> {
        SegTransformPipeline::from_config(&self.cfg)
    }
}

fn build_sample(
    id: u64,
    img: RgbImage,
    labels: LabelMap,
    boundary: Option<LabelMap>,
) -> SegDatasetResult<SegSample> {
    let (width, height) = img.dimensions();
    let plane = (width * height) as usize;
    let mut image_chw = vec![0.0f32; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let base = (y * width + x) as usize;
        image_chw[base] = pixel[0] as f32 / 255.0;
        image_chw[plane + base] = pixel[1] as f32 / 255.0;
        image_chw[2 * plane + base] = pixel[2] as f32 / 255.0;
    }
    Ok(SegSample {
        id,
        image_chw,
        width,
        height,
        labels,
        boundary,
    })
}

pub(crate) fn maybe_hflip(
    img: &mut RgbImage,
    labels: &mut LabelMap,
    prob: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        image::imageops::flip_horizontal_in_place(img);
        labels.flip_horizontal();
    }
}

pub(crate) fn maybe_jitter(
    img: &mut RgbImage,
    prob: f32,
    strength: f32,
    rng: &mut dyn rand::RngCore,
) {
    if prob <= 0.0 || strength <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) >= prob {
        return;
    }
    // One affine remap per channel value: contrast about mid-gray plus an
    // additive brightness shift, precomputed as a lookup table.
    let contrast = 1.0 + rng.random_range(-strength..strength);
    let shift = rng.random_range(-strength..strength) * 255.0;
    let mut lut = [0u8; 256];
    for (v, slot) in lut.iter_mut().enumerate() {
        let remapped = (v as f32 - 127.5) * contrast + 127.5 + shift;
        *slot = remapped.clamp(0.0, 255.0) as u8;
    }
    for pixel in img.pixels_mut() {
        for c in 0..3 {
            pixel[c] = lut[pixel[c] as usize];
        }
    }
}

#[cfg(test)]
mod aug_tests {
    use super::*;
    use crate::boundary::Connectivity;

    fn checker_labels(w: u32, h: u32) -> LabelMap {
        let mut data = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let col = if x < w / 2 { 0 } else { 1 };
                let row = if y < h / 2 { 0 } else { 2 };
                data.push(col + row);
            }
        }
        LabelMap::new(w, h, data).unwrap()
    }

    #[test]
    fn hflip_keeps_labels_aligned_with_image() {
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(0, 0, image::Rgb([255, 0, 0]));
        let mut labels = LabelMap::new(4, 2, vec![9, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        maybe_hflip(&mut img, &mut labels, 1.0, &mut rng);
        assert_eq!(img.get_pixel(3, 0)[0], 255);
        assert_eq!(labels.get(3, 0), 9);
    }

    #[test]
    fn jitter_is_deterministic_and_skipped_at_zero_prob() {
        let base = RgbImage::from_pixel(4, 4, image::Rgb([10, 128, 250]));

        let mut untouched = base.clone();
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        maybe_jitter(&mut untouched, 0.0, 0.3, &mut rng);
        assert_eq!(untouched, base);

        let mut a = base.clone();
        let mut b = base.clone();
        let mut rng_a = rand::rngs::StdRng::seed_from_u64(9);
        let mut rng_b = rand::rngs::StdRng::seed_from_u64(9);
        maybe_jitter(&mut a, 1.0, 0.3, &mut rng_a);
        maybe_jitter(&mut b, 1.0, 0.3, &mut rng_b);
        assert_eq!(a, b);
    }

    #[test]
    fn jitter_remap_preserves_channel_ordering() {
        // Contrast stays positive for strength < 1, so the remap is
        // monotonic: a darker input channel can never come out brighter
        // than a lighter one.
        let mut img = RgbImage::from_pixel(1, 1, image::Rgb([20, 128, 240]));
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        maybe_jitter(&mut img, 1.0, 0.5, &mut rng);
        let p = img.get_pixel(0, 0);
        assert!(p[0] <= p[1] && p[1] <= p[2]);
    }

    #[test]
    fn boundary_after_flip_equals_flipped_boundary() {
        // Flip is label-preserving, so performing synthesis after the flip
        // must agree exactly with flipping a pre-synthesized boundary map.
        let labels = checker_labels(8, 8);
        let cfg = BoundaryConfig {
            width: 1,
            ignore_label: 255,
            connectivity: Connectivity::Eight,
        };

        let mut pre = synthesize_boundary(&labels, &cfg).unwrap();
        pre.flip_horizontal();

        let mut flipped = labels.clone();
        flipped.flip_horizontal();
        let post = synthesize_boundary(&flipped, &cfg).unwrap();

        assert_eq!(pre, post);
    }

    #[test]
    fn boundary_after_crop_matches_crop_interior() {
        // Away from the crop edges (further than the boundary width), cropping
        // then synthesizing agrees with synthesizing then cropping.
        let labels = checker_labels(12, 12);
        let cfg = BoundaryConfig {
            width: 1,
            ignore_label: 255,
            connectivity: Connectivity::Eight,
        };
        let full = synthesize_boundary(&labels, &cfg).unwrap();
        let cropped_full = full.crop(2, 2, 8, 8).unwrap();

        let cropped_labels = labels.crop(2, 2, 8, 8).unwrap();
        let cropped_then_synth = synthesize_boundary(&cropped_labels, &cfg).unwrap();

        for y in 1..7 {
            for x in 1..7 {
                assert_eq!(
                    cropped_full.get(x, y),
                    cropped_then_synth.get(x, y),
                    "interior pixel ({x},{y})"
                );
            }
        }
    }

    #[test]
    fn pipeline_attaches_boundary_of_matching_shape() {
        let img = RgbImage::new(16, 16);
        let labels = checker_labels(16, 16);
        let pipeline = SegPipelineBuilder::new()
            .target_size(Some((8, 8)))
            .seed(Some(7))
            .build()
            .unwrap();
        let sample = pipeline.apply(1, img, labels).unwrap();
        assert_eq!((sample.width, sample.height), (8, 8));
        let boundary = sample.boundary.expect("boundary attached");
        assert_eq!(boundary.dimensions(), sample.labels.dimensions());
    }

    #[test]
    fn pipeline_is_deterministic_given_seed() {
        let pipeline = SegPipelineBuilder::new()
            .target_size(Some((16, 16)))
            .crop_size(Some((8, 8)))
            .flip_horizontal_prob(0.5)
            .seed(Some(42))
            .build()
            .unwrap();
        let img = RgbImage::new(16, 16);
        let labels = checker_labels(16, 16);
        let a = pipeline.apply(3, img.clone(), labels.clone()).unwrap();
        let b = pipeline.apply(3, img, labels).unwrap();
        assert_eq!(a.labels, b.labels);
        assert_eq!(a.boundary, b.boundary);
        assert_eq!(a.image_chw, b.image_chw);
    }

    #[test]
    fn mismatched_image_and_labels_are_rejected() {
        let pipeline = SegPipelineBuilder::new().build().unwrap();
        let img = RgbImage::new(8, 8);
        let labels = LabelMap::filled(4, 4, 0);
        assert!(matches!(
            pipeline.apply(0, img, labels),
            Err(SegDatasetError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn oversized_crop_is_invalid() {
        let result = SegPipelineBuilder::new()
            .target_size(Some((8, 8)))
            .crop_size(Some((16, 16)))
            .build();
        assert!(matches!(result, Err(SegDatasetError::InvalidConfig(_))));
    }
}
