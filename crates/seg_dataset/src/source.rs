//! Sample sources: where raw (image, label map) pairs come from.
//!
//! The dataset core does not define storage; it consumes anything that can
//! hand back a raw sample per index. A directory-backed source is provided
//! for PNG images with grayscale PNG label maps, plus an in-memory source
//! for tests and synthetic data.

use crate::types::{LabelMap, SegDatasetError, SegDatasetResult};
use image::RgbImage;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::{Path, PathBuf};

/// A raw sample before augmentation and boundary synthesis.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub id: u64,
    pub image: RgbImage,
    pub labels: LabelMap,
}

pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn load(&self, index: usize) -> SegDatasetResult<RawSample>;
}

/// Fixed set of samples held in memory.
pub struct InMemorySource {
    samples: Vec<RawSample>,
}

impl InMemorySource {
    pub fn new(samples: Vec<RawSample>) -> Self {
        Self { samples }
    }
}

impl SampleSource for InMemorySource {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn load(&self, index: usize) -> SegDatasetResult<RawSample> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| SegDatasetError::Other(format!("sample index {index} out of range")))
    }
}

/// Directory layout: `<root>/images/*.png` with matching
/// `<root>/labels/<stem>.png` storing class ids as 8-bit grayscale.
pub struct DirectorySource {
    entries: Vec<(PathBuf, PathBuf)>,
}

impl DirectorySource {
    pub fn index(root: &Path) -> SegDatasetResult<Self> {
        let images_dir = root.join("images");
        let labels_dir = root.join("labels");
        let mut entries = Vec::new();
        let read = fs::read_dir(&images_dir).map_err(|source| SegDatasetError::Io {
            path: images_dir.clone(),
            source,
        })?;
        for entry in read {
            let entry = entry.map_err(|source| SegDatasetError::Io {
                path: images_dir.clone(),
                source,
            })?;
            let img_path = entry.path();
            if img_path.extension().and_then(|s| s.to_str()) != Some("png") {
                continue;
            }
            let stem = match img_path.file_stem().and_then(|s| s.to_str()) {
                Some(s) => s,
                None => continue,
            };
            let label_path = labels_dir.join(format!("{stem}.png"));
            if !label_path.exists() {
                return Err(SegDatasetError::MissingLabels { path: img_path });
            }
            entries.push((img_path, label_path));
        }
        // Directory iteration order is filesystem-dependent; sort for
        // reproducible sample ids.
        entries.sort();
        Ok(Self { entries })
    }
}

impl SampleSource for DirectorySource {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn load(&self, index: usize) -> SegDatasetResult<RawSample> {
        let (img_path, label_path) = self
            .entries
            .get(index)
            .ok_or_else(|| SegDatasetError::Other(format!("sample index {index} out of range")))?;
        let image = image::open(img_path)
            .map_err(|source| SegDatasetError::Image {
                path: img_path.clone(),
                source,
            })?
            .to_rgb8();
        let label_img = image::open(label_path)
            .map_err(|source| SegDatasetError::Image {
                path: label_path.clone(),
                source,
            })?
            .to_luma8();
        let (w, h) = label_img.dimensions();
        let labels = LabelMap::new(w, h, label_img.into_raw())?;
        Ok(RawSample {
            id: index as u64,
            image,
            labels,
        })
    }
}

/// Split sample indices into (train, val). Deterministic when seeded.
pub fn split_indices(len: usize, val_ratio: f32, seed: Option<u64>) -> (Vec<usize>, Vec<usize>) {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = match seed {
        Some(s) => rand::rngs::StdRng::seed_from_u64(s),
        None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
    };
    order.shuffle(&mut rng);
    let val_count = ((val_ratio.clamp(0.0, 1.0) * len as f32).round() as usize).min(len);
    let (val, train) = order.split_at(val_count);
    (train.to_vec(), val.to_vec())
}
