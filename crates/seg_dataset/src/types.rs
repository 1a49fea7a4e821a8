//! Core types, error definitions, and data structures for seg_dataset.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type SegDatasetResult<T> = Result<T, SegDatasetError>;

#[derive(Debug, Error)]
pub enum SegDatasetError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid shape: expected {expected}, got {actual}")]
    InvalidShape { expected: String, actual: String },
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("label map missing for image {path}")]
    MissingLabels { path: PathBuf },
    #[error("{0}")]
    Other(String),
}

/// Reserved class id marking unlabeled/void pixels. Excluded from loss and
/// boundary computation.
pub const DEFAULT_IGNORE_LABEL: u8 = 255;

/// A dense 2-D map of integer class ids, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMap {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl LabelMap {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> SegDatasetResult<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(SegDatasetError::InvalidShape {
                expected: format!("{width}x{height} ({expected} values)"),
                actual: format!("{} values", data.len()),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn filled(width: u32, height: u32, value: u8) -> Self {
        Self {
            width,
            height,
            data: vec![value; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: u8) {
        self.data[y as usize * self.width as usize + x as usize] = value;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let w = self.width as usize;
        let start = y as usize * w;
        &self.data[start..start + w]
    }

    /// Mirror each row in place (horizontal flip).
    pub fn flip_horizontal(&mut self) {
        let w = self.width as usize;
        for row in self.data.chunks_mut(w) {
            row.reverse();
        }
    }

    /// Copy out a sub-rectangle. Errors if the rectangle leaves the map.
    pub fn crop(&self, x0: u32, y0: u32, w: u32, h: u32) -> SegDatasetResult<LabelMap> {
        if x0 + w > self.width || y0 + h > self.height {
            return Err(SegDatasetError::ShapeMismatch(format!(
                "crop {w}x{h}+{x0}+{y0} exceeds label map {}x{}",
                self.width, self.height
            )));
        }
        let mut data = Vec::with_capacity(w as usize * h as usize);
        for y in y0..y0 + h {
            let row = self.row(y);
            data.extend_from_slice(&row[x0 as usize..(x0 + w) as usize]);
        }
        Ok(LabelMap {
            width: w,
            height: h,
            data,
        })
    }

    /// Nearest-neighbor resize. Labels are class ids and must never be blended.
    pub fn resize_nearest(&self, new_w: u32, new_h: u32) -> LabelMap {
        let mut data = Vec::with_capacity(new_w as usize * new_h as usize);
        for y in 0..new_h {
            let sy = ((y as u64 * self.height as u64) / new_h as u64) as u32;
            let sy = sy.min(self.height - 1);
            for x in 0..new_w {
                let sx = ((x as u64 * self.width as u64) / new_w as u64) as u32;
                let sx = sx.min(self.width - 1);
                data.push(self.get(sx, sy));
            }
        }
        LabelMap {
            width: new_w,
            height: new_h,
            data,
        }
    }
}

/// One training example after the transform pipeline has run.
#[derive(Debug, Clone)]
pub struct SegSample {
    pub id: u64,
    /// Image in CHW layout, normalized to [0, 1].
    pub image_chw: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// Semantic class ids, same spatial shape as the image.
    pub labels: LabelMap,
    /// Boundary ground truth synthesized after geometric transforms.
    /// Always matches `labels` in shape when present.
    pub boundary: Option<LabelMap>,
}

/// Per-channel normalization applied at batch assembly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Normalizer {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Normalizer {
    fn default() -> Self {
        // ImageNet statistics, rescaled from 0-255 to the 0-1 pixel range.
        Self {
            mean: [123.675 / 255.0, 116.28 / 255.0, 103.53 / 255.0],
            std: [58.395 / 255.0, 57.12 / 255.0, 57.375 / 255.0],
        }
    }
}

impl Normalizer {
    pub fn validate(&self) -> SegDatasetResult<()> {
        for (i, s) in self.std.iter().enumerate() {
            if !s.is_finite() || *s <= 0.0 {
                return Err(SegDatasetError::InvalidConfig(format!(
                    "normalization std[{i}] must be positive and finite, got {s}"
                )));
            }
        }
        for (i, m) in self.mean.iter().enumerate() {
            if !m.is_finite() {
                return Err(SegDatasetError::InvalidConfig(format!(
                    "normalization mean[{i}] must be finite, got {m}"
                )));
            }
        }
        Ok(())
    }
}
