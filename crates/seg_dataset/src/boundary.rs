//! Boundary ground-truth synthesis from semantic label maps.
//!
//! A pixel is a boundary pixel when some other pixel with a different
//! (non-ignore) class id lies within the structuring neighborhood of radius
//! `width`. Ignore pixels never trigger a boundary and are carried through as
//! ignore in the output, so the boundary head can mask them the same way the
//! segmentation head does.

use crate::types::{LabelMap, SegDatasetError, SegDatasetResult, DEFAULT_IGNORE_LABEL};
use serde::{Deserialize, Serialize};

/// Neighborhood shape used when scanning for differing class ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connectivity {
    /// Manhattan diamond: |dx| + |dy| <= width.
    Four,
    /// Chebyshev square: max(|dx|, |dy|) <= width.
    Eight,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundaryConfig {
    /// Neighborhood radius in pixels, at full input resolution.
    pub width: u32,
    pub ignore_label: u8,
    pub connectivity: Connectivity,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            width: 2,
            ignore_label: DEFAULT_IGNORE_LABEL,
            connectivity: Connectivity::Eight,
        }
    }
}

impl BoundaryConfig {
    pub fn validate(&self) -> SegDatasetResult<()> {
        if self.width < 1 {
            return Err(SegDatasetError::InvalidConfig(
                "boundary width must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Derive a boundary label map from a segmentation label map.
///
/// Output values: 1 for boundary, 0 for interior, `ignore_label` where the
/// input is ignore. Deterministic, no randomness; neighborhood windows are
/// clamped at the image border.
pub fn synthesize_boundary(
    labels: &LabelMap,
    cfg: &BoundaryConfig,
) -> SegDatasetResult<LabelMap> {
    cfg.validate()?;
    let (w, h) = labels.dimensions();
    if w == 0 || h == 0 {
        return Err(SegDatasetError::InvalidShape {
            expected: "non-empty 2-d label map".to_string(),
            actual: format!("{w}x{h}"),
        });
    }

    let r = cfg.width as i64;
    let mut out = LabelMap::filled(w, h, 0);

    for y in 0..h {
        for x in 0..w {
            let center = labels.get(x, y);
            if center == cfg.ignore_label {
                out.set(x, y, cfg.ignore_label);
                continue;
            }

            let y0 = (y as i64 - r).max(0) as u32;
            let y1 = (y as i64 + r).min(h as i64 - 1) as u32;
            let x0 = (x as i64 - r).max(0) as u32;
            let x1 = (x as i64 + r).min(w as i64 - 1) as u32;

            'scan: for ny in y0..=y1 {
                let dy = (ny as i64 - y as i64).abs();
                let row = labels.row(ny);
                for nx in x0..=x1 {
                    if cfg.connectivity == Connectivity::Four {
                        let dx = (nx as i64 - x as i64).abs();
                        if dx + dy > r {
                            continue;
                        }
                    }
                    let v = row[nx as usize];
                    if v != center && v != cfg.ignore_label {
                        out.set(x, y, 1);
                        break 'scan;
                    }
                }
            }
        }
    }

    Ok(out)
}
