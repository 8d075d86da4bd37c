use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};

/// A (width, height) box prior in grid-cell units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Anchor {
    pub width: f32,
    pub height: f32,
}

impl Anchor {
    pub const fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }

    /// IOU between this prior and a box of size `w` x `h` when both share the same center.
    pub fn shape_iou(&self, w: f32, h: f32) -> f32 {
        let inter = self.width.min(w) * self.height.min(h);
        let union = self.width * self.height + w * h - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// YOLOv2 priors clustered on Pascal VOC, for a 13x13 grid.
pub const VOC_ANCHORS: [Anchor; 5] = [
    Anchor::new(1.3221, 1.73145),
    Anchor::new(3.19275, 4.00944),
    Anchor::new(5.05587, 8.09892),
    Anchor::new(9.47112, 4.84053),
    Anchor::new(11.2364, 10.0071),
];

pub fn voc_anchors() -> Vec<Anchor> {
    VOC_ANCHORS.to_vec()
}

pub fn validate_anchors(anchors: &[Anchor]) -> Result<()> {
    if anchors.is_empty() {
        return Err(DetectorError::invalid("at least one anchor is required"));
    }
    for (i, a) in anchors.iter().enumerate() {
        if !(a.width.is_finite() && a.height.is_finite() && a.width > 0.0 && a.height > 0.0) {
            return Err(DetectorError::invalid(format!(
                "anchor {i} must have positive finite size, got {}x{}",
                a.width, a.height
            )));
        }
    }
    Ok(())
}
