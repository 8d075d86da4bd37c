//! Fixed-prior target assignment.
//!
//! A ground truth belongs to the cell containing its center and to the anchor
//! whose prior shape overlaps it best. The data loader uses this to build the
//! assignment masks and the loss uses it to recover which object each
//! positive slot was matched to.

use crate::error::{DetectorError, Result};
use crate::model::anchors::Anchor;
use crate::model::blocks::GridShape;
use crate::model::nms::BBox;

/// Attributes per ground-truth row: `(xmin, ymin, xmax, ymax, class_id)`.
pub const GT_ATTRS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundTruth {
    pub bbox: BBox,
    pub class_id: usize,
}

impl GroundTruth {
    pub fn new(bbox: BBox, class_id: usize) -> Self {
        Self { bbox, class_id }
    }

    pub fn to_row(&self) -> [f32; GT_ATTRS] {
        [
            self.bbox.x1,
            self.bbox.y1,
            self.bbox.x2,
            self.bbox.y2,
            self.class_id as f32,
        ]
    }
}

/// Slot -> object match.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Assignment {
    /// Index into the image's object list.
    pub object: usize,
    /// Centered IOU between the object and the slot's prior; the mask value.
    pub iou: f32,
}

/// Reads one image's padded ground-truth rows. Rows with a negative class id
/// are padding and skipped.
pub fn parse_ground_truth(rows: &[f32], image: usize, num_classes: usize) -> Result<Vec<GroundTruth>> {
    let mut objects = Vec::new();

    for (object, row) in rows.chunks(GT_ATTRS).enumerate() {
        let class = row[4];
        if class < 0.0 {
            continue;
        }

        let malformed = |reason: String| DetectorError::MalformedGroundTruth {
            image,
            object,
            reason,
        };

        if row.iter().any(|v| !v.is_finite()) {
            return Err(malformed(format!("non-finite values {row:?}")));
        }
        if !(row[0] < row[2] && row[1] < row[3]) {
            return Err(malformed(format!(
                "expected xmin < xmax and ymin < ymax, got {:?}",
                &row[..4]
            )));
        }
        if class.fract() != 0.0 || class as usize >= num_classes {
            return Err(malformed(format!(
                "class id {class} outside 0..{num_classes}"
            )));
        }

        objects.push(GroundTruth::new(
            BBox::new(row[0], row[1], row[2], row[3]),
            class as usize,
        ));
    }

    Ok(objects)
}

/// Responsible slot for every object of one image.
/// When two objects claim the same slot the higher IOU wins, the earlier object on ties.
pub fn assign_targets(
    objects: &[GroundTruth],
    grid: GridShape,
    anchors: &[Anchor],
) -> Vec<Option<Assignment>> {
    let mut slots = vec![None; grid.len()];
    if grid.is_empty() {
        return slots;
    }

    for (object, gt) in objects.iter().enumerate() {
        let (cx, cy) = gt.bbox.center();
        let col = cell_coord(cx, grid.width);
        let row = cell_coord(cy, grid.height);

        let mut best: Option<(usize, f32)> = None;
        for (a, anchor) in anchors.iter().enumerate() {
            let iou = anchor.shape_iou(gt.bbox.width(), gt.bbox.height());
            if best.map_or(true, |(_, b)| iou > b) {
                best = Some((a, iou));
            }
        }
        let Some((anchor, iou)) = best else {
            continue;
        };

        let slot = &mut slots[grid.index(row, col, anchor)];
        let replace = match slot {
            Some(Assignment { iou: held, .. }) => iou > *held,
            None => true,
        };
        if replace {
            *slot = Some(Assignment { object, iou });
        }
    }

    slots
}

/// Mask row `[H*W*A]`: the assignment IOU for positives, 0 elsewhere.
pub fn mask_from_assignments(assignments: &[Option<Assignment>]) -> Vec<f32> {
    assignments
        .iter()
        .map(|a| a.map_or(0.0, |a| a.iou))
        .collect()
}

fn cell_coord(v: f32, cells: usize) -> usize {
    (v.floor().max(0.0) as usize).min(cells - 1)
}
