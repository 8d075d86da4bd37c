use burn::prelude::*;
use rand::seq::SliceRandom;

use crate::data::dataset::{image_to_chw, BoundingBox, YoloDataset};
use crate::data::transforms::DataAugmentation;
use crate::model::anchors::Anchor;
use crate::model::assign::{assign_targets, mask_from_assignments, GroundTruth, GT_ATTRS};
use crate::model::blocks::GridShape;

/// Padded ground-truth rows and assignment masks for a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Targets {
    /// `[batch * max_objects * 5]`, padding rows are all -1.
    pub ground_truth: Vec<f32>,
    /// `[batch * H*W*A]`.
    pub masks: Vec<f32>,
    pub max_objects: usize,
}

/// Converts per-image normalized labels to grid-unit ground truth and masks.
/// `max_objects` is at least 1 so the ground-truth tensor is never empty.
pub fn build_targets(labels: &[Vec<BoundingBox>], grid: GridShape, anchors: &[Anchor]) -> Targets {
    let max_objects = labels.iter().map(Vec::len).max().unwrap_or(0).max(1);
    let mut ground_truth = Vec::with_capacity(labels.len() * max_objects * GT_ATTRS);
    let mut masks = Vec::with_capacity(labels.len() * grid.len());

    for boxes in labels {
        let objects: Vec<GroundTruth> = boxes
            .iter()
            .map(|b| GroundTruth::new(b.to_grid(grid.width, grid.height), b.class_id))
            .collect();

        for gt in &objects {
            ground_truth.extend(gt.to_row());
        }
        let padding = (max_objects - objects.len()) * GT_ATTRS;
        ground_truth.extend(std::iter::repeat(-1.0).take(padding));

        masks.extend(mask_from_assignments(&assign_targets(&objects, grid, anchors)));
    }

    Targets {
        ground_truth,
        masks,
        max_objects,
    }
}

pub struct YoloBatch<B: Backend> {
    pub images: Tensor<B, 4>,
    /// `[B, max_objects, 5]` in grid units.
    pub ground_truth: Tensor<B, 3>,
    /// `[B, H*W*A]`.
    pub masks: Tensor<B, 2>,
    pub boxes: Vec<Vec<BoundingBox>>,
    pub batch_size: usize,
}

pub struct YoloDataLoader<B: Backend> {
    dataset: YoloDataset,
    batch_size: usize,
    shuffle: bool,
    augmentation: DataAugmentation,
    grid: GridShape,
    anchors: Vec<Anchor>,
    device: B::Device,
    indices: Vec<usize>,
    current_idx: usize,
}

impl<B: Backend> YoloDataLoader<B> {
    /// `stride` is the backbone's pixels per grid cell.
    pub fn new(
        dataset: YoloDataset,
        batch_size: usize,
        shuffle: bool,
        stride: usize,
        anchors: Vec<Anchor>,
        device: B::Device,
    ) -> Self {
        let cells = dataset.img_size / stride.max(1);
        let grid = GridShape::new(cells, cells, anchors.len());
        let mut indices: Vec<usize> = (0..dataset.len()).collect();

        if shuffle {
            let mut rng = rand::thread_rng();
            indices.shuffle(&mut rng);
        }

        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            augmentation: DataAugmentation::new(false),
            grid,
            anchors,
            device,
            indices,
            current_idx: 0,
        }
    }

    pub fn with_augmentation(mut self, augmentation: DataAugmentation) -> Self {
        self.augmentation = augmentation;
        self
    }

    pub fn grid(&self) -> GridShape {
        self.grid
    }

    pub fn reset(&mut self) {
        self.current_idx = 0;
        if self.shuffle {
            let mut rng = rand::thread_rng();
            self.indices.shuffle(&mut rng);
        }
    }

    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.is_empty()
    }
}

impl<B: Backend> Iterator for YoloDataLoader<B> {
    type Item = YoloBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        let size = self.dataset.img_size;

        while self.current_idx < self.dataset.len() {
            let end_idx = (self.current_idx + self.batch_size).min(self.dataset.len());
            let batch_indices = &self.indices[self.current_idx..end_idx];

            let mut images_vec = Vec::with_capacity(batch_indices.len() * 3 * size * size);
            let mut all_boxes = Vec::with_capacity(batch_indices.len());

            for &idx in batch_indices {
                match self.dataset.get(idx) {
                    Ok((img, boxes)) => {
                        let (img, boxes) = self.augmentation.apply(img, boxes);
                        images_vec.extend(image_to_chw(&img, size));
                        all_boxes.push(boxes);
                    }
                    Err(e) => log::warn!("Skipping sample {}: {:#}", idx, e),
                }
            }
            self.current_idx = end_idx;

            if all_boxes.is_empty() {
                continue;
            }

            let batch_size = all_boxes.len();
            let targets = build_targets(&all_boxes, self.grid, &self.anchors);

            let images = Tensor::<B, 4>::from_data(
                TensorData::new(images_vec, [batch_size, 3, size, size]),
                &self.device,
            );
            let ground_truth = Tensor::<B, 3>::from_data(
                TensorData::new(targets.ground_truth, [batch_size, targets.max_objects, GT_ATTRS]),
                &self.device,
            );
            let masks = Tensor::<B, 2>::from_data(
                TensorData::new(targets.masks, [batch_size, self.grid.len()]),
                &self.device,
            );

            return Some(YoloBatch {
                images,
                ground_truth,
                masks,
                boxes: all_boxes,
                batch_size,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(class_id: usize, x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox {
            class_id,
            x_center: x,
            y_center: y,
            width: w,
            height: h,
        }
    }

    #[test]
    fn test_build_targets_pads_and_masks() {
        let grid = GridShape::new(4, 4, 2);
        let anchors = vec![Anchor::new(1.0, 1.0), Anchor::new(2.0, 2.0)];
        let labels = vec![
            vec![label(0, 0.125, 0.125, 0.25, 0.25), label(1, 0.625, 0.625, 0.5, 0.5)],
            vec![],
        ];

        let targets = build_targets(&labels, grid, &anchors);
        assert_eq!(targets.max_objects, 2);
        assert_eq!(targets.ground_truth.len(), 2 * 2 * GT_ATTRS);
        assert_eq!(&targets.ground_truth[..5], &[0.0, 0.0, 1.0, 1.0, 0.0]);
        assert_eq!(&targets.ground_truth[5..10], &[1.5, 1.5, 3.5, 3.5, 1.0]);
        assert!(targets.ground_truth[10..].iter().all(|v| *v == -1.0));

        assert_eq!(targets.masks.len(), 2 * grid.len());
        assert_eq!(targets.masks[grid.index(0, 0, 0)], 1.0);
        assert_eq!(targets.masks[grid.index(2, 2, 1)], 1.0);
        assert_eq!(targets.masks.iter().filter(|m| **m > 0.0).count(), 2);
    }

    #[test]
    fn test_build_targets_empty_batch_keeps_one_row() {
        let grid = GridShape::new(2, 2, 1);
        let targets = build_targets(&[vec![]], grid, &[Anchor::new(1.0, 1.0)]);
        assert_eq!(targets.max_objects, 1);
        assert_eq!(targets.ground_truth, vec![-1.0; GT_ATTRS]);
        assert_eq!(targets.masks, vec![0.0; 4]);
    }
}
