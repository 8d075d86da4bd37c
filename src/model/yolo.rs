use burn::prelude::*;
use serde::{Deserialize, Serialize};

use super::anchors::{voc_anchors, Anchor};
use super::backbone::{Backbone, DarknetConfig};
use super::blocks::RegionOutput;
use super::head::DetectionHead;
use super::loss::YoloLoss;
use super::nms::{Detection, Postprocessor};
use crate::error::{DetectorError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub num_classes: usize,
    /// Priors `(width, height)` in grid cells.
    pub anchors: Vec<Anchor>,
    #[serde(default)]
    pub backbone: DarknetConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: 20,
            anchors: voc_anchors(),
            backbone: DarknetConfig::default(),
        }
    }
}

#[derive(Module, Debug)]
pub struct YoloV2<B: Backend> {
    pub backbone: Backbone<B>,
    pub head: DetectionHead<B>,
}

impl<B: Backend> YoloV2<B> {
    pub fn new(device: &B::Device, config: &ModelConfig) -> Result<Self> {
        let backbone = Backbone::new(device, &config.backbone)?;
        let head = DetectionHead::new(
            device,
            backbone.out_channels(),
            config.anchors.clone(),
            config.num_classes,
        )?;

        Ok(Self { backbone, head })
    }

    /// Pixels per grid cell.
    pub fn stride(&self) -> usize {
        self.backbone.stride()
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }

    pub fn anchors(&self) -> &[Anchor] {
        self.head.decoder().anchors()
    }

    /// Decoded predictions `[B, H*W*A, 5 + C]`, boxes in grid units.
    pub fn forward(&self, x: Tensor<B, 4>) -> Result<RegionOutput<B>> {
        let [b, c, h, w] = x.dims();
        let multiple = self.backbone.input_multiple();
        if h % multiple != 0 || w % multiple != 0 || h == 0 || w == 0 {
            return Err(DetectorError::invalid(format!(
                "input {h}x{w} must be a non-zero multiple of {multiple}"
            )));
        }
        log::debug!("YoloV2 input: {:?}", [b, c, h, w]);

        let features = self.backbone.forward(x);
        self.head.forward(features)
    }

    /// Inference with confidence filtering and NMS, one list per image.
    pub fn predict(&self, x: Tensor<B, 4>, postprocessor: &Postprocessor) -> Result<Vec<Vec<Detection>>> {
        let output = self.forward(x)?;
        postprocessor.process_batch(output.predictions)
    }

    /// Forward pass followed by the region loss.
    pub fn loss(
        &self,
        loss: &YoloLoss,
        images: Tensor<B, 4>,
        ground_truth: Tensor<B, 3>,
        masks: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        let output = self.forward(images)?;
        loss.compute(&output, ground_truth, masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::assign::{assign_targets, mask_from_assignments, GroundTruth};
    use crate::model::backbone::LayerSpec;
    use crate::model::loss::LossCoefficients;
    use crate::model::nms::{BBox, PostprocessConfig};
    use burn::backend::NdArray;

    type B = NdArray;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            num_classes: 3,
            anchors: vec![Anchor::new(1.0, 1.0), Anchor::new(2.0, 1.5)],
            backbone: DarknetConfig {
                in_channels: 3,
                width_divisor: 1,
                layers: vec![
                    LayerSpec::Conv { filters: 4, size: 3 },
                    LayerSpec::MaxPool,
                    LayerSpec::Conv { filters: 8, size: 3 },
                    LayerSpec::MaxPool,
                ],
            },
        }
    }

    fn input(device: &<B as Backend>::Device) -> Tensor<B, 4> {
        let values: Vec<f32> = (0..2 * 3 * 16 * 16).map(|i| ((i % 29) as f32) / 29.0).collect();
        Tensor::from_data(TensorData::new(values, [2, 3, 16, 16]), device)
    }

    #[test]
    fn test_forward_shapes() {
        let device = Default::default();
        let model = YoloV2::<B>::new(&device, &tiny_config()).unwrap();
        assert_eq!(model.stride(), 4);

        let out = model.forward(input(&device)).unwrap();
        assert_eq!(out.predictions.dims(), [2, 4 * 4 * 2, 8]);
        assert_eq!(out.grid.height, 4);
    }

    #[test]
    fn test_rejects_indivisible_input() {
        let device = Default::default();
        let model = YoloV2::<B>::new(&device, &tiny_config()).unwrap();
        let x = Tensor::<B, 4>::zeros([1, 3, 18, 16], &device);
        assert!(model.forward(x).is_err());
    }

    #[test]
    fn test_predict_is_deterministic_and_valid() {
        let device = Default::default();
        let model = YoloV2::<B>::new(&device, &tiny_config()).unwrap();
        let post = Postprocessor::new(PostprocessConfig {
            conf_threshold: 0.0,
            iou_threshold: 0.45,
        })
        .unwrap();

        let first = model.predict(input(&device), &post).unwrap();
        let second = model.predict(input(&device), &post).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);

        for detections in &first {
            assert!(!detections.is_empty());
            for pair in detections.windows(2) {
                assert!(pair[0].confidence >= pair[1].confidence);
            }
            for d in detections {
                assert!(d.class_id < 3);
                assert!(d.bbox.x1 < d.bbox.x2 && d.bbox.y1 < d.bbox.y2);
                assert!((0.0..=1.0).contains(&d.confidence));
            }
        }
    }

    #[test]
    fn test_loss_runs_end_to_end() {
        let device = Default::default();
        let config = tiny_config();
        let model = YoloV2::<B>::new(&device, &config).unwrap();
        let loss = YoloLoss::new(config.anchors.clone(), config.num_classes, LossCoefficients::default())
            .unwrap();

        let out = model.forward(input(&device)).unwrap();
        let gt = GroundTruth::new(BBox::new(0.5, 0.5, 1.5, 1.5), 2);
        let mask = mask_from_assignments(&assign_targets(&[gt], out.grid, &config.anchors));
        let masks: Vec<f32> = mask.iter().chain(mask.iter()).copied().collect();

        let rows: Vec<f32> = gt.to_row().iter().chain(gt.to_row().iter()).copied().collect();
        let gt = Tensor::<B, 3>::from_data(TensorData::new(rows, [2, 1, 5]), &device);
        let masks = Tensor::<B, 2>::from_data(TensorData::new(masks, [2, out.grid.len()]), &device);

        let value = model
            .loss(&loss, input(&device), gt, masks)
            .unwrap()
            .into_scalar()
            .elem::<f32>();
        assert!(value.is_finite() && value > 0.0);
    }
}
