use burn::prelude::*;
use burn::tensor::ElementConversion;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::model::anchors::{validate_anchors, Anchor};
use crate::model::assign::{assign_targets, parse_ground_truth, GT_ATTRS};
use crate::model::blocks::{RegionOutput, BOX_ATTRS};

const EPS: f32 = 1e-9;

/// Weights of the four loss terms, chosen per training run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossCoefficients {
    pub coord: f32,
    pub obj: f32,
    pub noobj: f32,
    pub class: f32,
}

impl Default for LossCoefficients {
    fn default() -> Self {
        Self {
            coord: 5.0,
            obj: 1.0,
            noobj: 0.5,
            class: 1.0,
        }
    }
}

impl LossCoefficients {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("coord", self.coord),
            ("obj", self.obj),
            ("noobj", self.noobj),
            ("class", self.class),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(DetectorError::invalid(format!(
                    "loss coefficient {name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Unweighted loss terms, each summed over the batch.
#[derive(Debug, Clone)]
pub struct LossTerms<B: Backend> {
    pub xy: Tensor<B, 1>,
    pub wh: Tensor<B, 1>,
    pub obj: Tensor<B, 1>,
    pub noobj: Tensor<B, 1>,
    pub class: Tensor<B, 1>,
    pub batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LossBreakdown {
    pub xy: f32,
    pub wh: f32,
    pub obj: f32,
    pub noobj: f32,
    pub class: f32,
}

impl<B: Backend> LossTerms<B> {
    pub fn total(&self, c: &LossCoefficients) -> Tensor<B, 1> {
        let coord = (self.xy.clone() + self.wh.clone()).mul_scalar(c.coord);
        let weighted = coord
            + self.obj.clone().mul_scalar(c.obj)
            + self.noobj.clone().mul_scalar(c.noobj)
            + self.class.clone().mul_scalar(c.class);

        weighted.div_scalar(self.batch_size as f32)
    }

    pub fn breakdown(&self) -> LossBreakdown {
        let value = |t: &Tensor<B, 1>| t.clone().into_scalar().elem::<f32>();
        LossBreakdown {
            xy: value(&self.xy),
            wh: value(&self.wh),
            obj: value(&self.obj),
            noobj: value(&self.noobj),
            class: value(&self.class),
        }
    }
}

/// Per-slot targets gathered from the ground truth, laid out like the predictions.
struct Targets {
    positive: Vec<f32>,
    centers: Vec<f32>,
    sqrt_sizes: Vec<f32>,
    classes: Vec<f32>,
    gt_boxes: Vec<f32>,
    gt_valid: Vec<f32>,
}

/// YOLOv2 region loss: localization (center + sqrt size), confidence on
/// positives and negatives, and classification.
#[derive(Debug, Clone)]
pub struct YoloLoss {
    anchors: Vec<Anchor>,
    num_classes: usize,
    coefficients: LossCoefficients,
}

impl YoloLoss {
    pub fn new(anchors: Vec<Anchor>, num_classes: usize, coefficients: LossCoefficients) -> Result<Self> {
        validate_anchors(&anchors)?;
        coefficients.validate()?;
        if num_classes == 0 {
            return Err(DetectorError::invalid("num_classes must be at least 1"));
        }

        Ok(Self {
            anchors,
            num_classes,
            coefficients,
        })
    }

    pub fn coefficients(&self) -> &LossCoefficients {
        &self.coefficients
    }

    /// Weighted scalar loss, averaged over the batch.
    ///
    /// `ground_truth` is `[B, M, 5]` of `(xmin, ymin, xmax, ymax, class_id)` in
    /// grid units, padded with negative class ids. `masks` is `[B, H*W*A]`.
    pub fn compute<B: Backend>(
        &self,
        output: &RegionOutput<B>,
        ground_truth: Tensor<B, 3>,
        masks: Tensor<B, 2>,
    ) -> Result<Tensor<B, 1>> {
        let terms = self.terms(output, ground_truth, masks)?;
        Ok(terms.total(&self.coefficients))
    }

    pub fn terms<B: Backend>(
        &self,
        output: &RegionOutput<B>,
        ground_truth: Tensor<B, 3>,
        masks: Tensor<B, 2>,
    ) -> Result<LossTerms<B>> {
        let grid = output.grid;
        let predictions = output.predictions.clone();
        let [b, n, attrs] = predictions.dims();
        let c = self.num_classes;

        let expected = [b, grid.len(), BOX_ATTRS + c];
        if [b, n, attrs] != expected || grid.anchors != self.anchors.len() {
            return Err(DetectorError::shape("loss predictions", &expected, &[b, n, attrs]));
        }
        let [gb, m, ga] = ground_truth.dims();
        if gb != b || ga != GT_ATTRS {
            return Err(DetectorError::shape("loss ground truth", &[b, m, GT_ATTRS], &[gb, m, ga]));
        }
        if masks.dims() != [b, n] {
            return Err(DetectorError::shape("loss masks", &[b, n], &masks.dims()));
        }

        let device = predictions.device();
        let targets = self.gather_targets(
            &to_vec(ground_truth)?,
            &to_vec(masks.clone())?,
            output,
            m,
        )?;

        let positive = Tensor::<B, 3>::from_data(TensorData::new(targets.positive, [b, n, 1]), &device);
        let positive2 = positive.clone().repeat_dim(2, 2);

        // Localization
        let mins = predictions.clone().narrow(2, 0, 2);
        let maxs = predictions.clone().narrow(2, 2, 2);
        let centers = (mins.clone() + maxs.clone()).div_scalar(2.0);
        let sizes = maxs - mins;

        let target_centers = Tensor::<B, 3>::from_data(TensorData::new(targets.centers, [b, n, 2]), &device);
        let target_sizes = Tensor::<B, 3>::from_data(TensorData::new(targets.sqrt_sizes, [b, n, 2]), &device);

        let xy = ((centers - target_centers).powf_scalar(2.0) * positive2.clone()).sum();
        let wh = ((sizes.clamp_min(EPS).sqrt() - target_sizes).powf_scalar(2.0) * positive2).sum();

        // Confidence: best IOU of each predicted box against the image's objects
        let max_iou = if m == 0 {
            Tensor::<B, 3>::zeros([b, n, 1], &device)
        } else {
            let gt_boxes = Tensor::<B, 3>::from_data(TensorData::new(targets.gt_boxes, [b, m, 4]), &device);
            let gt_valid = Tensor::<B, 3>::from_data(TensorData::new(targets.gt_valid, [b, m, 1]), &device);
            pairwise_iou(predictions.clone().narrow(2, 0, 4), gt_boxes, gt_valid)
                .max_dim(2)
                .reshape([b, n, 1])
        };
        let mask: Tensor<B, 3> = masks.reshape([b, n, 1]);
        let conf_err = (max_iou - mask).powf_scalar(2.0);
        let negative = positive.clone().neg().add_scalar(1.0);
        let obj = (conf_err.clone() * positive).sum();
        let noobj = (conf_err * negative).sum();

        // Classification: cross-entropy on the decoded class probabilities
        let one_hot = Tensor::<B, 3>::from_data(TensorData::new(targets.classes, [b, n, c]), &device);
        let log_probs = predictions.narrow(2, BOX_ATTRS, c).clamp_min(EPS).log();
        let class = (one_hot * log_probs).sum().neg();

        Ok(LossTerms {
            xy,
            wh,
            obj,
            noobj,
            class,
            batch_size: b,
        })
    }

    fn gather_targets<B: Backend>(
        &self,
        gt_values: &[f32],
        mask_values: &[f32],
        output: &RegionOutput<B>,
        m: usize,
    ) -> Result<Targets> {
        let grid = output.grid;
        let n = grid.len();
        let c = self.num_classes;
        let b = mask_values.len() / n.max(1);

        let mut targets = Targets {
            positive: vec![0.0; b * n],
            centers: vec![0.0; b * n * 2],
            sqrt_sizes: vec![1.0; b * n * 2],
            classes: vec![0.0; b * n * c],
            gt_boxes: vec![0.0; b * m * 4],
            gt_valid: vec![0.0; b * m],
        };

        for image in 0..b {
            let rows = &gt_values[image * m * GT_ATTRS..(image + 1) * m * GT_ATTRS];
            for (j, row) in rows.chunks(GT_ATTRS).enumerate() {
                if row[4] >= 0.0 {
                    let at = image * m + j;
                    targets.gt_boxes[at * 4..at * 4 + 4].copy_from_slice(&row[..4]);
                    targets.gt_valid[at] = 1.0;
                }
            }

            let objects = parse_ground_truth(rows, image, c)?;
            let assignments = assign_targets(&objects, grid, &self.anchors);
            let mask = &mask_values[image * n..(image + 1) * n];

            for (index, &value) in mask.iter().enumerate() {
                if !(0.0..=1.0).contains(&value) {
                    return Err(DetectorError::InvalidMask { image, index, value });
                }
                if value == 0.0 {
                    continue;
                }
                let Some(assigned) = assignments[index] else {
                    return Err(DetectorError::Assignment { image, index });
                };
                let gt = objects[assigned.object];
                let (cx, cy) = gt.bbox.center();
                let slot = image * n + index;

                targets.positive[slot] = 1.0;
                targets.centers[slot * 2] = cx;
                targets.centers[slot * 2 + 1] = cy;
                targets.sqrt_sizes[slot * 2] = gt.bbox.width().sqrt();
                targets.sqrt_sizes[slot * 2 + 1] = gt.bbox.height().sqrt();
                targets.classes[slot * c + gt.class_id] = 1.0;
            }
        }

        Ok(targets)
    }
}

/// IOU between every predicted box `[B, N, 4]` and every object `[B, M, 4]`,
/// zeroed for padding objects. Returns `[B, N, M, 1]`.
pub fn pairwise_iou<B: Backend>(
    boxes: Tensor<B, 3>,
    objects: Tensor<B, 3>,
    valid: Tensor<B, 3>,
) -> Tensor<B, 4> {
    let [_, n, _] = boxes.dims();
    let [_, m, _] = objects.dims();

    let p: Tensor<B, 4> = boxes.unsqueeze_dim::<4>(2).repeat_dim(2, m);
    let g: Tensor<B, 4> = objects.unsqueeze_dim::<4>(1).repeat_dim(1, n);
    let valid: Tensor<B, 4> = valid.unsqueeze_dim::<4>(1).repeat_dim(1, n);

    let coord = |t: &Tensor<B, 4>, k: usize| t.clone().narrow(3, k, 1);
    let (px1, py1, px2, py2) = (coord(&p, 0), coord(&p, 1), coord(&p, 2), coord(&p, 3));
    let (gx1, gy1, gx2, gy2) = (coord(&g, 0), coord(&g, 1), coord(&g, 2), coord(&g, 3));

    let iw = (px2.clone().min_pair(gx2.clone()) - px1.clone().max_pair(gx1.clone())).clamp_min(0.0);
    let ih = (py2.clone().min_pair(gy2.clone()) - py1.clone().max_pair(gy1.clone())).clamp_min(0.0);
    let inter = iw * ih;

    let area_p = (px2 - px1).clamp_min(0.0) * (py2 - py1).clamp_min(0.0);
    let area_g = (gx2 - gx1).clamp_min(0.0) * (gy2 - gy1).clamp_min(0.0);
    let union = (area_p + area_g - inter.clone()).clamp_min(EPS);

    inter / union * valid
}

fn to_vec<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| DetectorError::TensorData(format!("{e:?}")))
}
