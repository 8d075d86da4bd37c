use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::model::blocks::BOX_ATTRS;

/// Corner-form box, grid units unless scaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self::new(self.x1 * sx, self.y1 * sy, self.x2 * sx, self.y2 * sy)
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let iw = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let ih = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        let intersection = iw * ih;
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// One decoded prediction row.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBox {
    pub bbox: BBox,
    pub objectness: f32,
    pub class_scores: Vec<f32>,
}

impl DecodedBox {
    pub fn from_row(row: &[f32]) -> Self {
        Self {
            bbox: BBox::new(row[0], row[1], row[2], row[3]),
            objectness: row[4],
            class_scores: row[BOX_ATTRS..].to_vec(),
        }
    }

    /// `(class_id, score)` of the best class, lowest id on ties.
    pub fn best_class(&self) -> (usize, f32) {
        let mut best = (0, f32::NEG_INFINITY);
        for (c, &score) in self.class_scores.iter().enumerate() {
            if score > best.1 {
                best = (c, score);
            }
        }
        best
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: usize,
    /// Objectness of the prediction.
    pub confidence: f32,
    pub class_score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PostprocessConfig {
    pub conf_threshold: f32,
    pub iou_threshold: f32,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            iou_threshold: 0.45,
        }
    }
}

impl PostprocessConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("conf_threshold", self.conf_threshold),
            ("iou_threshold", self.iou_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(DetectorError::invalid(format!(
                    "{name} must be in [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Confidence filtering followed by class-wise greedy NMS.
#[derive(Debug, Clone)]
pub struct Postprocessor {
    config: PostprocessConfig,
}

impl Postprocessor {
    pub fn new(config: PostprocessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PostprocessConfig {
        &self.config
    }

    /// Final detections for one image, confidence-descending.
    pub fn process(&self, predictions: &[DecodedBox]) -> Vec<Detection> {
        let mut order: Vec<usize> = (0..predictions.len()).collect();
        // stable: equal confidences keep their original order
        order.sort_by(|&a, &b| {
            predictions[b]
                .objectness
                .partial_cmp(&predictions[a].objectness)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let candidates = order
            .into_iter()
            .map(|i| {
                let p = &predictions[i];
                let (class_id, class_score) = p.best_class();
                Detection {
                    bbox: p.bbox,
                    class_id,
                    confidence: p.objectness,
                    class_score,
                }
            })
            .collect();

        self.select(candidates)
    }

    /// Threshold + NMS over detections that already carry a class id.
    /// Applying it to its own output returns the same detections.
    pub fn select(&self, detections: Vec<Detection>) -> Vec<Detection> {
        let valid = self.filter(detections);
        NMS::apply(valid, self.config.iou_threshold)
    }

    /// Keeps detections with confidence strictly above the threshold, in input order.
    pub fn filter(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections
            .into_iter()
            .filter(|d| d.confidence > self.config.conf_threshold)
            .collect()
    }

    /// Per-image detections for a decoded batch `[B, N, 5 + C]`.
    pub fn process_batch<B: Backend>(&self, predictions: Tensor<B, 3>) -> Result<Vec<Vec<Detection>>> {
        let [batch, n, attrs] = predictions.dims();
        if attrs <= BOX_ATTRS {
            return Err(DetectorError::shape(
                "postprocess input",
                &[batch, n, BOX_ATTRS + 1],
                &[batch, n, attrs],
            ));
        }

        if n == 0 {
            return Ok(vec![Vec::new(); batch]);
        }

        let values = predictions
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| DetectorError::TensorData(format!("{e:?}")))?;

        Ok(values
            .chunks(n * attrs)
            .map(|image| {
                let decoded: Vec<DecodedBox> =
                    image.chunks(attrs).map(DecodedBox::from_row).collect();
                self.process(&decoded)
            })
            .collect())
    }
}

pub struct NMS;

impl NMS {
    /// Greedy suppression within each class. Input must be sorted by
    /// confidence descending; output keeps that order.
    pub fn apply(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
        let mut suppressed = vec![false; detections.len()];

        for i in 0..detections.len() {
            if suppressed[i] {
                continue;
            }
            let current = &detections[i];

            for j in (i + 1)..detections.len() {
                if suppressed[j] || detections[j].class_id != current.class_id {
                    continue;
                }
                if current.bbox.iou(&detections[j].bbox) > iou_threshold {
                    suppressed[j] = true;
                }
            }
        }

        detections
            .into_iter()
            .zip(suppressed)
            .filter_map(|(d, s)| (!s).then_some(d))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    fn decoded(bbox: BBox, objectness: f32, class_id: usize) -> DecodedBox {
        let mut class_scores = vec![0.1; 3];
        class_scores[class_id] = 0.8;
        DecodedBox {
            bbox,
            objectness,
            class_scores,
        }
    }

    fn postprocessor(conf: f32, iou: f32) -> Postprocessor {
        Postprocessor::new(PostprocessConfig {
            conf_threshold: conf,
            iou_threshold: iou,
        })
        .unwrap()
    }

    #[test]
    fn test_iou() {
        let a = BBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BBox::new(1.0, 0.0, 3.0, 2.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(a.iou(&BBox::new(5.0, 5.0, 6.0, 6.0)), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        // degenerate boxes never divide by zero
        let p = BBox::new(1.0, 1.0, 1.0, 1.0);
        assert_eq!(p.iou(&p), 0.0);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let bad = [(-0.1, 0.5), (0.5, 1.5), (f32::NAN, 0.5)];
        for (conf, iou) in bad {
            let config = PostprocessConfig {
                conf_threshold: conf,
                iou_threshold: iou,
            };
            assert!(Postprocessor::new(config).is_err());
        }
    }

    #[test]
    fn test_confidence_filter() {
        let pp = postprocessor(0.5, 0.5);
        let far = |x: f32| BBox::new(x * 10.0, 0.0, x * 10.0 + 1.0, 1.0);
        let preds = vec![
            decoded(far(0.0), 0.9, 0),
            decoded(far(1.0), 0.4, 0),
            decoded(far(2.0), 0.6, 0),
        ];
        let out = pp.process(&preds);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bbox, far(0.0));
        assert_eq!(out[1].bbox, far(2.0));
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[1].confidence, 0.6);
    }

    #[test]
    fn test_threshold_is_strict() {
        let pp = postprocessor(0.5, 0.5);
        let out = pp.process(&[decoded(BBox::new(0.0, 0.0, 1.0, 1.0), 0.5, 0)]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_different_classes_never_suppress() {
        let pp = postprocessor(0.5, 0.5);
        // IOU(a, b) = 0.9
        let a = BBox::new(0.0, 0.0, 10.0, 1.0);
        let b = BBox::new(0.0, 0.0, 9.0, 1.0);
        assert!((a.iou(&b) - 0.9).abs() < 1e-6);

        let out = pp.process(&[decoded(a, 0.9, 0), decoded(b, 0.8, 1)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class_id, 0);
        assert_eq!(out[1].class_id, 1);
    }

    #[test]
    fn test_same_class_suppression() {
        let pp = postprocessor(0.5, 0.5);
        let a = BBox::new(0.0, 0.0, 10.0, 1.0);
        // IOU(a, b) = 0.6
        let b = BBox::new(0.0, 0.0, 6.0, 1.0);
        // IOU(a, c) = 0.1
        let c = BBox::new(9.0, 0.0, 10.0, 1.0);
        assert!((a.iou(&b) - 0.6).abs() < 1e-6);
        assert!((a.iou(&c) - 0.1).abs() < 1e-6);

        let out = pp.process(&[decoded(b, 0.8, 2), decoded(c, 0.7, 2), decoded(a, 0.9, 2)]);
        let boxes: Vec<BBox> = out.iter().map(|d| d.bbox).collect();
        assert_eq!(boxes, vec![a, c]);
        assert!(out.iter().all(|d| d.class_id == 2));
    }

    #[test]
    fn test_equal_confidence_keeps_input_order() {
        let pp = postprocessor(0.1, 0.5);
        let a = BBox::new(0.0, 0.0, 1.0, 1.0);
        let b = BBox::new(0.0, 0.0, 1.0, 1.0);
        let c = BBox::new(5.0, 5.0, 6.0, 6.0);
        let out = pp.process(&[decoded(c, 0.7, 0), decoded(a, 0.7, 1), decoded(b, 0.7, 1)]);
        // b is suppressed by a, which came first
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].bbox, c);
        assert_eq!(out[1].class_id, 1);
    }

    #[test]
    fn test_best_class_tie_takes_lowest_id() {
        let d = DecodedBox {
            bbox: BBox::new(0.0, 0.0, 1.0, 1.0),
            objectness: 0.9,
            class_scores: vec![0.2, 0.4, 0.4],
        };
        assert_eq!(d.best_class(), (1, 0.4));
    }

    #[test]
    fn test_idempotent() {
        let pp = postprocessor(0.3, 0.4);
        let mut preds = Vec::new();
        for i in 0..20 {
            let x = (i % 5) as f32 * 0.7;
            let y = (i / 5) as f32 * 0.9;
            let conf = 0.2 + 0.035 * ((i * 7) % 20) as f32;
            preds.push(decoded(BBox::new(x, y, x + 2.0, y + 2.0), conf, i % 3));
        }

        let once = pp.process(&preds);
        let twice = pp.select(once.clone());
        assert!(!once.is_empty());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_empty_input() {
        let pp = postprocessor(0.5, 0.5);
        assert!(pp.process(&[]).is_empty());
    }

    #[test]
    fn test_process_batch_splits_images() {
        let device = Default::default();
        let pp = postprocessor(0.5, 0.5);
        // 2 images, 2 predictions each, 2 classes
        let rows: Vec<f32> = vec![
            0.0, 0.0, 1.0, 1.0, 0.9, 0.3, 0.7, //
            3.0, 3.0, 4.0, 4.0, 0.2, 0.5, 0.5, //
            0.0, 0.0, 1.0, 1.0, 0.1, 0.9, 0.1, //
            2.0, 2.0, 3.0, 3.0, 0.8, 0.6, 0.4,
        ];
        let tensor = Tensor::<NdArray, 3>::from_data(TensorData::new(rows, [2, 2, 7]), &device);
        let out = pp.process_batch(tensor).unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 1);
        assert_eq!(out[0][0].class_id, 1);
        assert!((out[0][0].class_score - 0.7).abs() < 1e-6);
        assert_eq!(out[1].len(), 1);
        assert_eq!(out[1][0].class_id, 0);
        assert_eq!(out[1][0].bbox, BBox::new(2.0, 2.0, 3.0, 3.0));
    }

    #[test]
    fn test_process_batch_without_predictions() {
        let device = Default::default();
        let pp = postprocessor(0.5, 0.5);
        let out = pp
            .process_batch(Tensor::<NdArray, 3>::zeros([3, 0, 7], &device))
            .unwrap();
        assert_eq!(out, vec![Vec::<Detection>::new(); 3]);
    }
}
