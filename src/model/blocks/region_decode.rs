use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};

use crate::error::{DetectorError, Result};
use crate::model::anchors::Anchor;

/// Box + objectness columns preceding the class scores in a decoded row.
pub const BOX_ATTRS: usize = 5;

/// Spatial layout of the region output: `height x width` cells, `anchors` slots per cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub height: usize,
    pub width: usize,
    pub anchors: usize,
}

impl GridShape {
    pub fn new(height: usize, width: usize, anchors: usize) -> Self {
        Self {
            height,
            width,
            anchors,
        }
    }

    /// Number of prediction slots (`H * W * A`).
    pub fn len(&self) -> usize {
        self.height * self.width * self.anchors
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn index(&self, row: usize, col: usize, anchor: usize) -> usize {
        (row * self.width + col) * self.anchors + anchor
    }

    /// Inverse of [`GridShape::index`]: `(row, col, anchor)`.
    pub fn locate(&self, index: usize) -> (usize, usize, usize) {
        let anchor = index % self.anchors;
        let cell = index / self.anchors;
        (cell / self.width, cell % self.width, anchor)
    }
}

/// Decoded predictions for a batch: `[B, H*W*A, 5 + C]`, rows are
/// `(xmin, ymin, xmax, ymax, objectness, class scores...)` in grid units.
#[derive(Debug, Clone)]
pub struct RegionOutput<B: Backend> {
    pub predictions: Tensor<B, 3>,
    pub grid: GridShape,
}

impl<B: Backend> RegionOutput<B> {
    pub fn num_classes(&self) -> usize {
        self.predictions.dims()[2] - BOX_ATTRS
    }
}

/// Maps raw head activations onto anchor/cell geometry.
#[derive(Debug, Clone)]
pub struct RegionDecoder {
    anchors: Vec<Anchor>,
    num_classes: usize,
}

impl RegionDecoder {
    pub fn new(anchors: Vec<Anchor>, num_classes: usize) -> Self {
        Self {
            anchors,
            num_classes,
        }
    }

    pub fn anchors(&self) -> &[Anchor] {
        &self.anchors
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Channels the detection head must produce.
    pub fn channels(&self) -> usize {
        self.anchors.len() * (BOX_ATTRS + self.num_classes)
    }

    pub fn decode<B: Backend>(&self, raw: Tensor<B, 4>) -> Result<RegionOutput<B>> {
        let [b, c, h, w] = raw.dims();
        if c != self.channels() {
            return Err(DetectorError::shape(
                "region decoder input",
                &[b, self.channels(), h, w],
                &[b, c, h, w],
            ));
        }

        let num_anchors = self.anchors.len();
        let attrs = BOX_ATTRS + self.num_classes;
        let grid = GridShape::new(h, w, num_anchors);
        let n = grid.len();
        let device = raw.device();

        // [B, A*(5+C), H, W] -> [B, H, W, A, 5+C] -> [B, N, 5+C]
        let x: Tensor<B, 5> = raw.reshape([b, num_anchors, attrs, h, w]);
        let x = x.permute([0, 3, 4, 1, 2]).reshape([b, n, attrs]);

        // Per-slot cell offsets and priors, shared across the batch
        let mut offsets = Vec::with_capacity(n * 2);
        let mut priors = Vec::with_capacity(n * 2);
        for index in 0..n {
            let (row, col, a) = grid.locate(index);
            offsets.push(col as f32);
            offsets.push(row as f32);
            priors.push(self.anchors[a].width);
            priors.push(self.anchors[a].height);
        }
        let offsets = Tensor::<B, 3>::from_data(TensorData::new(offsets, [1, n, 2]), &device)
            .repeat_dim(0, b);
        let priors = Tensor::<B, 3>::from_data(TensorData::new(priors, [1, n, 2]), &device)
            .repeat_dim(0, b);

        let centers = sigmoid(x.clone().narrow(2, 0, 2)) + offsets;
        let sizes = x.clone().narrow(2, 2, 2).exp() * priors;
        let half = sizes.div_scalar(2.0);

        let mins = centers.clone() - half.clone();
        let maxs = centers + half;
        let objectness = sigmoid(x.clone().narrow(2, 4, 1));
        let classes = softmax(x.narrow(2, BOX_ATTRS, self.num_classes), 2);

        let predictions = Tensor::cat(vec![mins, maxs, objectness, classes], 2);
        log::debug!("RegionDecoder: {:?} -> {:?}", [b, c, h, w], predictions.dims());

        Ok(RegionOutput { predictions, grid })
    }
}

/// Scalar form of the box transform: raw `(tx, ty, tw, th)` for the slot at
/// `(row, col)` with `anchor` -> `(xmin, ymin, xmax, ymax)`.
pub fn decode_offsets(raw: [f32; 4], anchor: Anchor, row: usize, col: usize) -> [f32; 4] {
    let cx = sigmoid_scalar(raw[0]) + col as f32;
    let cy = sigmoid_scalar(raw[1]) + row as f32;
    let w = anchor.width * raw[2].exp();
    let h = anchor.height * raw[3].exp();
    [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// Inverse of [`decode_offsets`]. The box center must lie strictly inside the cell.
pub fn encode_box(bbox: [f32; 4], anchor: Anchor, row: usize, col: usize) -> [f32; 4] {
    let [x1, y1, x2, y2] = bbox;
    let fx = (x1 + x2) / 2.0 - col as f32;
    let fy = (y1 + y2) / 2.0 - row as f32;
    [
        logit(fx),
        logit(fy),
        ((x2 - x1) / anchor.width).ln(),
        ((y2 - y1) / anchor.height).ln(),
    ]
}

pub fn sigmoid_scalar(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn logit(p: f32) -> f32 {
    (p / (1.0 - p)).ln()
}
