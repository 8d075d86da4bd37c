use burn::module::Ignored;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::*;

use crate::error::{DetectorError, Result};
use crate::model::anchors::{validate_anchors, Anchor};
use crate::model::blocks::{RegionDecoder, RegionOutput};

/// 1x1 projection to `A * (5 + C)` channels followed by the region decoder.
#[derive(Module, Debug)]
pub struct DetectionHead<B: Backend> {
    pred: Conv2d<B>,
    decoder: Ignored<RegionDecoder>,
}

impl<B: Backend> DetectionHead<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        anchors: Vec<Anchor>,
        num_classes: usize,
    ) -> Result<Self> {
        validate_anchors(&anchors)?;
        if num_classes == 0 {
            return Err(DetectorError::invalid("num_classes must be at least 1"));
        }

        let decoder = RegionDecoder::new(anchors, num_classes);
        let pred_channels = decoder.channels();

        log::info!("DetectionHead init:");
        log::info!("  num_anchors = {}", decoder.anchors().len());
        log::info!("  num_classes = {}", num_classes);
        log::info!(
            "  pred_channels = {} x (5 + {}) = {}",
            decoder.anchors().len(),
            num_classes,
            pred_channels
        );

        Ok(Self {
            pred: Conv2dConfig::new([in_channels, pred_channels], [1, 1]).init(device),
            decoder: Ignored(decoder),
        })
    }

    pub fn decoder(&self) -> &RegionDecoder {
        &self.decoder
    }

    pub fn num_classes(&self) -> usize {
        self.decoder.num_classes()
    }

    /// Raw activations `[B, A*(5+C), H, W]`.
    pub fn forward_raw(&self, features: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pred.forward(features)
    }

    pub fn forward(&self, features: Tensor<B, 4>) -> Result<RegionOutput<B>> {
        let raw = self.forward_raw(features);
        log::debug!("DetectionHead raw output: {:?}", raw.dims());
        self.decoder.decode(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_head_output_layout() {
        let device = Default::default();
        let anchors = vec![Anchor::new(1.0, 1.0), Anchor::new(2.0, 3.0), Anchor::new(4.0, 2.0)];
        let head = DetectionHead::<NdArray>::new(&device, 16, anchors, 4).unwrap();

        let features = Tensor::<NdArray, 4>::ones([2, 16, 5, 7], &device);
        assert_eq!(head.forward_raw(features.clone()).dims(), [2, 27, 5, 7]);

        let out = head.forward(features).unwrap();
        assert_eq!(out.predictions.dims(), [2, 5 * 7 * 3, 9]);
        assert_eq!(out.grid.len(), 105);
    }

    #[test]
    fn test_head_rejects_bad_config() {
        let device = Default::default();
        assert!(DetectionHead::<NdArray>::new(&device, 8, vec![], 2).is_err());
        assert!(DetectionHead::<NdArray>::new(&device, 8, vec![Anchor::new(1.0, 1.0)], 0).is_err());
    }
}
