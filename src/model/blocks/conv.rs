use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;

const LEAKY_SLOPE: f64 = 0.1;

/// Darknet convolution block: conv (no bias) -> batch norm -> leaky ReLU(0.1).
#[derive(Module, Debug)]
pub struct ConvBnLeaky<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBnLeaky<B> {
    pub fn new(
        device: &B::Device,
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
    ) -> Self {
        let padding = kernel_size / 2;

        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_bias(false)
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        activation::leaky_relu(x, LEAKY_SLOPE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_same_padding_keeps_spatial_size() {
        let device = Default::default();
        let block = ConvBnLeaky::<NdArray>::new(&device, 3, 8, 3, 1);
        let x = Tensor::<NdArray, 4>::zeros([2, 3, 10, 12], &device);
        assert_eq!(block.forward(x).dims(), [2, 8, 10, 12]);

        let pointwise = ConvBnLeaky::<NdArray>::new(&device, 8, 4, 1, 1);
        let x = Tensor::<NdArray, 4>::zeros([1, 8, 5, 5], &device);
        assert_eq!(pointwise.forward(x).dims(), [1, 4, 5, 5]);
    }
}
