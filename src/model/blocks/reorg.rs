use burn::prelude::*;

/// Space-to-depth: moves `stride` x `stride` spatial blocks into channels.
/// [B, C, H, W] -> [B, C*stride*stride, H/stride, W/stride]
#[derive(Module, Debug, Clone)]
pub struct Reorg {
    stride: usize,
}

impl Reorg {
    pub fn new(stride: usize) -> Self {
        Self { stride }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn forward<B: Backend>(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let s = self.stride;
        let [batch, channels, height, width] = x.dims();

        // [B, C, H/s, s, W/s, s] -> [B, s, s, C, H/s, W/s]
        let x: Tensor<B, 6> = x.reshape([batch, channels, height / s, s, width / s, s]);
        let x = x.permute([0, 3, 5, 1, 2, 4]);

        x.reshape([batch, channels * s * s, height / s, width / s])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_reorg_shape() {
        let device = Default::default();
        let x = Tensor::<NdArray, 4>::zeros([2, 3, 8, 6], &device);
        assert_eq!(Reorg::new(2).forward(x).dims(), [2, 12, 4, 3]);
    }

    #[test]
    fn test_reorg_moves_blocks_into_channels() {
        let device = Default::default();
        // one channel, 2x2 image: [[1, 2], [3, 4]]
        let x = Tensor::<NdArray, 4>::from_data(
            TensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 1, 2, 2]),
            &device,
        );
        let y = Reorg::new(2).forward(x);
        assert_eq!(y.dims(), [1, 4, 1, 1]);

        // channel order follows the (dy, dx) offset inside each block
        let values = y.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_reorg_preserves_values() {
        let device = Default::default();
        let data: Vec<f32> = (0..2 * 4 * 4).map(|v| v as f32).collect();
        let x = Tensor::<NdArray, 4>::from_data(TensorData::new(data, [1, 2, 4, 4]), &device);
        let y = Reorg::new(2).forward(x.clone());

        let mut before = x.into_data().to_vec::<f32>().unwrap();
        let mut after = y.into_data().to_vec::<f32>().unwrap();
        before.sort_by(|a, b| a.partial_cmp(b).unwrap());
        after.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(before, after);
    }
}
