use thiserror::Error;

pub type Result<T> = std::result::Result<T, DetectorError>;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("malformed ground truth (image {image}, object {object}): {reason}")]
    MalformedGroundTruth {
        image: usize,
        object: usize,
        reason: String,
    },

    #[error("prediction {index} of image {image} is marked positive but no ground truth is assigned to it")]
    Assignment { image: usize, index: usize },

    #[error("mask value {value} of prediction {index} in image {image} is outside [0, 1]")]
    InvalidMask { image: usize, index: usize, value: f32 },

    #[error("tensor data error: {0}")]
    TensorData(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("config file error: {0}")]
    Config(#[from] serde_yaml::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DetectorError {
    pub fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}
