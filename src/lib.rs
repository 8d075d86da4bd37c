pub mod data;
pub mod error;
pub mod model;
pub mod training;
pub mod visualize;

// Re-exports for convenience
pub use data::{BoundingBox, DataConfig, YoloDataLoader, YoloDataset};
pub use error::{DetectorError, Result};
pub use model::{
    Anchor, BBox, Detection, LossCoefficients, ModelConfig, PostprocessConfig, Postprocessor,
    YoloLoss, YoloV2,
};
pub use training::{EarlyStopping, Trainer, TrainingConfig};
