pub mod dataloader;
pub mod dataset;
pub mod transforms;

pub use dataloader::{build_targets, YoloBatch, YoloDataLoader};
pub use dataset::{BoundingBox, DataConfig, YoloDataset};
pub use transforms::DataAugmentation;
