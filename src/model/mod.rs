pub mod anchors;
pub mod assign;
pub mod backbone;
pub mod blocks;
pub mod head;
pub mod loss;
pub mod nms;
pub mod yolo;

pub use anchors::{voc_anchors, Anchor};
pub use assign::{assign_targets, GroundTruth};
pub use backbone::{Backbone, DarknetConfig, LayerSpec};
pub use blocks::{GridShape, RegionDecoder, RegionOutput};
pub use head::DetectionHead;
pub use loss::{LossCoefficients, YoloLoss};
pub use nms::{BBox, Detection, PostprocessConfig, Postprocessor, NMS};
pub use yolo::{ModelConfig, YoloV2};
