use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{DetectorError, Result};
use crate::model::anchors::validate_anchors;
use crate::model::loss::LossCoefficients;
use crate::model::nms::PostprocessConfig;
use crate::model::yolo::ModelConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Dataset
    pub data_yaml: String,
    pub img_size: usize,
    pub augment: bool,

    // Training
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,

    // Model
    pub model: ModelConfig,

    // Loss weights
    pub loss: LossCoefficients,

    // Inference
    pub postprocess: PostprocessConfig,

    // Early stopping
    pub patience: usize,
    pub min_delta: f32,

    // Checkpointing
    pub save_dir: String,
    pub save_interval: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data_yaml: "data/VOC/data.yaml".to_string(),
            img_size: 416,
            augment: true,
            epochs: 100,
            batch_size: 8,
            learning_rate: 0.001,
            weight_decay: 0.0005,
            model: ModelConfig::default(),
            loss: LossCoefficients::default(),
            postprocess: PostprocessConfig::default(),
            patience: 10,
            min_delta: 0.001,
            save_dir: "runs/train".to_string(),
            save_interval: 10,
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("img_size", self.img_size),
            ("epochs", self.epochs),
            ("batch_size", self.batch_size),
            ("save_interval", self.save_interval),
            ("model.num_classes", self.model.num_classes),
            ("model.backbone.width_divisor", self.model.backbone.width_divisor),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(DetectorError::invalid(format!("{name} must be at least 1")));
            }
        }

        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(DetectorError::invalid(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(DetectorError::invalid(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if !(self.min_delta.is_finite() && self.min_delta >= 0.0) {
            return Err(DetectorError::invalid(format!(
                "min_delta must be non-negative, got {}",
                self.min_delta
            )));
        }

        validate_anchors(&self.model.anchors)?;
        self.loss.validate()?;
        self.postprocess.validate()?;
        Ok(())
    }
}
