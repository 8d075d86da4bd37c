use crate::data::{DataAugmentation, YoloDataLoader, YoloDataset};
use crate::error::{DetectorError, Result};
use crate::model::loss::{LossBreakdown, YoloLoss};
use crate::model::yolo::{ModelConfig, YoloV2};
use crate::training::{EarlyStopping, LossMeter, TrainingConfig};
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::decay::WeightDecayConfig;
use burn::optim::{Adam, AdamConfig, GradientsParams, Optimizer};
use burn::prelude::*;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Builds a model from `config` and loads weights saved by [`Trainer::save_checkpoint`].
/// `path` is the checkpoint directory or its `model` file (extension optional).
pub fn load_model<B: Backend>(config: &ModelConfig, path: impl AsRef<Path>, device: &B::Device) -> Result<YoloV2<B>> {
    let path = path.as_ref();
    let file = if path.is_dir() { path.join("model") } else { path.with_extension("") };

    let model = YoloV2::new(device, config)?;
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder
        .load(file.clone(), device)
        .map_err(|e| DetectorError::Checkpoint(format!("loading {}: {:?}", file.display(), e)))?;

    log::info!("Loaded weights from {}", file.display());
    Ok(model.load_record(record))
}

pub struct Trainer<B: AutodiffBackend> {
    pub model: YoloV2<B>,
    loss_fn: YoloLoss,
    config: TrainingConfig,
    device: B::Device,
    early_stopping: EarlyStopping,
    optimizer: OptimizerAdaptor<Adam, YoloV2<B>, B>,
}

impl<B: AutodiffBackend> Trainer<B> {
    pub fn new(config: TrainingConfig, device: B::Device) -> Result<Self> {
        config.validate()?;

        let model = YoloV2::new(&device, &config.model)?;
        let loss_fn = YoloLoss::new(config.model.anchors.clone(), config.model.num_classes, config.loss)?;
        let early_stopping = EarlyStopping::new(config.patience, config.min_delta);

        let optimizer = AdamConfig::new()
            .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
            .init();

        Ok(Self {
            model,
            loss_fn,
            config,
            device,
            early_stopping,
            optimizer,
        })
    }

    /// Continue from saved weights.
    pub fn with_checkpoint(mut self, path: impl AsRef<Path>) -> Result<Self> {
        self.model = load_model(&self.config.model, path, &self.device)?;
        Ok(self)
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn train(&mut self) -> anyhow::Result<()> {
        log::info!("Starting YOLOv2 training");

        let train_dataset = YoloDataset::new(&self.config.data_yaml, "train", self.config.img_size)?;
        let val_dataset = YoloDataset::new(&self.config.data_yaml, "val", self.config.img_size)?;

        if train_dataset.num_classes != self.config.model.num_classes {
            anyhow::bail!(
                "data.yaml declares {} classes but the model is configured for {}",
                train_dataset.num_classes,
                self.config.model.num_classes
            );
        }
        if self.config.img_size % self.model.backbone.input_multiple() != 0 {
            anyhow::bail!(
                "img_size {} must be a multiple of {}",
                self.config.img_size,
                self.model.backbone.input_multiple()
            );
        }

        log::info!("Dataset loaded:");
        log::info!("  Train: {} images", train_dataset.len());
        log::info!("  Val: {} images", val_dataset.len());

        std::fs::create_dir_all(&self.config.save_dir)?;
        self.config.save(Path::new(&self.config.save_dir).join("train_config.yaml"))?;

        let pb = ProgressBar::new(self.config.epochs as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?,
        );

        for epoch in 1..=self.config.epochs {
            let epoch_start = Instant::now();

            let train_loss = self.train_epoch(&train_dataset);
            let val_loss = self.validate_epoch(&val_dataset);

            pb.set_message(format!(
                "Epoch {}: Train={:.4}, Val={:.4}",
                epoch, train_loss, val_loss
            ));
            pb.inc(1);
            log::info!(
                "Epoch {}/{}: train loss {:.4}, val loss {:.4} ({:.2}s)",
                epoch,
                self.config.epochs,
                train_loss,
                val_loss,
                epoch_start.elapsed().as_secs_f32()
            );

            if !val_loss.is_finite() {
                log::warn!("Validation loss is NaN/Inf - skipping checkpoint and early stopping");
            } else if self.early_stopping.is_improvement(val_loss) {
                log::info!("Validation loss improved! Saving best checkpoint...");
                self.save_checkpoint("best")?;
            }

            if epoch % self.config.save_interval == 0 {
                self.save_checkpoint(&format!("epoch_{}", epoch))?;
            }

            if val_loss.is_finite() && self.early_stopping.should_stop(val_loss) {
                log::info!("Early stopping at epoch {}", epoch);
                break;
            }
        }

        self.save_checkpoint("final")?;

        pb.finish_with_message("Training completed!");
        log::info!("Checkpoints saved in: {}", self.config.save_dir);
        Ok(())
    }

    /// One optimizer step. Returns `None` when the loss is not finite, in which
    /// case the weights are left untouched.
    pub fn train_step(
        &mut self,
        images: Tensor<B, 4>,
        ground_truth: Tensor<B, 3>,
        masks: Tensor<B, 2>,
    ) -> Result<Option<(f32, LossBreakdown)>> {
        let output = self.model.forward(images)?;
        let terms = self.loss_fn.terms(&output, ground_truth, masks)?;
        let loss = terms.total(self.loss_fn.coefficients());

        let loss_value = loss.clone().into_scalar().elem::<f32>();
        if !loss_value.is_finite() {
            return Ok(None);
        }
        let breakdown = terms.breakdown();

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self
            .optimizer
            .step(self.config.learning_rate, self.model.clone(), grads);

        Ok(Some((loss_value, breakdown)))
    }

    fn train_epoch(&mut self, dataset: &YoloDataset) -> f32 {
        let dataloader: YoloDataLoader<B> = YoloDataLoader::new(
            dataset.clone(),
            self.config.batch_size,
            true,
            self.model.stride(),
            self.config.model.anchors.clone(),
            self.device.clone(),
        )
        .with_augmentation(DataAugmentation::new(self.config.augment));

        let mut meter = LossMeter::new();

        for (batch_idx, batch) in dataloader.enumerate() {
            match self.train_step(batch.images, batch.ground_truth, batch.masks) {
                Ok(Some((loss_value, terms))) => {
                    meter.update(loss_value, terms);
                    if (batch_idx + 1) % 10 == 0 {
                        log::info!("  Batch {}: loss={:.4}", batch_idx + 1, loss_value);
                    }
                }
                Ok(None) => log::warn!("NaN/Inf loss detected at batch {}", batch_idx + 1),
                Err(e) => log::warn!("Skipping batch {}: {}", batch_idx + 1, e),
            }
        }

        log::debug!("Train loss terms: {:?}", meter.mean_terms());
        meter.epoch_loss("training")
    }

    fn validate_epoch(&self, dataset: &YoloDataset) -> f32 {
        let dataloader: YoloDataLoader<B::InnerBackend> = YoloDataLoader::new(
            dataset.clone(),
            self.config.batch_size,
            false,
            self.model.stride(),
            self.config.model.anchors.clone(),
            self.device.clone(),
        );

        let valid_model = self.model.valid();
        let mut meter = LossMeter::new();

        for (batch_idx, batch) in dataloader.enumerate() {
            let terms = valid_model
                .forward(batch.images)
                .and_then(|output| self.loss_fn.terms(&output, batch.ground_truth, batch.masks));

            match terms {
                Ok(terms) => {
                    let loss = terms
                        .total(self.loss_fn.coefficients())
                        .into_scalar()
                        .elem::<f32>();
                    if loss.is_finite() {
                        meter.update(loss, terms.breakdown());
                    } else {
                        log::warn!("NaN in validation batch {} - skipping", batch_idx + 1);
                    }
                }
                Err(e) => log::warn!("Skipping validation batch {}: {}", batch_idx + 1, e),
            }
        }

        log::debug!(
            "Validation completed: {} valid batches, terms {:?}",
            meter.count(),
            meter.mean_terms()
        );

        meter.epoch_loss("validation")
    }

    /// Writes `<save_dir>/<name>/model.bin` and the training config next to it.
    pub fn save_checkpoint(&self, name: &str) -> Result<PathBuf> {
        let checkpoint_dir = Path::new(&self.config.save_dir).join(name);
        std::fs::create_dir_all(&checkpoint_dir)?;

        let record = self.model.clone().into_record();
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        recorder
            .record(record, checkpoint_dir.join("model"))
            .map_err(|e| DetectorError::Checkpoint(format!("Failed to save model: {:?}", e)))?;

        let config_path = checkpoint_dir.join("config.json");
        let config_json = serde_json::to_string_pretty(&self.config)
            .map_err(|e| DetectorError::Checkpoint(e.to_string()))?;
        std::fs::write(&config_path, config_json)?;

        log::info!("Checkpoint '{}' saved to {}", name, checkpoint_dir.display());
        Ok(checkpoint_dir)
    }
}
