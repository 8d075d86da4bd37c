use burn::backend::{Autodiff, NdArray};
use clap::Parser;
use std::path::PathBuf;

use yolov2_detection::training::{Trainer, TrainingConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Train YOLOv2 on a YOLO-format dataset")]
struct Args {
    /// Training config; a default one is written here if missing
    #[arg(short, long, default_value = "configs/train_config.yaml")]
    config: PathBuf,

    /// Override the dataset yaml
    #[arg(long)]
    data: Option<String>,

    /// Override the number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Resume from a checkpoint directory
    #[arg(long)]
    resume: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();

    type MyBackend = NdArray;
    type MyAutodiffBackend = Autodiff<MyBackend>;
    let device = Default::default();

    let mut config = if args.config.exists() {
        log::info!("Loading config from {}", args.config.display());
        TrainingConfig::from_yaml(&args.config)?
    } else {
        let config = TrainingConfig::default();
        if let Some(dir) = args.config.parent() {
            std::fs::create_dir_all(dir)?;
        }
        config.save(&args.config)?;
        log::info!("Created default config at {}", args.config.display());
        config
    };
    if let Some(data) = args.data {
        config.data_yaml = data;
    }
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }

    log::info!("Training Configuration:");
    log::info!("  Dataset YAML: {}", config.data_yaml);
    log::info!("  Epochs: {}", config.epochs);
    log::info!("  Batch size: {}", config.batch_size);
    log::info!("  Learning rate: {}", config.learning_rate);
    log::info!("  Image size: {}x{}", config.img_size, config.img_size);
    log::info!("  Classes: {}, anchors: {}", config.model.num_classes, config.model.anchors.len());
    log::info!("  Save dir: {}", config.save_dir);

    let mut trainer = Trainer::<MyAutodiffBackend>::new(config, device)?;
    if let Some(checkpoint) = &args.resume {
        trainer = trainer.with_checkpoint(checkpoint)?;
    }

    if let Err(e) = trainer.train() {
        log::error!("Training failed: {:#}", e);
        return Err(e);
    }
    log::info!("Training completed successfully!");
    Ok(())
}
