use anyhow::Context;
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::NdArray;
use burn::prelude::*;
use clap::Parser;
use image::GenericImageView;
use std::path::{Path, PathBuf};

use yolov2_detection::data::dataset::image_to_chw;
use yolov2_detection::data::DataConfig;
use yolov2_detection::model::{Detection, PostprocessConfig, Postprocessor, YoloV2};
use yolov2_detection::training::{load_model, TrainingConfig};
use yolov2_detection::visualize::draw_detections;

#[derive(Parser, Debug)]
#[command(author, version, about = "YOLOv2 inference on a single image")]
struct Args {
    /// Path to input image
    #[arg(short, long)]
    image: PathBuf,

    /// Checkpoint directory (e.g. runs/train/best). Without it the network runs with random weights.
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Training config, used when the checkpoint has no config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Confidence threshold (defaults to the config value)
    #[arg(short, long)]
    conf: Option<f32>,

    /// IoU threshold for NMS (defaults to the config value)
    #[arg(long)]
    iou: Option<f32>,

    /// data.yaml providing class names
    #[arg(long)]
    data: Option<PathBuf>,

    /// Write detections as JSON to this path
    #[arg(long)]
    json: Option<PathBuf>,

    /// Save a copy of the image with the detected boxes drawn on it
    #[arg(short, long)]
    save: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<TrainingConfig> {
    if let Some(weights) = &args.weights {
        let path = weights.join("config.json");
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: TrainingConfig = serde_json::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.validate()?;
            return Ok(config);
        }
    }
    match &args.config {
        Some(path) => Ok(TrainingConfig::from_yaml(path)?),
        None => {
            log::warn!("No config found, using defaults");
            Ok(TrainingConfig::default())
        }
    }
}

/// Grid units -> pixels of the original image.
fn to_pixels(det: &Detection, stride: usize, img_size: usize, orig_w: u32, orig_h: u32) -> Detection {
    let sx = stride as f32 * orig_w as f32 / img_size as f32;
    let sy = stride as f32 * orig_h as f32 / img_size as f32;
    Detection {
        bbox: det.bbox.scale(sx, sy),
        ..det.clone()
    }
}

fn class_names(path: Option<&Path>) -> anyhow::Result<Vec<String>> {
    match path {
        Some(path) => Ok(DataConfig::from_yaml(path)?.names),
        None => Ok(Vec::new()),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    let mut post_config: PostprocessConfig = config.postprocess;
    if let Some(conf) = args.conf {
        post_config.conf_threshold = conf;
    }
    if let Some(iou) = args.iou {
        post_config.iou_threshold = iou;
    }
    let postprocessor = Postprocessor::new(post_config)?;

    type MyBackend = NdArray;
    let device = NdArrayDevice::default();

    let model: YoloV2<MyBackend> = match &args.weights {
        Some(weights) => load_model(&config.model, weights, &device)?,
        None => {
            log::warn!("No weights given, running an untrained network");
            YoloV2::new(&device, &config.model)?
        }
    };

    let img = image::open(&args.image).with_context(|| format!("opening {}", args.image.display()))?;
    let (orig_w, orig_h) = img.dimensions();
    let size = config.img_size;
    log::info!("Image {} ({}x{}) -> {}x{}", args.image.display(), orig_w, orig_h, size, size);

    let input = Tensor::<MyBackend, 4>::from_data(
        TensorData::new(image_to_chw(&img, size), [1, 3, size, size]),
        &device,
    );

    let start = std::time::Instant::now();
    let detections = model.predict(input, &postprocessor)?;
    log::info!("Inference completed in {:.2}ms", start.elapsed().as_secs_f64() * 1000.0);

    let detections: Vec<Detection> = detections
        .into_iter()
        .flatten()
        .map(|d| to_pixels(&d, model.stride(), size, orig_w, orig_h))
        .collect();

    let names = class_names(args.data.as_deref())?;
    if detections.is_empty() {
        println!("No objects detected! Try lowering the confidence threshold with --conf");
    } else {
        println!("Detected {} objects:", detections.len());
        for (i, det) in detections.iter().enumerate() {
            let name = names.get(det.class_id).map(String::as_str).unwrap_or("class");
            println!(
                "{}. {} #{} ({:.1}%) bbox [{:.0}, {:.0}, {:.0}, {:.0}]",
                i + 1,
                name,
                det.class_id,
                det.confidence * 100.0,
                det.bbox.x1,
                det.bbox.y1,
                det.bbox.x2,
                det.bbox.y2
            );
        }
    }

    if let Some(path) = &args.json {
        std::fs::write(path, serde_json::to_string_pretty(&detections)?)?;
        log::info!("Saved detections to {}", path.display());
    }

    if let Some(path) = &args.save {
        let mut canvas = img.to_rgb8();
        draw_detections(&mut canvas, &detections);
        canvas
            .save(path)
            .with_context(|| format!("saving {}", path.display()))?;
        log::info!("Saved annotated image to {}", path.display());
    }

    Ok(())
}
