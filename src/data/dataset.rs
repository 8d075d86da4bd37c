use anyhow::{Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::model::nms::BBox;

/// YOLO `data.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub path: Option<String>,
    pub train: String,
    pub val: String,
    #[serde(default)]
    pub test: Option<String>,
    pub nc: usize,
    pub names: Vec<String>,
}

impl DataConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: DataConfig = serde_yaml::from_str(&content)?;
        if config.names.len() != config.nc {
            anyhow::bail!(
                "data.yaml declares nc = {} but lists {} names",
                config.nc,
                config.names.len()
            );
        }
        Ok(config)
    }

    /// Image directory of a split, relative to the dataset root.
    pub fn split_dir(&self, split: &str) -> Result<&str> {
        match split.to_lowercase().as_str() {
            "train" => Ok(&self.train),
            "val" => Ok(&self.val),
            "test" => self
                .test
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("data.yaml has no test split")),
            _ => anyhow::bail!("Unknown split: {}. Use 'train', 'val' or 'test'", split),
        }
    }
}

/// One label line: class id and a normalized center-size box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub class_id: usize,
    pub x_center: f32,
    pub y_center: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Corner form in grid units.
    pub fn to_grid(&self, grid_width: usize, grid_height: usize) -> BBox {
        BBox::from_center(
            self.x_center * grid_width as f32,
            self.y_center * grid_height as f32,
            self.width * grid_width as f32,
            self.height * grid_height as f32,
        )
    }

    pub fn flip_horizontal(&self) -> Self {
        Self {
            x_center: 1.0 - self.x_center,
            ..*self
        }
    }
}

/// Parses YOLO label text. Lines that are malformed, out of range or name an
/// unknown class are skipped with a warning.
pub fn parse_labels(content: &str, source: &Path, num_classes: usize) -> Vec<BoundingBox> {
    let mut boxes = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let parsed = match parts.as_slice() {
            [c, x, y, w, h, ..] => match (
                c.parse::<usize>(),
                x.parse::<f32>(),
                y.parse::<f32>(),
                w.parse::<f32>(),
                h.parse::<f32>(),
            ) {
                (Ok(class_id), Ok(x_center), Ok(y_center), Ok(width), Ok(height)) => {
                    Some(BoundingBox {
                        class_id,
                        x_center,
                        y_center,
                        width,
                        height,
                    })
                }
                _ => None,
            },
            _ => None,
        };

        match parsed {
            Some(b) if is_valid(&b, num_classes) => boxes.push(b),
            _ => log::warn!("Invalid label in {}: {}", source.display(), line),
        }
    }

    boxes
}

fn is_valid(b: &BoundingBox, num_classes: usize) -> bool {
    let unit = |v: f32| (0.0..=1.0).contains(&v);
    b.class_id < num_classes
        && unit(b.x_center)
        && unit(b.y_center)
        && b.width > 0.0
        && b.height > 0.0
        && b.width <= 1.0
        && b.height <= 1.0
}

/// Resize to `size` x `size` RGB, scaled to [0, 1], channel-major.
pub fn image_to_chw(img: &DynamicImage, size: usize) -> Vec<f32> {
    let rgb = img
        .resize_exact(size as u32, size as u32, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let mut values = Vec::with_capacity(3 * size * size);
    for c in 0..3 {
        for y in 0..size {
            for x in 0..size {
                values.push(rgb.get_pixel(x as u32, y as u32)[c] as f32 / 255.0);
            }
        }
    }
    values
}

#[derive(Clone)]
pub struct YoloDataset {
    samples: Vec<(PathBuf, PathBuf)>,
    pub num_classes: usize,
    pub class_names: Vec<String>,
    pub img_size: usize,
}

impl YoloDataset {
    /// Loads a split described by `data.yaml`:
    /// ```text
    /// dataset/
    /// ├── images/{train,val,test}/
    /// ├── labels/{train,val,test}/
    /// └── data.yaml
    /// ```
    pub fn new(yaml_path: impl AsRef<Path>, split: &str, img_size: usize) -> Result<Self> {
        let yaml_path = yaml_path.as_ref();
        let config = DataConfig::from_yaml(yaml_path)?;

        let mut root = yaml_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        if let Some(path) = &config.path {
            if Path::new(path).is_absolute() {
                root = PathBuf::from(path);
            }
        }

        let img_dir = root.join(config.split_dir(split)?);
        let label_dir = root.join(labels_dir_for(Path::new(config.split_dir(split)?)));

        if !img_dir.exists() {
            anyhow::bail!("Image directory not found: {}", img_dir.display());
        }
        if !label_dir.exists() {
            anyhow::bail!("Label directory not found: {}", label_dir.display());
        }

        let mut samples = Vec::new();
        for entry in WalkDir::new(&img_dir)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let img_path = entry.path();
            if !img_path.is_file() || !is_image(img_path) {
                continue;
            }
            let Some(stem) = img_path.file_stem() else {
                continue;
            };

            let label_path = label_dir.join(stem).with_extension("txt");
            if label_path.exists() {
                samples.push((img_path.to_path_buf(), label_path));
            } else {
                log::warn!("Label not found for {}", img_path.display());
            }
        }

        log::info!("Loaded {} {} samples from {}", samples.len(), split, img_dir.display());

        if samples.is_empty() {
            anyhow::bail!(
                "No samples found in {}. Check if images and labels exist.",
                img_dir.display()
            );
        }

        Ok(Self {
            samples,
            num_classes: config.nc,
            class_names: config.names,
            img_size,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, idx: usize) -> Result<(DynamicImage, Vec<BoundingBox>)> {
        let (img_path, label_path) = self.samples.get(idx).ok_or_else(|| {
            anyhow::anyhow!(
                "Index {} out of bounds. Dataset has {} samples",
                idx,
                self.samples.len()
            )
        })?;

        let img = image::open(img_path).with_context(|| format!("opening {}", img_path.display()))?;
        let content = std::fs::read_to_string(label_path)?;

        Ok((img, parse_labels(&content, label_path, self.num_classes)))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

/// `images/train` -> `labels/train`: the last `images` component is swapped.
fn labels_dir_for(images: &Path) -> PathBuf {
    let components: Vec<Component> = images.components().collect();
    let swap_at = components
        .iter()
        .rposition(|c| c.as_os_str() == "images");

    match swap_at {
        Some(at) => components
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if i == at {
                    PathBuf::from("labels")
                } else {
                    PathBuf::from(c.as_os_str())
                }
            })
            .collect(),
        None => images.join("labels"),
    }
}
