use burn::module::Ignored;
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::model::blocks::{ConvBnLeaky, Reorg};

/// One layer of a Darknet-style network description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LayerSpec {
    Conv { filters: usize, size: usize },
    MaxPool,
    /// Re-emits earlier outputs by relative offset (-1 is the previous layer),
    /// concatenated along channels.
    Route { layers: Vec<isize> },
    Reorg { stride: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarknetConfig {
    pub in_channels: usize,
    /// Divides every conv filter count (minimum 1 filter). 1 keeps the full network.
    pub width_divisor: usize,
    pub layers: Vec<LayerSpec>,
}

impl Default for DarknetConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            width_divisor: 1,
            layers: darknet19_layers(),
        }
    }
}

impl DarknetConfig {
    pub fn with_width_divisor(mut self, width_divisor: usize) -> Self {
        self.width_divisor = width_divisor;
        self
    }
}

/// Darknet-19 feature extractor with the YOLOv2 passthrough (route -9, reorg, route -1,-4).
pub fn darknet19_layers() -> Vec<LayerSpec> {
    use LayerSpec::*;

    let conv = |filters, size| Conv { filters, size };
    vec![
        conv(32, 3),
        MaxPool,
        conv(64, 3),
        MaxPool,
        conv(128, 3),
        conv(64, 1),
        conv(128, 3),
        MaxPool,
        conv(256, 3),
        conv(128, 1),
        conv(256, 3),
        MaxPool,
        conv(512, 3),
        conv(256, 1),
        conv(512, 3),
        conv(256, 1),
        conv(512, 3),
        MaxPool,
        conv(1024, 3),
        conv(512, 1),
        conv(1024, 3),
        conv(512, 1),
        conv(1024, 3),
        conv(1024, 3),
        conv(1024, 3),
        Route { layers: vec![-9] },
        conv(64, 1),
        Reorg { stride: 2 },
        Route {
            layers: vec![-1, -4],
        },
        conv(1024, 3),
    ]
}

#[derive(Debug, Clone)]
enum Stage {
    Conv(usize),
    MaxPool,
    Route(Vec<usize>),
    Reorg(Reorg),
}

/// Compute graph over an arena of stage outputs. Each stage reads the previous
/// output or, for routes, the stored outputs of the stages it names.
#[derive(Module, Debug)]
pub struct Backbone<B: Backend> {
    convs: Vec<ConvBnLeaky<B>>,
    pool: MaxPool2d,
    stages: Ignored<Vec<Stage>>,
    /// Stage outputs that some route reads later.
    retained: Ignored<Vec<bool>>,
    out_channels: usize,
    stride: usize,
    /// Input height and width must be multiples of this.
    input_multiple: usize,
}

impl<B: Backend> Backbone<B> {
    pub fn new(device: &B::Device, config: &DarknetConfig) -> Result<Self> {
        if config.layers.is_empty() {
            return Err(DetectorError::invalid("backbone needs at least one layer"));
        }
        if config.width_divisor == 0 || config.in_channels == 0 {
            return Err(DetectorError::invalid(
                "backbone in_channels and width_divisor must be positive",
            ));
        }

        let n = config.layers.len();
        let mut convs = Vec::new();
        let mut stages = Vec::with_capacity(n);
        let mut retained = vec![false; n];
        // (channels, downsample factor) after each stage
        let mut shapes: Vec<(usize, usize)> = Vec::with_capacity(n);
        let mut input_multiple = 1;

        for (i, layer) in config.layers.iter().enumerate() {
            let (channels, scale) = shapes.last().copied().unwrap_or((config.in_channels, 1));

            let (stage, shape) = match layer {
                LayerSpec::Conv { filters, size } => {
                    if *filters == 0 || *size == 0 || size % 2 == 0 {
                        return Err(DetectorError::invalid(format!(
                            "layer {i}: conv needs filters > 0 and an odd kernel size"
                        )));
                    }
                    let out = (filters / config.width_divisor).max(1);
                    convs.push(ConvBnLeaky::new(device, channels, out, *size, 1));
                    (Stage::Conv(convs.len() - 1), (out, scale))
                }
                LayerSpec::MaxPool => {
                    input_multiple = input_multiple.max(scale * 2);
                    (Stage::MaxPool, (channels, scale * 2))
                }
                LayerSpec::Route { layers } => {
                    if layers.is_empty() {
                        return Err(DetectorError::invalid(format!(
                            "layer {i}: route needs at least one source"
                        )));
                    }
                    let mut sources = Vec::with_capacity(layers.len());
                    let mut total = 0;
                    let mut route_scale = None;
                    for &offset in layers {
                        let source = i as isize + offset;
                        if offset >= 0 || source < 0 {
                            return Err(DetectorError::invalid(format!(
                                "layer {i}: route offset {offset} does not name an earlier layer"
                            )));
                        }
                        let source = source as usize;
                        let (c, s) = shapes[source];
                        if *route_scale.get_or_insert(s) != s {
                            return Err(DetectorError::invalid(format!(
                                "layer {i}: routed layers have different resolutions"
                            )));
                        }
                        retained[source] = true;
                        total += c;
                        sources.push(source);
                    }
                    let s = route_scale.unwrap_or(scale);
                    (Stage::Route(sources), (total, s))
                }
                LayerSpec::Reorg { stride } => {
                    if *stride == 0 {
                        return Err(DetectorError::invalid(format!(
                            "layer {i}: reorg stride must be positive"
                        )));
                    }
                    input_multiple = input_multiple.max(scale * stride);
                    (
                        Stage::Reorg(Reorg::new(*stride)),
                        (channels * stride * stride, scale * stride),
                    )
                }
            };
            stages.push(stage);
            shapes.push(shape);
        }

        let (out_channels, stride) = shapes[n - 1];
        log::info!(
            "Backbone init: {} stages, {} convs, out_channels = {}, stride = {}",
            n,
            convs.len(),
            out_channels,
            stride
        );

        Ok(Self {
            convs,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            stages: Ignored(stages),
            retained: Ignored(retained),
            out_channels,
            stride,
            input_multiple,
        })
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Input pixels per output cell.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn input_multiple(&self) -> usize {
        self.input_multiple
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut arena: Vec<Option<Tensor<B, 4>>> = Vec::with_capacity(self.stages.len());
        let mut x = x;

        for (i, stage) in self.stages.iter().enumerate() {
            x = match stage {
                Stage::Conv(c) => self.convs[*c].forward(x),
                Stage::MaxPool => self.pool.forward(x),
                Stage::Reorg(reorg) => reorg.forward(x),
                Stage::Route(sources) => {
                    let routed: Vec<Tensor<B, 4>> = sources
                        .iter()
                        .filter_map(|&s| arena[s].clone())
                        .collect();
                    Tensor::cat(routed, 1)
                }
            };
            arena.push(self.retained[i].then(|| x.clone()));
        }

        x
    }
}
