//! A densely connected classifier. Every layer of a dense block sees the
//! concatenation of the block input and all previous layer outputs, and adds
//! `growth_rate` new features of its own. Transition layers between blocks
//! compress the feature count, the head maps the final features to logits.
//!
//! Layers are fully connected, the images are flattened (after an optional
//! 2x2 average pool) before entering the stem. Every hidden layer is
//! linear, batch norm, relu.
use std::fmt::Display;
use std::str::FromStr;

use anyhow::{Error, Result};
use derivative::Derivative;
use ndarray::prelude::*;
use ndarray::concatenate;
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::{BatchStatistics, Gradients, Model};
use crate::configs::ConfigError;
use crate::datasets::DataFormat;
use crate::nn::activations::{drelu, dropout_mask, relu};
use crate::nn::pool::avg_pool2x2;
use crate::nn::linear::LinearGrads;
use crate::nn::norm::BatchNormCache;
use crate::nn::{cast, BatchNorm, Float, Linear};

/// How the number of layers in each dense block is decided
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    /// derive the block sizes from the total depth
    #[default]
    FromDepth,
    /// take the block sizes as given
    FromList,
}

impl FromStr for BuildMode {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "from_depth" => Ok(BuildMode::FromDepth),
            "from_list" => Ok(BuildMode::FromList),
            _ => Err(ConfigError::UnknownBuildMode(s.to_string())),
        }
    }
}

impl Display for BuildMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildMode::FromDepth => write!(f, "from_depth"),
            BuildMode::FromList => write!(f, "from_list"),
        }
    }
}

#[derive(Derivative, Serialize, Deserialize, Clone, Debug, PartialEq)]
#[derivative(Default)]
pub struct DenseNetParams {
    pub mode: BuildMode,
    #[derivative(Default(value = "12"))]
    pub growth_rate: usize,
    #[derivative(Default(value = "10"))]
    pub output_classes: usize,
    #[derivative(Default(value = "Some(40)"))]
    pub depth_of_model: Option<usize>,
    #[derivative(Default(value = "Some(3)"))]
    pub num_of_blocks: Option<usize>,
    pub num_layers_in_each_block: Option<Vec<usize>>,
    pub data_format: DataFormat,
    #[derivative(Default(value = "true"))]
    pub bottleneck: bool,
    #[derivative(Default(value = "0.5"))]
    pub compression: f32,
    #[derivative(Default(value = "1e-4"))]
    pub weight_decay: f32,
    pub dropout_rate: f32,
    pub pool_initial: bool,
    #[derivative(Default(value = "true"))]
    pub include_top: bool,
}

impl DenseNetParams {
    /// Number of dense layers in every block
    pub fn layers_per_block(&self) -> Result<Vec<usize>, ConfigError> {
        match self.mode {
            BuildMode::FromDepth => {
                let depth = self.depth_of_model.ok_or(ConfigError::MissingDepth)?;
                let blocks = self.num_of_blocks.ok_or(ConfigError::MissingBlocks)?;
                if depth < 4 || (depth - 4) % 3 != 0 {
                    return Err(ConfigError::InvalidDepth(depth));
                }
                let mut layers = (depth - 4) / 3;
                if self.bottleneck {
                    layers /= 2;
                }
                Ok(vec![layers; blocks])
            }
            BuildMode::FromList => {
                let list = self
                    .num_layers_in_each_block
                    .clone()
                    .ok_or(ConfigError::MissingBlockList)?;
                if let Some(blocks) = self.num_of_blocks {
                    if blocks != list.len() {
                        return Err(ConfigError::BlockListLength { expected: blocks, got: list.len() });
                    }
                }
                Ok(list)
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.growth_rate == 0 {
            return Err(ConfigError::NotPositive("growth_rate"));
        }
        if self.output_classes == 0 {
            return Err(ConfigError::NotPositive("output_classes"));
        }
        if !(self.compression > 0.0 && self.compression <= 1.0) {
            return Err(ConfigError::OutOfRange { name: "compression", value: self.compression, low: 0.0, high: 1.0 });
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ConfigError::OutOfRange { name: "dropout_rate", value: self.dropout_rate, low: 0.0, high: 1.0 });
        }
        if !(self.weight_decay >= 0.0) {
            return Err(ConfigError::OutOfRange { name: "weight_decay", value: self.weight_decay, low: 0.0, high: f32::INFINITY });
        }
        self.layers_per_block()?;
        Ok(())
    }

    /// Builds the network for images of shape (height, width, channels)
    pub fn build<A: Float, R: Rng + ?Sized>(&self, image_shape: [usize; 3], rng: &mut R) -> Result<DenseNet<A>> {
        self.validate()?;
        if !self.include_top {
            return Err(ConfigError::NoClassifierHead.into());
        }
        let [h, w, c] = image_shape;
        let input_features = if self.pool_initial { (h / 2) * (w / 2) * c } else { h * w * c };
        if input_features == 0 {
            return Err(Error::msg(format!("image shape {image_shape:?} has no pixels")));
        }

        let mut units = Vec::new();
        // hidden layers carry no bias, the normalization shift replaces it
        let mut push = |name: String, linear: Linear<A>, normalized: bool| {
            let norm = normalized.then(|| BatchNorm::new(linear.out_dim()));
            units.push(Unit { name, linear, norm });
            units.len() - 1
        };

        let g = self.growth_rate;
        let mut features = 2 * g;
        let stem = push("stem".to_string(), Linear::new(input_features, features, false, rng), true);

        let block_sizes = self.layers_per_block()?;
        let num_blocks = block_sizes.len();
        let mut blocks = Vec::with_capacity(num_blocks);
        for (b, n_layers) in block_sizes.into_iter().enumerate() {
            let mut dense = Vec::with_capacity(n_layers);
            for l in 0..n_layers {
                let (bottleneck, conv_in) = if self.bottleneck {
                    let name = format!("block{b}/layer{l}/bottleneck");
                    (Some(push(name, Linear::new(features, 4 * g, false, rng), true)), 4 * g)
                } else {
                    (None, features)
                };
                let conv = push(format!("block{b}/layer{l}/dense"), Linear::new(conv_in, g, false, rng), true);
                dense.push(DenseLayer { bottleneck, conv });
                features += g;
            }
            let transition = if b + 1 < num_blocks {
                let out = ((features as f32 * self.compression).floor() as usize).max(1);
                let t = push(format!("block{b}/transition"), Linear::new(features, out, false, rng), true);
                features = out;
                Some(t)
            } else {
                None
            };
            blocks.push(Block { layers: dense, transition });
        }
        let head = push("head".to_string(), Linear::new(features, self.output_classes, true, rng), false);

        let mut offsets = Vec::with_capacity(units.len());
        let mut slot = 0;
        for u in units.iter() {
            offsets.push(slot);
            slot += u.num_params();
        }

        Ok(DenseNet {
            units,
            offsets,
            stem,
            blocks,
            head,
            input_features,
            weight_decay: self.weight_decay,
            dropout_rate: self.dropout_rate,
            pool_initial: self.pool_initial,
            data_format: self.data_format,
        })
    }
}

/// A linear layer, batch normalized unless it is the head
struct Unit<A: Float> {
    name: String,
    linear: Linear<A>,
    norm: Option<BatchNorm<A>>,
}

impl<A: Float> Unit<A> {
    fn num_params(&self) -> usize {
        1 + self.linear.b.is_some() as usize + 2 * self.norm.is_some() as usize
    }
}

struct DenseLayer {
    bottleneck: Option<usize>,
    conv: usize,
}

struct Block {
    layers: Vec<DenseLayer>,
    transition: Option<usize>,
}

pub struct DenseNet<A: Float = f32> {
    /// every layer with its path, in parameter order
    units: Vec<Unit<A>>,
    /// index of each unit's first parameter in `Gradients`
    offsets: Vec<usize>,
    stem: usize,
    blocks: Vec<Block>,
    head: usize,
    input_features: usize,
    weight_decay: f32,
    dropout_rate: f32,
    pool_initial: bool,
    data_format: DataFormat,
}

/// relu input and normalization state of one unit
struct UnitCache<A> {
    pre: Array2<A>,
    norm: Option<BatchNormCache<A>>,
}

struct BottleneckCache<A> {
    unit: UnitCache<A>,
    mask: Option<Array2<A>>,
    out: Array2<A>,
}

struct LayerCache<A> {
    input: Array2<A>,
    bottleneck: Option<BottleneckCache<A>>,
    unit: UnitCache<A>,
    mask: Option<Array2<A>>,
}

struct BlockCache<A> {
    layers: Vec<LayerCache<A>>,
    /// transition input and unit state
    transition: Option<(Array2<A>, UnitCache<A>)>,
}

/// Activations kept by `DenseNet::forward_t` for the backward pass
pub struct DenseCache<A> {
    input: Array2<A>,
    stem: UnitCache<A>,
    blocks: Vec<BlockCache<A>>,
    head_input: Array2<A>,
    statistics: BatchStatistics<A>,
}

fn masked<A: Float>(x: Array2<A>, mask: &Option<Array2<A>>) -> Array2<A> {
    match mask {
        Some(m) => x * m,
        None => x,
    }
}

impl<A: Float> DenseNet<A> {
    fn linear(&self, i: usize) -> &Linear<A> {
        &self.units[i].linear
    }

    pub fn input_features(&self) -> usize {
        self.input_features
    }

    /// Feature count entering the classifier head
    pub fn head_features(&self) -> usize {
        self.linear(self.head).in_dim()
    }

    fn dropout(&self, shape: (usize, usize), training: bool, rng: &mut StdRng) -> Option<Array2<A>> {
        if training && self.dropout_rate > 0.0 {
            Some(dropout_mask(shape, self.dropout_rate, rng))
        } else {
            None
        }
    }

    /// Pools (if configured) and flattens a batch of images to [batch, features]
    pub fn flatten(&self, images: ArrayView4<f32>) -> Result<Array2<A>> {
        let n = images.len_of(Axis(0));
        let pooled = if self.pool_initial {
            avg_pool2x2(&images, self.data_format.spatial_axes())
        } else {
            images.as_standard_layout().into_owned()
        };
        let features = pooled.len() / n.max(1);
        if features != self.input_features {
            return Err(Error::msg(format!(
                "model expects {} input features per image, got {} from images of shape {:?}",
                self.input_features,
                features,
                images.shape()
            )));
        }
        let flat = pooled.into_shape((n, features))?;
        Ok(flat.mapv(cast::<f32, A>))
    }

    /// linear, batch norm, relu. Batch moments are recorded while training.
    fn unit_forward(
        &self,
        u: usize,
        x: &ArrayView2<A>,
        training: bool,
        stats: &mut BatchStatistics<A>,
    ) -> (Array2<A>, UnitCache<A>) {
        let unit = &self.units[u];
        let z = unit.linear.forward(x);
        let (pre, norm) = match &unit.norm {
            Some(bn) => {
                let (y, c) = bn.forward(&z.view(), training);
                if training {
                    stats.push((c.mean.clone(), c.variance.clone()));
                }
                (y, Some(c))
            }
            None => (z, None),
        };
        (relu(&pre.view()), UnitCache { pre, norm })
    }

    /// Stores the unit's parameter gradients and returns the gradient of `x`
    fn unit_backward(
        &self,
        u: usize,
        x: &ArrayView2<A>,
        cache: UnitCache<A>,
        grad: &ArrayView2<A>,
        grads: &mut Gradients<A>,
    ) -> Array2<A> {
        let unit = &self.units[u];
        let mut g = drelu(&cache.pre.view(), grad);
        if let (Some(bn), Some(c)) = (&unit.norm, &cache.norm) {
            let (gz, ng) = bn.backward(c, &g.view());
            let slot = self.offsets[u] + 1 + unit.linear.b.is_some() as usize;
            grads[slot] = ng.dgamma.into_dyn();
            grads[slot + 1] = ng.dbeta.into_dyn();
            g = gz;
        }
        let (gx, lg) = unit.linear.backward(x, &g.view());
        self.store(grads, u, lg);
        gx
    }

    pub fn forward_t(&self, x: Array2<A>, training: bool, rng: &mut StdRng) -> Result<(Array2<A>, DenseCache<A>)> {
        let mut statistics = BatchStatistics::default();
        let (mut f, stem) = self.unit_forward(self.stem, &x.view(), training, &mut statistics);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in self.blocks.iter() {
            let mut layer_caches = Vec::with_capacity(block.layers.len());
            for layer in block.layers.iter() {
                let input = f;
                let bottleneck = match layer.bottleneck {
                    Some(i) => {
                        let (a, unit) = self.unit_forward(i, &input.view(), training, &mut statistics);
                        let mask = self.dropout(a.dim(), training, rng);
                        let out = masked(a, &mask);
                        Some(BottleneckCache { unit, mask, out })
                    }
                    None => None,
                };
                let conv_in = bottleneck.as_ref().map(|b| &b.out).unwrap_or(&input);
                let (a, unit) = self.unit_forward(layer.conv, &conv_in.view(), training, &mut statistics);
                let mask = self.dropout(a.dim(), training, rng);
                let y = masked(a, &mask);
                f = concatenate(Axis(1), &[input.view(), y.view()])?;
                layer_caches.push(LayerCache { input, bottleneck, unit, mask });
            }
            let transition = match block.transition {
                Some(t) => {
                    let (a, unit) = self.unit_forward(t, &f.view(), training, &mut statistics);
                    let input = std::mem::replace(&mut f, a);
                    Some((input, unit))
                }
                None => None,
            };
            block_caches.push(BlockCache { layers: layer_caches, transition });
        }

        let logits = self.linear(self.head).forward(&f.view());
        let cache = DenseCache { input: x, stem, blocks: block_caches, head_input: f, statistics };
        Ok((logits, cache))
    }

    fn store(&self, grads: &mut Gradients<A>, unit: usize, g: LinearGrads<A>) {
        let slot = self.offsets[unit];
        grads[slot] = g.dw.into_dyn();
        if let Some(db) = g.db {
            grads[slot + 1] = db.into_dyn();
        }
    }

    pub fn backward_t(&self, cache: DenseCache<A>, grad: &ArrayView2<A>) -> Gradients<A> {
        let mut grads = Gradients::zeros_like(&self.param_shapes_t());

        let (mut g, head_grads) = self.linear(self.head).backward(&cache.head_input.view(), grad);
        self.store(&mut grads, self.head, head_grads);

        for (block, bc) in self.blocks.iter().zip(cache.blocks).rev() {
            if let (Some(t), Some((input, unit))) = (block.transition, bc.transition) {
                g = self.unit_backward(t, &input.view(), unit, &g.view(), &mut grads);
            }
            for (layer, lc) in block.layers.iter().zip(bc.layers).rev() {
                // split the gradient of the concatenation
                let c = lc.input.ncols();
                let mut g_in = g.slice(s![.., ..c]).to_owned();
                let g_y = masked(g.slice(s![.., c..]).to_owned(), &lc.mask);
                let conv_in = lc.bottleneck.as_ref().map(|b| &b.out).unwrap_or(&lc.input);
                let g_conv_in = self.unit_backward(layer.conv, &conv_in.view(), lc.unit, &g_y.view(), &mut grads);

                match (layer.bottleneck, lc.bottleneck) {
                    (Some(i), Some(b)) => {
                        let g_a = masked(g_conv_in, &b.mask);
                        g_in += &self.unit_backward(i, &lc.input.view(), b.unit, &g_a.view(), &mut grads);
                    }
                    _ => g_in += &g_conv_in,
                }
                g = g_in;
            }
        }

        self.unit_backward(self.stem, &cache.input.view(), cache.stem, &g.view(), &mut grads);
        grads
    }

    /// `weight_decay * sum(w^2)` for every kernel
    pub fn losses_t(&self) -> Vec<A> {
        let wd: A = cast(self.weight_decay);
        self.units.iter().map(|u| wd * u.linear.kernel_sq_norm()).collect()
    }

    pub fn add_loss_gradients_t(&self, grads: &mut Gradients<A>) {
        let scale: A = cast(2.0 * self.weight_decay as f64);
        for (i, u) in self.units.iter().enumerate() {
            grads[self.offsets[i]].scaled_add(scale, &u.linear.w.view().into_dyn());
        }
    }

    pub fn visit_params_t(&self, f: &mut dyn FnMut(&str, ArrayViewD<A>)) {
        for Unit { name, linear, norm } in self.units.iter() {
            f(&format!("{name}/kernel"), linear.w.view().into_dyn());
            if let Some(b) = &linear.b {
                f(&format!("{name}/bias"), b.view().into_dyn());
            }
            if let Some(bn) = norm {
                f(&format!("{name}/gamma"), bn.gamma.view().into_dyn());
                f(&format!("{name}/beta"), bn.beta.view().into_dyn());
            }
        }
    }

    pub fn visit_params_mut_t(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<A>)) {
        for Unit { name, linear, norm } in self.units.iter_mut() {
            f(&format!("{name}/kernel"), linear.w.view_mut().into_dyn());
            if let Some(b) = &mut linear.b {
                f(&format!("{name}/bias"), b.view_mut().into_dyn());
            }
            if let Some(bn) = norm {
                f(&format!("{name}/gamma"), bn.gamma.view_mut().into_dyn());
                f(&format!("{name}/beta"), bn.beta.view_mut().into_dyn());
            }
        }
    }

    fn param_shapes_t(&self) -> Vec<Vec<usize>> {
        let mut shapes = Vec::new();
        self.visit_params_t(&mut |_, p| shapes.push(p.shape().to_vec()));
        shapes
    }

    /// Moving mean and variance of every normalization, in layer order
    pub fn moving_statistics(&self) -> BatchStatistics<A> {
        BatchStatistics(
            self.units
                .iter()
                .filter_map(|u| u.norm.as_ref())
                .map(|bn| (bn.moving_mean.clone(), bn.moving_variance.clone()))
                .collect(),
        )
    }

    pub fn update_moving_statistics_t(&mut self, stats: &BatchStatistics<A>) -> Result<()> {
        if stats.is_empty() {
            return Ok(());
        }
        let norms: Vec<&mut BatchNorm<A>> = self.units.iter_mut().filter_map(|u| u.norm.as_mut()).collect();
        if norms.len() != stats.len() {
            return Err(Error::msg(format!(
                "got batch moments for {} normalizations, model has {}",
                stats.len(),
                norms.len()
            )));
        }
        for (i, (bn, (mean, variance))) in norms.into_iter().zip(stats.iter()).enumerate() {
            if mean.len() != bn.features() || variance.len() != bn.features() {
                return Err(Error::msg(format!(
                    "normalization {i} has {} features, got moments of length {} and {}",
                    bn.features(),
                    mean.len(),
                    variance.len()
                )));
            }
            bn.update_moving(&mean.view(), &variance.view());
        }
        Ok(())
    }
}

impl Model for DenseNet<f32> {
    type Cache = DenseCache<f32>;

    fn forward(&self, images: ArrayView4<f32>, training: bool, rng: &mut StdRng) -> Result<(Array2<f32>, Self::Cache)> {
        let x = self.flatten(images)?;
        self.forward_t(x, training, rng)
    }

    fn backward(&self, cache: Self::Cache, grad_logits: ArrayView2<f32>) -> Gradients {
        self.backward_t(cache, &grad_logits)
    }

    fn losses(&self) -> Vec<f32> {
        self.losses_t()
    }

    fn add_loss_gradients(&self, grads: &mut Gradients) {
        self.add_loss_gradients_t(grads)
    }

    fn batch_statistics(&self, cache: &Self::Cache) -> BatchStatistics {
        cache.statistics.clone()
    }

    fn update_moving_statistics(&mut self, stats: &BatchStatistics) -> Result<()> {
        self.update_moving_statistics_t(stats)
    }

    fn visit_params(&self, f: &mut dyn FnMut(&str, ArrayViewD<f32>)) {
        self.visit_params_t(f)
    }

    fn visit_params_mut(&mut self, f: &mut dyn FnMut(&str, ArrayViewMutD<f32>)) {
        self.visit_params_mut_t(f)
    }
}

#[cfg(test)]
fn tiny_params() -> DenseNetParams {
    DenseNetParams {
        mode: BuildMode::FromList,
        growth_rate: 2,
        output_classes: 3,
        num_of_blocks: Some(2),
        num_layers_in_each_block: Some(vec![2, 1]),
        weight_decay: 0.01,
        ..Default::default()
    }
}

#[test]
fn test_layers_from_depth() {
    let params = DenseNetParams::default();
    assert_eq!(params.layers_per_block().unwrap(), vec![6, 6, 6]);

    let no_bottleneck = DenseNetParams { bottleneck: false, ..Default::default() };
    assert_eq!(no_bottleneck.layers_per_block().unwrap(), vec![12, 12, 12]);

    let bad_depth = DenseNetParams { depth_of_model: Some(41), ..Default::default() };
    assert_eq!(bad_depth.layers_per_block(), Err(ConfigError::InvalidDepth(41)));

    let missing = DenseNetParams { depth_of_model: None, ..Default::default() };
    assert_eq!(missing.layers_per_block(), Err(ConfigError::MissingDepth));
}

#[test]
fn test_layers_from_list() {
    let params = DenseNetParams {
        mode: BuildMode::FromList,
        num_layers_in_each_block: Some(vec![2, 3]),
        ..Default::default()
    };
    assert_eq!(
        params.layers_per_block(),
        Err(ConfigError::BlockListLength { expected: 3, got: 2 })
    );
    let params = DenseNetParams { num_of_blocks: None, ..params };
    assert_eq!(params.layers_per_block().unwrap(), vec![2, 3]);
    let params = DenseNetParams { num_layers_in_each_block: None, ..params };
    assert_eq!(params.layers_per_block(), Err(ConfigError::MissingBlockList));
}

#[test]
fn test_feature_growth() {
    use rand::SeedableRng;
    let mut rng = StdRng::seed_from_u64(0);
    // 24 -> 96 -> 48 -> 120 -> 60 -> 132
    let net: DenseNet<f32> = DenseNetParams::default().build([32, 32, 3], &mut rng).unwrap();
    assert_eq!(net.input_features(), 3072);
    assert_eq!(net.head_features(), 132);

    let pooled: DenseNet<f32> = DenseNetParams { pool_initial: true, ..Default::default() }
        .build([32, 32, 3], &mut rng)
        .unwrap();
    assert_eq!(pooled.input_features(), 768);
}

#[test]
fn test_headless_model_rejected() {
    use rand::SeedableRng;
    let mut rng = StdRng::seed_from_u64(0);
    let params = DenseNetParams { include_top: false, ..Default::default() };
    let err = params.build::<f32, _>([8, 8, 3], &mut rng).err().unwrap();
    assert_eq!(err.downcast_ref::<ConfigError>(), Some(&ConfigError::NoClassifierHead));
}

#[test]
fn test_forward_shapes_and_flatten_mismatch() {
    use rand::SeedableRng;
    let mut rng = StdRng::seed_from_u64(1);
    let net: DenseNet<f32> = tiny_params().build([2, 2, 1], &mut rng).unwrap();
    let images = Array4::<f32>::ones((5, 2, 2, 1));
    let (logits, _) = net.forward(images.view(), true, &mut rng).unwrap();
    assert_eq!(logits.dim(), (5, 3));

    let wrong = Array4::<f32>::ones((5, 3, 3, 1));
    assert!(net.forward(wrong.view(), false, &mut rng).is_err());
}

#[test]
fn test_param_order_matches_gradients() {
    use rand::SeedableRng;
    let mut rng = StdRng::seed_from_u64(2);
    let net: DenseNet<f32> = tiny_params().build([2, 2, 1], &mut rng).unwrap();
    let images = Array4::<f32>::from_shape_fn((4, 2, 2, 1), |(n, h, w, _)| (n + h * 2 + w) as f32 * 0.1);
    let (logits, cache) = net.forward(images.view(), false, &mut rng).unwrap();
    let grads = net.backward(cache, Array2::ones(logits.raw_dim()).view());
    assert_eq!(grads.shapes(), net.param_shapes());
    let names: Vec<String> = net.snapshot().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names.first().map(String::as_str), Some("stem/kernel"));
    assert_eq!(names.last().map(String::as_str), Some("head/bias"));
    assert_eq!(names[1], "stem/gamma");
    assert!(names.contains(&"block0/layer1/bottleneck/kernel".to_string()));
    assert!(names.contains(&"block0/transition/beta".to_string()));
    // hidden layers are shifted by their normalization instead of a bias
    assert!(!names.contains(&"block0/transition/bias".to_string()));
    assert_eq!(net.moving_statistics().len(), names.iter().filter(|n| n.ends_with("/gamma")).count());
}

#[test]
fn test_dropout_only_in_training() {
    use rand::SeedableRng;
    let mut rng = StdRng::seed_from_u64(3);
    let params = DenseNetParams { dropout_rate: 0.5, ..tiny_params() };
    let net: DenseNet<f32> = params.build([2, 2, 1], &mut rng).unwrap();
    let images = Array4::<f32>::from_shape_fn((8, 2, 2, 1), |(n, h, w, _)| (n * 4 + h * 2 + w) as f32 * 0.05);

    let (a, _) = net.forward(images.view(), false, &mut StdRng::seed_from_u64(10)).unwrap();
    let (b, _) = net.forward(images.view(), false, &mut StdRng::seed_from_u64(11)).unwrap();
    assert_eq!(a, b);

    let (c, _) = net.forward(images.view(), true, &mut StdRng::seed_from_u64(10)).unwrap();
    let (d, _) = net.forward(images.view(), true, &mut StdRng::seed_from_u64(11)).unwrap();
    assert_ne!(c, d);
}

#[test]
fn test_inference_uses_moving_statistics() {
    use rand::SeedableRng;
    let mut rng = StdRng::seed_from_u64(5);
    let mut net: DenseNet<f32> = tiny_params().build([2, 2, 1], &mut rng).unwrap();
    let images = Array4::<f32>::from_shape_fn((6, 2, 2, 1), |(n, h, w, _)| ((n * 4 + h * 2 + w) as f32 * 0.7).sin());

    // inference normalizes every example on its own
    let (batch, cache) = net.forward(images.view(), false, &mut rng).unwrap();
    let (single, _) = net.forward(images.slice(s![2..3, .., .., ..]), false, &mut rng).unwrap();
    for (a, b) in single.row(0).iter().zip(batch.row(2).iter()) {
        approx::assert_abs_diff_eq!(*a, *b, epsilon = 1e-5);
    }
    assert!(net.batch_statistics(&cache).is_empty());

    // training normalizes with the batch and reports its moments
    let (trained, cache) = net.forward(images.view(), true, &mut rng).unwrap();
    let (trained_single, _) = net.forward(images.slice(s![2..3, .., .., ..]), true, &mut rng).unwrap();
    assert_ne!(trained_single.row(0), trained.row(2));
    let stats = net.batch_statistics(&cache);
    assert_eq!(stats.len(), net.moving_statistics().len());

    let before = net.moving_statistics();
    net.update_moving_statistics(&stats).unwrap();
    let after = net.moving_statistics();
    let (m0, v0) = &before[0];
    let (m1, v1) = &after[0];
    for j in 0..m0.len() {
        approx::assert_abs_diff_eq!(m1[j], 0.99 * m0[j] + 0.01 * stats[0].0[j], epsilon = 1e-6);
        approx::assert_abs_diff_eq!(v1[j], 0.99 * v0[j] + 0.01 * stats[0].1[j], epsilon = 1e-6);
    }
    let (moved, _) = net.forward(images.view(), false, &mut rng).unwrap();
    assert_ne!(moved, batch);

    let wrong = BatchStatistics(stats[..1].to_vec());
    assert!(net.update_moving_statistics(&wrong).is_err());
}

#[test]
fn test_densenet_grad_check() {
    use crate::nn::{grad_check, SparseCategoricalCrossentropy};
    use rand::SeedableRng;

    let build = || -> DenseNet<f64> { tiny_params().build([2, 2, 1], &mut StdRng::seed_from_u64(4)).unwrap() };
    let x = array![[0.3, -0.8, 1.1, 0.5], [-1.2, 0.4, 0.9, -0.1], [0.7, 0.2, -0.6, 1.3], [0.1, 1.0, -0.4, -0.9]];
    let labels = [0u32, 2, 1, 1];
    let ce = SparseCategoricalCrossentropy::default();

    // moves every gamma off one and every beta off zero, so no relu input
    // sits exactly on the kink
    let mut rng = StdRng::seed_from_u64(9);
    let mut flat = Vec::new();
    build().visit_params_t(&mut |_, p| flat.extend(p.iter().map(|v| v + rng.gen_range(-0.2..0.2))));
    let flat = Array1::from(flat);

    let with_params = |p: &Array1<f64>| {
        let mut net = build();
        let mut offset = 0;
        net.visit_params_mut_t(&mut |_, mut w| {
            let n = w.len();
            w.iter_mut().zip(p.slice(s![offset..offset + n]).iter()).for_each(|(w, v)| *w = *v);
            offset += n;
        });
        net
    };
    for training in [true, false] {
        let f = |p: &Array1<f64>| {
            let net = with_params(p);
            let (logits, _) = net.forward_t(x.clone(), training, &mut StdRng::seed_from_u64(0)).unwrap();
            let loss = ce.call(&labels, &logits.view()).unwrap() + net.losses_t().iter().sum::<f64>();
            array![loss]
        };
        let df = |g: &Array1<f64>| {
            let net = with_params(&flat);
            let (logits, cache) = net.forward_t(x.clone(), training, &mut StdRng::seed_from_u64(0)).unwrap();
            let (_, dlogits) = ce.forward(&labels, &logits.view()).unwrap();
            let mut grads = net.backward_t(cache, &dlogits.view());
            net.add_loss_gradients_t(&mut grads);
            let flat: Vec<f64> = grads.iter().flat_map(|a| a.iter().map(|v| v * g[0]).collect::<Vec<_>>()).collect();
            Array1::from(flat)
        };
        grad_check(flat.clone(), f, df, None, None, None).unwrap();
    }
}
