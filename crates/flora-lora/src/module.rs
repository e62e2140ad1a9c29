//! Low-rank adapter modules.
//!
//! A [`LoraModule`] attaches to exactly one base layer and computes
//!
//! `y = base(x) + multiplier * scale * up(down(x))`
//!
//! where `scale = alpha / rank`. In split mode one module carries several
//! `(down, up)` branches over the same input whose outputs are concatenated
//! along the feature axis.
//!
//! Modules come in two variants chosen once at build time: training modules
//! apply dropout while in training mode, inference modules can be disabled
//! and pre-folded into the base weight.

use std::collections::HashMap;

use flora_core::{Device, NetworkConfig};
use mlx_rs::{Array, Dtype as MlxDtype};
use tracing::debug;

use crate::delta::{dense_delta, split_delta};
use crate::layer::{conv2d_nchw, LayerGeometry, SharedLayer};
use crate::{LoraError, Result};

/// Dropout probabilities, active only while training.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DropoutConfig {
    /// Element dropout on the rank activations.
    pub dropout: Option<f32>,
    /// Drops whole rank channels.
    pub rank_dropout: Option<f32>,
    /// Skips the adapter for a whole forward pass.
    pub module_dropout: Option<f32>,
}

impl DropoutConfig {
    /// Dropout settings from a network configuration.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            dropout: config.dropout,
            rank_dropout: config.rank_dropout,
            module_dropout: config.module_dropout,
        }
    }
}

/// Which capability set a module is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleKind {
    /// Trainable, with dropout and train/eval mode.
    #[default]
    Training,
    /// Inference only, with enable toggling and pre-calculation.
    Inference,
}

/// Variant-specific runtime state.
#[derive(Debug, Clone)]
pub enum ModuleVariant {
    /// Training variant.
    Training {
        /// Dropout probabilities.
        dropout: DropoutConfig,
        /// Train (true) or eval (false) mode.
        training: bool,
    },
    /// Inference variant.
    Inference {
        /// When false, forward bypasses the adapter.
        enabled: bool,
    },
}

/// Construction parameters for one module.
#[derive(Debug, Clone)]
pub struct LoraModuleConfig {
    /// Bottleneck rank.
    pub rank: i32,
    /// Alpha; `None` or `0` means `alpha = rank`.
    pub alpha: Option<f32>,
    /// Output multiplier.
    pub multiplier: f32,
    /// Branch output sizes for split mode.
    pub split_dims: Option<Vec<i32>>,
    /// Variant to build.
    pub kind: ModuleKind,
    /// Dropout, used by the training variant only.
    pub dropout: DropoutConfig,
}

impl LoraModuleConfig {
    /// Training module with the given rank and alpha.
    pub fn new(rank: i32, alpha: Option<f32>) -> Self {
        Self {
            rank,
            alpha,
            multiplier: 1.0,
            split_dims: None,
            kind: ModuleKind::Training,
            dropout: DropoutConfig::default(),
        }
    }

    /// Set the multiplier.
    pub fn with_multiplier(mut self, multiplier: f32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set split dimensions.
    pub fn with_split_dims(mut self, split_dims: Vec<i32>) -> Self {
        self.split_dims = Some(split_dims);
        self
    }

    /// Set the module variant.
    pub fn with_kind(mut self, kind: ModuleKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set dropout probabilities.
    pub fn with_dropout(mut self, dropout: DropoutConfig) -> Self {
        self.dropout = dropout;
        self
    }
}

/// Decomposition weights.
#[derive(Debug, Clone)]
pub enum LoraWeights {
    /// One `(down, up)` pair.
    Dense {
        /// `[rank, in]` or `[rank, in, kh, kw]`.
        down: Array,
        /// `[out, rank]` or `[out, rank, 1, 1]`.
        up: Array,
    },
    /// One pair per output branch.
    Split {
        /// `[rank, in]` each.
        downs: Vec<Array>,
        /// `[split_dims[i], rank]` each.
        ups: Vec<Array>,
    },
}

/// A low-rank adapter bound to one base layer.
#[derive(Debug)]
pub struct LoraModule {
    name: String,
    org: SharedLayer,
    geometry: LayerGeometry,
    rank: i32,
    alpha: f32,
    scale: f32,
    multiplier: f32,
    split_dims: Option<Vec<i32>>,
    weights: LoraWeights,
    variant: ModuleVariant,
}

impl LoraModule {
    /// Create a module for `org`.
    ///
    /// Down weights use Kaiming-uniform initialization (bound
    /// `1 / sqrt(fan_in)`), up weights are zero so the initial delta is
    /// exactly zero.
    pub fn new(name: impl Into<String>, org: SharedLayer, config: LoraModuleConfig) -> Result<Self> {
        let name = name.into();
        let geometry = org.borrow().geometry();
        let rank = config.rank;
        if rank <= 0 {
            return Err(LoraError::InvalidState(format!(
                "{name}: rank must be positive, got {rank}"
            )));
        }

        let in_dim = geometry.in_dim();
        let out_dim = geometry.out_dim();

        let weights = match config.split_dims {
            Some(ref split_dims) => {
                if !geometry.is_linear() {
                    return Err(LoraError::InvalidSplit(format!(
                        "{name}: split dims are only supported for Linear"
                    )));
                }
                let total: i32 = split_dims.iter().sum();
                if split_dims.is_empty() || total != out_dim {
                    return Err(LoraError::InvalidSplit(format!(
                        "{name}: sum of split dims {split_dims:?} must equal out dim {out_dim}"
                    )));
                }
                let bound = 1.0 / (in_dim as f32).sqrt();
                let downs = split_dims
                    .iter()
                    .map(|_| mlx_rs::random::uniform::<_, f32>(-bound, bound, &[rank, in_dim], None))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let ups = split_dims
                    .iter()
                    .map(|&d| mlx_rs::ops::zeros::<f32>(&[d, rank]))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                LoraWeights::Split { downs, ups }
            }
            None => match geometry {
                LayerGeometry::Linear { .. } => {
                    let bound = 1.0 / (in_dim as f32).sqrt();
                    LoraWeights::Dense {
                        down: mlx_rs::random::uniform::<_, f32>(
                            -bound,
                            bound,
                            &[rank, in_dim],
                            None,
                        )?,
                        up: mlx_rs::ops::zeros::<f32>(&[out_dim, rank])?,
                    }
                }
                LayerGeometry::Conv2d {
                    kernel: (kh, kw), ..
                } => {
                    let bound = 1.0 / ((in_dim * kh * kw) as f32).sqrt();
                    LoraWeights::Dense {
                        down: mlx_rs::random::uniform::<_, f32>(
                            -bound,
                            bound,
                            &[rank, in_dim, kh, kw],
                            None,
                        )?,
                        up: mlx_rs::ops::zeros::<f32>(&[out_dim, rank, 1, 1])?,
                    }
                }
            },
        };

        let alpha = match config.alpha {
            Some(a) if a != 0.0 => a,
            _ => rank as f32,
        };

        let variant = match config.kind {
            ModuleKind::Training => ModuleVariant::Training {
                dropout: config.dropout,
                training: true,
            },
            ModuleKind::Inference => ModuleVariant::Inference { enabled: true },
        };

        Ok(Self {
            name,
            org,
            geometry,
            rank,
            alpha,
            scale: alpha / rank as f32,
            multiplier: config.multiplier,
            split_dims: config.split_dims,
            weights,
            variant,
        })
    }

    /// Adapter name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The base layer this module targets.
    pub fn org(&self) -> &SharedLayer {
        &self.org
    }

    /// Geometry of the target layer.
    pub fn geometry(&self) -> LayerGeometry {
        self.geometry
    }

    /// Bottleneck rank.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// Alpha as stored alongside the weights.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// `alpha / rank` fixed at construction.
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Output multiplier.
    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }

    /// Set the output multiplier.
    pub fn set_multiplier(&mut self, multiplier: f32) {
        self.multiplier = multiplier;
    }

    /// Split dimensions, in split mode.
    pub fn split_dims(&self) -> Option<&[i32]> {
        self.split_dims.as_deref()
    }

    /// Whether this module has several branches.
    pub fn is_split(&self) -> bool {
        self.split_dims.is_some()
    }

    /// Decomposition weights.
    pub fn weights(&self) -> &LoraWeights {
        &self.weights
    }

    /// Runtime variant.
    pub fn variant(&self) -> &ModuleVariant {
        &self.variant
    }

    /// Whether the adapter contributes to forward passes.
    pub fn is_enabled(&self) -> bool {
        match self.variant {
            ModuleVariant::Inference { enabled } => enabled,
            ModuleVariant::Training { .. } => true,
        }
    }

    /// Enable or disable the adapter. Inference variant only.
    pub fn set_enabled(&mut self, value: bool) -> Result<()> {
        match self.variant {
            ModuleVariant::Inference { ref mut enabled } => {
                *enabled = value;
                Ok(())
            }
            ModuleVariant::Training { .. } => Err(LoraError::InvalidState(format!(
                "{}: training modules cannot be disabled",
                self.name
            ))),
        }
    }

    /// Whether dropout is active.
    pub fn is_training(&self) -> bool {
        matches!(self.variant, ModuleVariant::Training { training: true, .. })
    }

    /// Switch between train and eval mode. No effect on inference modules.
    pub fn set_training(&mut self, value: bool) {
        if let ModuleVariant::Training {
            ref mut training, ..
        } = self.variant
        {
            *training = value;
        }
    }

    /// Forward pass: base output plus the scaled adapter delta.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        let base = self.org.borrow().forward(x)?;

        let dropout = match self.variant {
            ModuleVariant::Inference { enabled: false } => return Ok(base),
            ModuleVariant::Inference { enabled: true } => DropoutConfig::default(),
            ModuleVariant::Training { training: false, .. } => DropoutConfig::default(),
            ModuleVariant::Training {
                training: true,
                dropout,
            } => dropout,
        };

        if let Some(p) = dropout.module_dropout {
            let draw = mlx_rs::random::uniform::<_, f32>(0.0, 1.0, &[1], None)?;
            if draw.item::<f32>() < p {
                return Ok(base);
            }
        }

        let mut scale = self.scale;
        if let Some(p) = dropout.rank_dropout {
            scale /= 1.0 - p;
        }

        let lx = match self.weights {
            LoraWeights::Dense { ref down, ref up } => {
                let lx = self.down_forward(x, down)?;
                let lx = apply_dropout(&lx, &dropout, self.rank)?;
                self.up_forward(&lx, up)?
            }
            LoraWeights::Split { ref downs, ref ups } => {
                let branches = downs
                    .iter()
                    .zip(ups)
                    .map(|(down, up)| {
                        let lx = self.down_forward(x, down)?;
                        let lx = apply_dropout(&lx, &dropout, self.rank)?;
                        self.up_forward(&lx, up)
                    })
                    .collect::<Result<Vec<_>>>()?;
                let refs: Vec<&Array> = branches.iter().collect();
                mlx_rs::ops::concatenate_axis(&refs, -1)?
            }
        };

        let factor = Array::from_f32(self.multiplier * scale);
        Ok(base.add(&lx.multiply(&factor)?)?)
    }

    fn down_forward(&self, x: &Array, down: &Array) -> Result<Array> {
        match self.geometry {
            LayerGeometry::Linear { .. } => Ok(x.matmul(&down.t())?),
            LayerGeometry::Conv2d {
                stride, padding, ..
            } => conv2d_nchw(x, down, stride, padding),
        }
    }

    fn up_forward(&self, lx: &Array, up: &Array) -> Result<Array> {
        match self.geometry {
            LayerGeometry::Linear { .. } => Ok(lx.matmul(&up.t())?),
            LayerGeometry::Conv2d { .. } => conv2d_nchw(lx, up, (1, 1), (0, 0)),
        }
    }

    /// Unscaled dense delta of the current weights, in f32.
    pub fn delta(&self, device: Device) -> Result<Array> {
        match self.weights {
            LoraWeights::Dense { ref down, ref up } => dense_delta(up, down, device),
            LoraWeights::Split { ref downs, ref ups } => split_delta(ups, downs, device),
        }
    }

    /// Scaled dense delta without touching the base weight.
    ///
    /// Uses `multiplier` when given, the module's own multiplier otherwise.
    pub fn get_weight(&self, multiplier: Option<f32>) -> Result<Array> {
        let multiplier = multiplier.unwrap_or(self.multiplier);
        let delta = self.delta(Device::default())?;
        Ok(delta.multiply(&Array::from_f32(multiplier * self.scale))?)
    }

    /// Fold a decomposition from `weights` into the base layer.
    ///
    /// `weights` is restricted to this module's keys with the name prefix
    /// removed: `lora_down.weight` / `lora_up.weight`, or for split modules
    /// `lora_down.{i}.weight` / `lora_up.{i}.weight`. The delta is computed
    /// in f32 on `device` and the merged weight is stored as `dtype`, or in
    /// the base weight's own dtype when `None`.
    pub fn merge_to(
        &self,
        weights: &HashMap<String, Array>,
        dtype: Option<MlxDtype>,
        device: Device,
    ) -> Result<()> {
        let delta = match (weights.get("lora_down.weight"), weights.get("lora_up.weight")) {
            (Some(down), Some(up)) => dense_delta(up, down, device)?,
            _ => match self.split_dims {
                Some(ref split_dims) => {
                    let mut downs = Vec::with_capacity(split_dims.len());
                    let mut ups = Vec::with_capacity(split_dims.len());
                    for i in 0..split_dims.len() {
                        downs.push(self.required(weights, &format!("lora_down.{i}.weight"))?);
                        ups.push(self.required(weights, &format!("lora_up.{i}.weight"))?);
                    }
                    split_delta(&ups, &downs, device)?
                }
                None => {
                    return Err(LoraError::MissingWeight(format!(
                        "{}.lora_down.weight",
                        self.name
                    )))
                }
            },
        };

        let delta = delta.multiply(&Array::from_f32(self.multiplier * self.scale))?;
        self.org.borrow_mut().merge_delta(&delta, dtype)?;
        debug!("merged {}", self.name);
        Ok(())
    }

    fn required(&self, weights: &HashMap<String, Array>, key: &str) -> Result<Array> {
        weights
            .get(key)
            .cloned()
            .ok_or_else(|| LoraError::MissingWeight(format!("{}.{key}", self.name)))
    }

    /// Fold the current delta into the base weight and disable the adapter.
    pub fn pre_calculation(&mut self) -> Result<()> {
        if !matches!(self.variant, ModuleVariant::Inference { .. }) {
            return Err(LoraError::InvalidState(format!(
                "{}: pre-calculation needs an inference module",
                self.name
            )));
        }
        let weight = self.get_weight(None)?;
        self.org.borrow_mut().merge_delta(&weight, None)?;
        self.set_enabled(false)
    }

    /// Trainable tensors keyed by their name relative to the module.
    pub fn named_parameters(&self) -> Vec<(String, Array)> {
        match self.weights {
            LoraWeights::Dense { ref down, ref up } => vec![
                ("lora_down.weight".to_string(), down.clone()),
                ("lora_up.weight".to_string(), up.clone()),
            ],
            LoraWeights::Split { ref downs, ref ups } => {
                let mut out = Vec::with_capacity(downs.len() + ups.len());
                for (i, down) in downs.iter().enumerate() {
                    out.push((format!("lora_down.{i}.weight"), down.clone()));
                }
                for (i, up) in ups.iter().enumerate() {
                    out.push((format!("lora_up.{i}.weight"), up.clone()));
                }
                out
            }
        }
    }

    /// In-memory state: parameters plus the `alpha` scalar.
    pub fn state_dict(&self) -> Vec<(String, Array)> {
        let mut out = self.named_parameters();
        out.push(("alpha".to_string(), Array::from_f32(self.alpha)));
        out
    }

    /// Replace one tensor by its relative key.
    ///
    /// Returns `false` for keys this module does not own. Loading `alpha`
    /// updates the stored value but not the scale fixed at construction.
    pub fn set_tensor(&mut self, key: &str, value: Array) -> Result<bool> {
        if key == "alpha" {
            let value = value.as_dtype(MlxDtype::Float32)?;
            self.alpha = value.item::<f32>();
            return Ok(true);
        }

        let slot = match tensor_mut(&mut self.weights, key) {
            Some(slot) => slot,
            None => return Ok(false),
        };
        if slot.shape() != value.shape() {
            return Err(LoraError::ShapeMismatch(format!(
                "{}.{key}: expected {:?}, got {:?}",
                self.name,
                slot.shape(),
                value.shape()
            )));
        }
        *slot = value;
        Ok(true)
    }

    /// Multiply every down and up tensor by `factor`.
    pub fn scale_weights(&mut self, factor: f32) -> Result<()> {
        let factor = Array::from_f32(factor);
        match self.weights {
            LoraWeights::Dense {
                ref mut down,
                ref mut up,
            } => {
                *down = down.multiply(&factor)?;
                *up = up.multiply(&factor)?;
            }
            LoraWeights::Split {
                ref mut downs,
                ref mut ups,
            } => {
                for w in downs.iter_mut().chain(ups.iter_mut()) {
                    *w = w.multiply(&factor)?;
                }
            }
        }
        Ok(())
    }

    /// Number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, a)| a.size())
            .sum()
    }
}

fn tensor_mut<'a>(weights: &'a mut LoraWeights, key: &str) -> Option<&'a mut Array> {
    match weights {
        LoraWeights::Dense { down, up } => match key {
            "lora_down.weight" => Some(down),
            "lora_up.weight" => Some(up),
            _ => None,
        },
        LoraWeights::Split { downs, ups } => {
            let (list, rest) = if let Some(rest) = key.strip_prefix("lora_down.") {
                (downs, rest)
            } else if let Some(rest) = key.strip_prefix("lora_up.") {
                (ups, rest)
            } else {
                return None;
            };
            let idx: usize = rest.strip_suffix(".weight")?.parse().ok()?;
            list.get_mut(idx)
        }
    }
}

fn apply_dropout(lx: &Array, dropout: &DropoutConfig, rank: i32) -> Result<Array> {
    let mut lx = lx.clone();

    if let Some(p) = dropout.dropout {
        let keep = mlx_rs::random::uniform::<_, f32>(0.0, 1.0, lx.shape(), None)?
            .ge(&Array::from_f32(p))?
            .as_dtype(lx.dtype())?;
        lx = lx
            .multiply(&keep)?
            .multiply(&Array::from_f32(1.0 / (1.0 - p)))?;
    }

    if let Some(p) = dropout.rank_dropout {
        let batch = lx.dim(0);
        let mask = mlx_rs::random::uniform::<_, f32>(0.0, 1.0, &[batch, rank], None)?
            .gt(&Array::from_f32(p))?
            .as_dtype(lx.dtype())?;
        let mask = match lx.ndim() {
            3 => mask.reshape(&[batch, 1, rank])?,
            4 => mask.reshape(&[batch, rank, 1, 1])?,
            _ => mask,
        };
        lx = lx.multiply(&mask)?;
    }

    Ok(lx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::BaseLayer;

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        let diff = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
        diff.eval().unwrap();
        diff.item::<f32>()
    }

    fn linear_layer(out_features: i32, in_features: i32) -> SharedLayer {
        let w = mlx_rs::random::normal::<f32>(&[out_features, in_features], None, None, None)
            .unwrap();
        BaseLayer::linear(w, None).unwrap().into_shared()
    }

    #[test]
    fn test_new_defaults() {
        let module =
            LoraModule::new("lora_te1_fc", linear_layer(16, 8), LoraModuleConfig::new(4, Some(2.0)))
                .unwrap();
        assert_eq!(module.rank(), 4);
        assert!((module.scale() - 0.5).abs() < 1e-6);
        assert!(module.is_training());
        assert!(module.is_enabled());
        assert_eq!(module.num_parameters(), 4 * 8 + 16 * 4);

        match module.weights() {
            LoraWeights::Dense { down, up } => {
                assert_eq!(down.shape(), &[4, 8]);
                assert_eq!(up.shape(), &[16, 4]);
                let bound = 1.0 / 8f32.sqrt();
                let max = down.abs().unwrap().max(None).unwrap();
                assert!(max.item::<f32>() <= bound);
            }
            LoraWeights::Split { .. } => panic!("expected dense weights"),
        }
    }

    #[test]
    fn test_alpha_zero_means_rank() {
        for alpha in [None, Some(0.0)] {
            let module =
                LoraModule::new("m", linear_layer(4, 4), LoraModuleConfig::new(8, alpha)).unwrap();
            assert_eq!(module.alpha(), 8.0);
            assert!((module.scale() - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_split_validation() {
        let err = LoraModule::new(
            "m",
            linear_layer(12, 4),
            LoraModuleConfig::new(2, None).with_split_dims(vec![4, 4, 3]),
        );
        assert!(matches!(err, Err(LoraError::InvalidSplit(_))));

        let conv = BaseLayer::conv2d(
            mlx_rs::ops::zeros::<f32>(&[12, 4, 1, 1]).unwrap(),
            None,
            (1, 1),
            (0, 0),
        )
        .unwrap()
        .into_shared();
        let err = LoraModule::new(
            "m",
            conv,
            LoraModuleConfig::new(2, None).with_split_dims(vec![4, 4, 4]),
        );
        assert!(matches!(err, Err(LoraError::InvalidSplit(_))));

        let ok = LoraModule::new(
            "m",
            linear_layer(12, 4),
            LoraModuleConfig::new(2, None).with_split_dims(vec![4, 4, 4]),
        )
        .unwrap();
        assert!(ok.is_split());
        assert_eq!(ok.named_parameters().len(), 6);
    }

    #[test]
    fn test_conv_module_shapes() {
        let conv = BaseLayer::conv2d(
            mlx_rs::random::normal::<f32>(&[6, 4, 3, 3], None, None, None).unwrap(),
            None,
            (1, 1),
            (1, 1),
        )
        .unwrap()
        .into_shared();
        let mut module = LoraModule::new("m", conv, LoraModuleConfig::new(2, None)).unwrap();
        match module.weights() {
            LoraWeights::Dense { down, up } => {
                assert_eq!(down.shape(), &[2, 4, 3, 3]);
                assert_eq!(up.shape(), &[6, 2, 1, 1]);
            }
            LoraWeights::Split { .. } => panic!("expected dense weights"),
        }
        module.set_training(false);
        let x = mlx_rs::random::normal::<f32>(&[1, 4, 5, 5], None, None, None).unwrap();
        let y = module.forward(&x).unwrap();
        assert_eq!(y.shape(), &[1, 6, 5, 5]);
    }

    #[test]
    fn test_training_module_cannot_be_disabled() {
        let mut module =
            LoraModule::new("m", linear_layer(4, 4), LoraModuleConfig::new(2, None)).unwrap();
        assert!(module.set_enabled(false).is_err());
        assert!(module.pre_calculation().is_err());
    }

    #[test]
    fn test_disabled_inference_module_is_base() {
        let layer = linear_layer(8, 4);
        let mut module = LoraModule::new(
            "m",
            layer.clone(),
            LoraModuleConfig::new(2, None).with_kind(ModuleKind::Inference),
        )
        .unwrap();
        module
            .set_tensor(
                "lora_up.weight",
                mlx_rs::random::normal::<f32>(&[8, 2], None, None, None).unwrap(),
            )
            .unwrap();
        module.set_enabled(false).unwrap();

        let x = mlx_rs::random::normal::<f32>(&[3, 4], None, None, None).unwrap();
        let y = module.forward(&x).unwrap();
        let base = layer.borrow().forward(&x).unwrap();
        assert_eq!(max_abs_diff(&y, &base), 0.0);
    }

    #[test]
    fn test_get_weight_honors_multiplier() {
        let mut module =
            LoraModule::new("m", linear_layer(8, 4), LoraModuleConfig::new(2, Some(4.0))).unwrap();
        module
            .set_tensor("lora_up.weight", mlx_rs::ops::ones::<f32>(&[8, 2]).unwrap())
            .unwrap();
        let own = module.get_weight(None).unwrap();
        let doubled = module.get_weight(Some(2.0)).unwrap();
        let expected = own.multiply(&Array::from_f32(2.0)).unwrap();
        assert!(max_abs_diff(&doubled, &expected) < 1e-5);
    }

    #[test]
    fn test_set_tensor_checks_shapes_and_keys() {
        let mut module =
            LoraModule::new("m", linear_layer(8, 4), LoraModuleConfig::new(2, None)).unwrap();
        let bad = mlx_rs::ops::zeros::<f32>(&[8, 3]).unwrap();
        assert!(module.set_tensor("lora_up.weight", bad).is_err());
        let other = mlx_rs::ops::zeros::<f32>(&[8, 2]).unwrap();
        assert!(!module.set_tensor("lora_up.0.weight", other).unwrap());

        module.set_tensor("alpha", Array::from_f32(6.0)).unwrap();
        assert_eq!(module.alpha(), 6.0);
        assert!((module.scale() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_rank_dropout_keeps_shapes() {
        let config = LoraModuleConfig::new(4, None).with_dropout(DropoutConfig {
            dropout: Some(0.1),
            rank_dropout: Some(0.5),
            module_dropout: None,
        });
        let module = LoraModule::new("m", linear_layer(8, 6), config).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 5, 6], None, None, None).unwrap();
        let y = module.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 5, 8]);

        let x = mlx_rs::random::normal::<f32>(&[3, 6], None, None, None).unwrap();
        let y = module.forward(&x).unwrap();
        assert_eq!(y.shape(), &[3, 8]);
    }

    #[test]
    fn test_rank_dropout_masks_whole_channels() {
        let dropout = DropoutConfig {
            rank_dropout: Some(0.5),
            ..Default::default()
        };

        // [batch, tokens, rank]: one draw per (batch, rank), shared by all tokens
        let lx = mlx_rs::ops::ones::<f32>(&[4, 3, 6]).unwrap();
        let masked = apply_dropout(&lx, &dropout, 6).unwrap();
        assert_eq!(masked.shape(), &[4, 3, 6]);
        masked.eval().unwrap();
        let values = masked.as_slice::<f32>();
        for b in 0..4 {
            for r in 0..6 {
                let first = values[b * 18 + r];
                assert!(first == 0.0 || first == 1.0);
                for t in 1..3 {
                    assert_eq!(values[b * 18 + t * 6 + r], first);
                }
            }
        }

        // [batch, rank, h, w]: masked per [batch, rank, 1, 1]
        let lx = mlx_rs::ops::ones::<f32>(&[2, 6, 3, 3]).unwrap();
        let masked = apply_dropout(&lx, &dropout, 6).unwrap();
        assert_eq!(masked.shape(), &[2, 6, 3, 3]);
        masked.eval().unwrap();
        for channel in masked.as_slice::<f32>().chunks(9) {
            assert!(channel[0] == 0.0 || channel[0] == 1.0);
            assert!(channel.iter().all(|&v| v == channel[0]));
        }
    }

    #[test]
    fn test_rank_dropout_rescales_survivors() {
        let p = 0.5;
        let layer = linear_layer(5, 3);
        let config = LoraModuleConfig::new(1, Some(1.0)).with_dropout(DropoutConfig {
            rank_dropout: Some(p),
            ..Default::default()
        });
        let mut module = LoraModule::new("m", layer.clone(), config).unwrap();
        let up = mlx_rs::random::normal::<f32>(&[5, 1], None, None, None).unwrap();
        module.set_tensor("lora_up.weight", up.clone()).unwrap();
        let LoraWeights::Dense { down, .. } = module.weights().clone() else {
            panic!("expected dense weights");
        };

        let x = mlx_rs::random::normal::<f32>(&[16, 3], None, None, None).unwrap();
        let got = module
            .forward(&x)
            .unwrap()
            .subtract(&layer.borrow().forward(&x).unwrap())
            .unwrap();
        let full = x
            .matmul(&down.t())
            .unwrap()
            .matmul(&up.t())
            .unwrap()
            .multiply(&Array::from_f32(1.0 / (1.0 - p)))
            .unwrap();
        got.eval().unwrap();
        full.eval().unwrap();

        // a single rank channel: every row is either dropped or fully rescaled
        for (row, expected) in got.as_slice::<f32>().chunks(5).zip(full.as_slice::<f32>().chunks(5)) {
            let dropped = row.iter().all(|v| v.abs() < 1e-5);
            let rescaled = row.iter().zip(expected).all(|(a, b)| (a - b).abs() < 1e-4);
            assert!(dropped || rescaled, "{row:?} vs {expected:?}");
        }
    }

    #[test]
    fn test_module_dropout_returns_base() {
        let layer = linear_layer(6, 4);
        let config = LoraModuleConfig::new(2, None).with_dropout(DropoutConfig {
            module_dropout: Some(1.0),
            ..Default::default()
        });
        let mut module = LoraModule::new("m", layer.clone(), config).unwrap();
        module
            .set_tensor("lora_up.weight", mlx_rs::ops::ones::<f32>(&[6, 2]).unwrap())
            .unwrap();

        let x = mlx_rs::random::normal::<f32>(&[3, 4], None, None, None).unwrap();
        let base = layer.borrow().forward(&x).unwrap();
        assert_eq!(max_abs_diff(&module.forward(&x).unwrap(), &base), 0.0);

        // eval mode ignores module dropout
        module.set_training(false);
        assert!(max_abs_diff(&module.forward(&x).unwrap(), &base) > 0.0);
    }

    #[test]
    fn test_scale_weights() {
        let mut module =
            LoraModule::new("m", linear_layer(8, 4), LoraModuleConfig::new(2, None)).unwrap();
        module
            .set_tensor("lora_up.weight", mlx_rs::ops::ones::<f32>(&[8, 2]).unwrap())
            .unwrap();
        let before = module.delta(Device::Cpu).unwrap();
        module.scale_weights(0.5).unwrap();
        let after = module.delta(Device::Cpu).unwrap();
        let expected = before.multiply(&Array::from_f32(0.25)).unwrap();
        assert!(max_abs_diff(&after, &expected) < 1e-5);
    }
}
