//! Adapter network configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{FloraError, Result, TrainBlocks};

/// Static Flux block sizes used to partition fused projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FluxBlockDims {
    /// Width of one attention projection (q, k or v).
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,

    /// Width of the MLP input fused into single-stream `linear1`.
    #[serde(default = "default_mlp_hidden")]
    pub mlp_hidden: usize,
}

impl Default for FluxBlockDims {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
            mlp_hidden: default_mlp_hidden(),
        }
    }
}

/// Differentiated learning-rate ratios for up projections (LoRA+).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LoraPlusRatios {
    /// Ratio used when no family-specific ratio is set.
    #[serde(default)]
    pub default: Option<f64>,

    /// Backbone-specific ratio.
    #[serde(default)]
    pub unet: Option<f64>,

    /// Text-encoder-specific ratio.
    #[serde(default)]
    pub text_encoder: Option<f64>,
}

impl LoraPlusRatios {
    /// Whether any ratio is configured.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.default.is_some() || self.unet.is_some() || self.text_encoder.is_some()
    }

    /// Effective backbone ratio.
    #[must_use]
    pub fn unet_ratio(&self) -> Option<f64> {
        self.unet.or(self.default)
    }

    /// Effective text-encoder ratio.
    #[must_use]
    pub fn text_encoder_ratio(&self) -> Option<f64> {
        self.text_encoder.or(self.default)
    }
}

/// Configuration of a low-rank adapter network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Global output multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f32,

    /// Rank for linear and 1x1 convolution targets.
    #[serde(default = "default_rank")]
    pub rank: usize,

    /// Alpha for linear and 1x1 convolution targets.
    #[serde(default = "default_alpha")]
    pub alpha: f32,

    /// Rank for k x k convolution targets. Unset skips them.
    #[serde(default)]
    pub conv_rank: Option<usize>,

    /// Alpha for k x k convolution targets.
    #[serde(default)]
    pub conv_alpha: Option<f32>,

    /// Input dropout probability.
    #[serde(default)]
    pub dropout: Option<f32>,

    /// Rank-channel dropout probability.
    #[serde(default)]
    pub rank_dropout: Option<f32>,

    /// Whole-module dropout probability.
    #[serde(default)]
    pub module_dropout: Option<f32>,

    /// Backbone block families to train.
    #[serde(default)]
    pub train_blocks: TrainBlocks,

    /// Model fused QKV projections as separate branches.
    #[serde(default)]
    pub split_qkv: bool,

    /// Also attach adapters to the T5-XXL text encoder.
    #[serde(default)]
    pub train_t5xxl: bool,

    /// LoRA+ learning-rate ratios.
    #[serde(default)]
    pub loraplus: LoraPlusRatios,

    /// Flux block sizes.
    #[serde(default)]
    pub block_dims: FluxBlockDims,

    /// Log skipped layers.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            multiplier: default_multiplier(),
            rank: default_rank(),
            alpha: default_alpha(),
            conv_rank: None,
            conv_alpha: None,
            dropout: None,
            rank_dropout: None,
            module_dropout: None,
            train_blocks: TrainBlocks::default(),
            split_qkv: false,
            train_t5xxl: false,
            loraplus: LoraPlusRatios::default(),
            block_dims: FluxBlockDims::default(),
            verbose: false,
        }
    }
}

impl NetworkConfig {
    /// Load configuration from a YAML or JSON file, chosen by extension.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content)?,
            Some("yaml") | Some("yml") => Self::from_yaml(&content)?,
            other => {
                return Err(FloraError::Config(format!(
                    "unsupported config extension: {other:?}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Apply `key=value` network arguments on top of this configuration.
    ///
    /// Accepts the argument names used by sd-scripts style trainers
    /// (`conv_dim`, `conv_alpha`, `rank_dropout`, `module_dropout`,
    /// `train_blocks`, `split_qkv`, `train_t5xxl`, `loraplus_lr_ratio`,
    /// `loraplus_unet_lr_ratio`, `loraplus_text_encoder_lr_ratio`, `verbose`).
    pub fn apply_network_args<I, S>(&mut self, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            let arg = arg.as_ref();
            let (key, value) = arg.split_once('=').ok_or_else(|| {
                FloraError::InvalidArgument(format!("network arg must be key=value: {arg}"))
            })?;
            let (key, value) = (key.trim(), value.trim());
            debug!("network arg {key}={value}");

            match key {
                "conv_dim" => {
                    self.conv_rank = Some(parse_value(key, value)?);
                    if self.conv_alpha.is_none() {
                        self.conv_alpha = Some(1.0);
                    }
                }
                "conv_alpha" => self.conv_alpha = Some(parse_value(key, value)?),
                "dropout" => self.dropout = Some(parse_value(key, value)?),
                "rank_dropout" => self.rank_dropout = Some(parse_value(key, value)?),
                "module_dropout" => self.module_dropout = Some(parse_value(key, value)?),
                "train_blocks" => self.train_blocks = value.parse()?,
                "split_qkv" => self.split_qkv = value == "True" || value == "true",
                "train_t5xxl" => self.train_t5xxl = value == "True" || value == "true",
                "verbose" => self.verbose = value == "True" || value == "true",
                "loraplus_lr_ratio" => self.loraplus.default = Some(parse_value(key, value)?),
                "loraplus_unet_lr_ratio" => self.loraplus.unet = Some(parse_value(key, value)?),
                "loraplus_text_encoder_lr_ratio" => {
                    self.loraplus.text_encoder = Some(parse_value(key, value)?)
                }
                other => {
                    return Err(FloraError::InvalidArgument(format!(
                        "unknown network arg: {other}"
                    )))
                }
            }
        }
        Ok(())
    }

    /// Alpha for k x k convolutions, defaulting to 1.0 when a conv rank is set.
    #[must_use]
    pub fn effective_conv_alpha(&self) -> Option<f32> {
        self.conv_rank.map(|_| self.conv_alpha.unwrap_or(1.0))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(FloraError::Config("rank must be positive".into()));
        }
        if self.conv_rank == Some(0) {
            return Err(FloraError::Config("conv_rank must be positive".into()));
        }
        for (name, p) in [
            ("dropout", self.dropout),
            ("rank_dropout", self.rank_dropout),
            ("module_dropout", self.module_dropout),
        ] {
            if let Some(p) = p {
                if !(0.0..1.0).contains(&p) {
                    return Err(FloraError::Config(format!(
                        "{name} must be in [0, 1), got {p}"
                    )));
                }
            }
        }
        let dims = self.block_dims;
        if dims.hidden_size == 0 || dims.mlp_hidden == 0 {
            return Err(FloraError::Config("block dims must be positive".into()));
        }
        Ok(())
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| FloraError::InvalidArgument(format!("invalid value for {key}: {value}")))
}

// Default value functions
fn default_multiplier() -> f32 {
    1.0
}
fn default_rank() -> usize {
    4
}
fn default_alpha() -> f32 {
    1.0
}
fn default_hidden_size() -> usize {
    3072
}
fn default_mlp_hidden() -> usize {
    12288
}
