//! Adapter networks over Flux and its text encoders.
//!
//! A [`LoraNetwork`] owns one [`LoraModule`] per adapted layer, split into
//! text-encoder and backbone collections. It builds them by discovery over
//! module trees, attaches them to layer slots, and handles everything done
//! to the whole set at once: merging, backup and restore, serialization,
//! optimizer grouping and max-norm regularization.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::rc::Rc;

use flora_core::{Device, Dtype, LoraPlusRatios, NetworkConfig};
use mlx_rs::{Array, Dtype as MlxDtype};
use tracing::{debug, info, warn};

use crate::discovery::{
    discover, validate_unique_names, Candidate, DiscoveryReport, RankSource, SkippedLayer,
    FLUX_TARGET_DOUBLE, FLUX_TARGET_SINGLE, LORA_PREFIX_FLUX, LORA_PREFIX_TEXT_ENCODER_CLIP,
    LORA_PREFIX_TEXT_ENCODER_T5, TEXT_ENCODER_TARGETS,
};
use crate::io::{load_safetensors, save_safetensors, to_mlx_dtype, Metadata, WeightMap};
use crate::layer::BackupState;
use crate::module::{DropoutConfig, LoraModule, LoraModuleConfig, LoraWeights, ModuleKind};
use crate::param_groups::{ParameterGroup, ParameterGroupBuilder};
use crate::split::{merge_split_weights, split_dense_weights};
use crate::tree::{LayerSlot, ModuleTree, SharedAdapter};
use crate::{LoraError, Result};

/// An adapter together with the slot it targets.
#[derive(Debug, Clone)]
pub struct AttachedLora {
    module: SharedAdapter,
    slot: LayerSlot,
}

impl AttachedLora {
    /// The adapter.
    pub fn module(&self) -> &SharedAdapter {
        &self.module
    }

    /// The target slot.
    pub fn slot(&self) -> &LayerSlot {
        &self.slot
    }

    /// Adapter name.
    pub fn name(&self) -> String {
        self.module.borrow().name().to_string()
    }
}

/// Outcome of loading a state dict.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Expected keys that were not provided.
    pub missing: Vec<String>,
    /// Provided keys no adapter owns.
    pub unexpected: Vec<String>,
}

/// Result of [`LoraNetwork::apply_max_norm_regularization`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MaxNormStats {
    /// Number of adapters that were rescaled.
    pub keys_scaled: usize,
    /// Mean delta norm after scaling.
    pub mean_norm: f32,
    /// Largest delta norm after scaling.
    pub max_norm: f32,
}

/// A set of adapters for one Flux model and its text encoders.
#[derive(Debug)]
pub struct LoraNetwork {
    text_encoder_loras: Vec<AttachedLora>,
    unet_loras: Vec<AttachedLora>,
    multiplier: f32,
    kind: ModuleKind,
    loraplus: LoraPlusRatios,
    skipped: Vec<SkippedLayer>,
}

impl LoraNetwork {
    /// Discover targets and build one module per accepted layer.
    ///
    /// Text encoder 0 is CLIP-L, text encoder 1 is T5-XXL and is only visited
    /// with `train_t5xxl`. Backbone block families follow `train_blocks`;
    /// fused projections are split when `split_qkv` is set.
    pub fn build(
        text_encoders: &[&ModuleTree],
        unet: &ModuleTree,
        ranks: &RankSource,
        config: &NetworkConfig,
        kind: ModuleKind,
    ) -> Result<Self> {
        config.validate()?;

        let mut text_encoder_report = DiscoveryReport::default();
        for (index, text_encoder) in text_encoders.iter().enumerate() {
            if index > 0 && !config.train_t5xxl {
                break;
            }
            let prefix = if index == 0 {
                LORA_PREFIX_TEXT_ENCODER_CLIP
            } else {
                LORA_PREFIX_TEXT_ENCODER_T5
            };
            let report = discover(text_encoder.root(), prefix, TEXT_ENCODER_TARGETS, ranks, None);
            info!(
                "create LoRA for Text Encoder {}: {} modules.",
                index + 1,
                report.candidates.len()
            );
            text_encoder_report.extend(report);
        }

        let targets: Vec<&str> = FLUX_TARGET_DOUBLE
            .iter()
            .chain(FLUX_TARGET_SINGLE)
            .copied()
            .filter(|class| config.train_blocks.includes(class))
            .collect();
        let split = config.split_qkv.then_some(&config.block_dims);
        let unet_report = discover(unet.root(), LORA_PREFIX_FLUX, &targets, ranks, split);
        info!(
            "create LoRA for FLUX {} blocks: {} modules.",
            config.train_blocks,
            unet_report.candidates.len()
        );

        let skipped: Vec<SkippedLayer> = text_encoder_report
            .skipped
            .iter()
            .chain(&unet_report.skipped)
            .cloned()
            .collect();
        if config.verbose && !skipped.is_empty() {
            warn!("{} LoRA modules are skipped because their rank is 0 or unknown:", skipped.len());
            for layer in &skipped {
                warn!("\t{} ({:?})", layer.name, layer.reason);
            }
        }

        validate_unique_names(
            text_encoder_report
                .candidates
                .iter()
                .chain(&unet_report.candidates)
                .map(|c| c.name.as_str()),
        )?;

        let dropout = DropoutConfig::from_config(config);
        let instantiate = |candidates: Vec<Candidate>| -> Result<Vec<AttachedLora>> {
            candidates
                .into_iter()
                .map(|c| {
                    let mut module_config = LoraModuleConfig::new(c.rank, c.alpha)
                        .with_multiplier(config.multiplier)
                        .with_kind(kind)
                        .with_dropout(dropout);
                    if let Some(split_dims) = c.split_dims {
                        module_config = module_config.with_split_dims(split_dims);
                    }
                    let module = LoraModule::new(c.name, c.slot.layer().clone(), module_config)?;
                    Ok(AttachedLora {
                        module: Rc::new(RefCell::new(module)),
                        slot: c.slot,
                    })
                })
                .collect()
        };

        Ok(Self {
            text_encoder_loras: instantiate(text_encoder_report.candidates)?,
            unet_loras: instantiate(unet_report.candidates)?,
            multiplier: config.multiplier,
            kind,
            loraplus: config.loraplus,
            skipped,
        })
    }

    /// Training network with global rank and alpha from `config`.
    pub fn create_network(
        config: &NetworkConfig,
        text_encoders: &[&ModuleTree],
        unet: &ModuleTree,
    ) -> Result<Self> {
        let network = Self::build(
            text_encoders,
            unet,
            &RankSource::from_config(config),
            config,
            ModuleKind::Training,
        )?;
        if config.loraplus.is_set() {
            info!(
                "LoRA+ UNet LR Ratio: {:?}, Text Encoder LR Ratio: {:?}",
                config.loraplus.unet_ratio(),
                config.loraplus.text_encoder_ratio()
            );
        }
        Ok(network)
    }

    /// Network shaped after an existing adapter weight map.
    ///
    /// Ranks come from `lora_down` dim 0 and alphas from the `alpha`
    /// scalars. T5 adapters are built when any `lora_te3` name is present.
    /// The weights themselves are not loaded.
    pub fn from_weights(
        weights: &WeightMap,
        config: &NetworkConfig,
        text_encoders: &[&ModuleTree],
        unet: &ModuleTree,
        kind: ModuleKind,
    ) -> Result<Self> {
        let mut dims = HashMap::new();
        let mut alphas = HashMap::new();
        for (key, value) in weights {
            let Some((name, rest)) = key.split_once('.') else {
                continue;
            };
            if rest.contains("alpha") {
                let alpha = value.as_dtype(MlxDtype::Float32)?;
                alphas.insert(name.to_string(), alpha.item::<f32>());
            } else if rest.contains("lora_down") {
                dims.insert(name.to_string(), value.dim(0));
            }
        }

        let train_t5xxl = dims.keys().any(|n| n.starts_with(LORA_PREFIX_TEXT_ENCODER_T5));
        if train_t5xxl {
            info!("T5XXL adapters found in weights");
        }

        let config = NetworkConfig {
            train_t5xxl,
            split_qkv: false,
            ..config.clone()
        };
        Self::build(
            text_encoders,
            unet,
            &RankSource::Map { dims, alphas },
            &config,
            kind,
        )
    }

    /// Text encoder adapters.
    pub fn text_encoder_loras(&self) -> &[AttachedLora] {
        &self.text_encoder_loras
    }

    /// Backbone adapters.
    pub fn unet_loras(&self) -> &[AttachedLora] {
        &self.unet_loras
    }

    /// All adapters, text encoders first.
    pub fn loras(&self) -> impl Iterator<Item = &AttachedLora> {
        self.text_encoder_loras.iter().chain(&self.unet_loras)
    }

    /// Adapter by name.
    pub fn get(&self, name: &str) -> Option<&AttachedLora> {
        self.loras().find(|l| l.module.borrow().name() == name)
    }

    /// Number of adapters.
    pub fn len(&self) -> usize {
        self.text_encoder_loras.len() + self.unet_loras.len()
    }

    /// Whether the network has no adapters.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Layers skipped during discovery.
    pub fn skipped(&self) -> &[SkippedLayer] {
        &self.skipped
    }

    /// Module variant the network was built with.
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Global multiplier.
    pub fn multiplier(&self) -> f32 {
        self.multiplier
    }

    /// LoRA+ ratios.
    pub fn loraplus(&self) -> LoraPlusRatios {
        self.loraplus
    }

    /// Networks can always be merged into their base models.
    pub fn is_mergeable(&self) -> bool {
        true
    }

    fn retain_families(&mut self, text_encoder: bool, unet: bool) {
        if text_encoder {
            info!("enable LoRA for text encoder: {} modules", self.text_encoder_loras.len());
        } else {
            self.text_encoder_loras.clear();
        }
        if unet {
            info!("enable LoRA for U-Net: {} modules", self.unet_loras.len());
        } else {
            self.unet_loras.clear();
        }
    }

    /// Route the requested families through their adapters.
    ///
    /// Families not requested are dropped from the network.
    pub fn apply_to(&mut self, text_encoder: bool, unet: bool) -> Result<()> {
        self.retain_families(text_encoder, unet);
        for lora in self.loras() {
            lora.slot.attach(lora.module.clone())?;
        }
        Ok(())
    }

    /// Restore the plain invocation path of every adapted slot.
    pub fn detach(&self) {
        for lora in self.loras() {
            lora.slot.detach();
        }
    }

    /// Merge adapter weights from `weights` into the base layers.
    ///
    /// A family with no keys in `weights` is dropped from the network. Each
    /// adapter receives the keys under `<name>.` with that prefix removed.
    pub fn merge_to(&mut self, weights: &WeightMap, dtype: Option<Dtype>, device: Device) -> Result<()> {
        let text_encoder = weights.keys().any(|k| {
            k.starts_with(LORA_PREFIX_TEXT_ENCODER_CLIP) || k.starts_with(LORA_PREFIX_TEXT_ENCODER_T5)
        });
        let unet = weights.keys().any(|k| k.starts_with(LORA_PREFIX_FLUX));
        self.retain_families(text_encoder, unet);

        let dtype = dtype.map(to_mlx_dtype);
        for lora in self.loras() {
            let module = lora.module.borrow();
            let prefix = format!("{}.", module.name());
            let own: HashMap<String, Array> = weights
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
                .collect();
            module.merge_to(&own, dtype, device)?;
        }
        info!("weights are merged");
        Ok(())
    }

    /// Set the multiplier of every adapter.
    pub fn set_multiplier(&mut self, multiplier: f32) {
        self.multiplier = multiplier;
        for lora in self.loras() {
            lora.module.borrow_mut().set_multiplier(multiplier);
        }
    }

    /// Enable or disable every adapter. Inference networks only.
    pub fn set_enabled(&self, enabled: bool) -> Result<()> {
        for lora in self.loras() {
            lora.module.borrow_mut().set_enabled(enabled)?;
        }
        Ok(())
    }

    /// Switch every adapter between train and eval mode.
    pub fn set_training(&self, training: bool) {
        for lora in self.loras() {
            lora.module.borrow_mut().set_training(training);
        }
    }

    /// Put the network in training mode.
    pub fn on_epoch_start(&self) {
        self.set_training(true);
    }

    /// Snapshot every target layer.
    ///
    /// Layers already holding a pristine snapshot are skipped.
    pub fn backup_weights(&self) -> Result<()> {
        for lora in self.loras() {
            let module = lora.module.borrow();
            let mut layer = module.org().borrow_mut();
            if layer.backup_state() == Some(BackupState::Pristine) {
                debug!("{}: backup already taken", module.name());
                continue;
            }
            layer.backup()?;
        }
        Ok(())
    }

    /// Write every snapshot back.
    ///
    /// Layers already restored are skipped, and so are layers backed up but
    /// never merged since, whose weight still equals the snapshot.
    pub fn restore_weights(&self) -> Result<()> {
        for lora in self.loras() {
            let module = lora.module.borrow();
            let mut layer = module.org().borrow_mut();
            match layer.backup_state() {
                Some(BackupState::Restored) => {
                    debug!("{}: already restored", module.name());
                    continue;
                }
                Some(BackupState::Pristine) => {
                    debug!("{}: not merged since backup", module.name());
                    continue;
                }
                _ => {}
            }
            layer.restore()?;
        }
        Ok(())
    }

    /// Fold every enabled adapter into its layer and disable it.
    ///
    /// Adapters already folded are skipped.
    pub fn pre_calculation(&self) -> Result<()> {
        for lora in self.loras() {
            let mut module = lora.module.borrow_mut();
            let merged = module.org().borrow().backup_state() == Some(BackupState::Merged);
            if merged || !module.is_enabled() {
                debug!("{}: already pre-calculated", module.name());
                continue;
            }
            module.pre_calculation()?;
        }
        info!("pre-calculation done");
        Ok(())
    }

    /// Persistent state in the on-disk layout.
    ///
    /// Split modules are folded into one dense `(down, up)` pair.
    pub fn state_dict(&self) -> Result<WeightMap> {
        let mut out = WeightMap::new();
        for lora in self.loras() {
            let module = lora.module.borrow();
            let name = module.name();
            match (module.weights(), module.split_dims()) {
                (LoraWeights::Split { downs, ups }, Some(split_dims)) => {
                    let (down, up) = merge_split_weights(downs, ups, split_dims)?;
                    out.insert(format!("{name}.lora_down.weight"), down);
                    out.insert(format!("{name}.lora_up.weight"), up);
                    out.insert(format!("{name}.alpha"), Array::from_f32(module.alpha()));
                }
                _ => {
                    for (key, value) in module.state_dict() {
                        out.insert(format!("{name}.{key}"), value);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Load persistent state.
    ///
    /// Dense pairs are split again for split modules. With `strict`, any
    /// missing or unexpected key is an error.
    pub fn load_state_dict(&self, weights: &WeightMap, strict: bool) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut consumed = HashSet::new();

        for lora in self.loras() {
            let mut module = lora.module.borrow_mut();
            let prefix = format!("{}.", module.name());
            let mut own: HashMap<String, Array> = weights
                .iter()
                .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
                .collect();

            if let Some(split_dims) = module.split_dims().map(<[i32]>::to_vec) {
                if let (Some(down), Some(up)) = (own.remove("lora_down.weight"), own.remove("lora_up.weight")) {
                    let (downs, ups) = split_dense_weights(&down, &up, &split_dims)?;
                    for (i, (down, up)) in downs.into_iter().zip(ups).enumerate() {
                        own.insert(format!("lora_down.{i}.weight"), down);
                        own.insert(format!("lora_up.{i}.weight"), up);
                    }
                    consumed.insert(format!("{prefix}lora_down.weight"));
                    consumed.insert(format!("{prefix}lora_up.weight"));
                }
            }

            let expected: Vec<String> = module.state_dict().into_iter().map(|(k, _)| k).collect();
            for key in expected {
                match own.remove(&key) {
                    Some(value) => {
                        module.set_tensor(&key, value)?;
                        consumed.insert(format!("{prefix}{key}"));
                    }
                    None => report.missing.push(format!("{prefix}{key}")),
                }
            }
        }

        report.unexpected = weights
            .keys()
            .filter(|k| !consumed.contains(*k))
            .cloned()
            .collect();
        report.missing.sort();
        report.unexpected.sort();

        if strict && (!report.missing.is_empty() || !report.unexpected.is_empty()) {
            return Err(LoraError::InvalidState(format!(
                "state dict mismatch: missing {:?}, unexpected {:?}",
                report.missing, report.unexpected
            )));
        }
        Ok(report)
    }

    /// Load adapter weights from a safetensors file.
    pub fn load_weights(&self, path: impl AsRef<Path>) -> Result<LoadReport> {
        let weights = load_safetensors(path.as_ref())?;
        let report = self.load_state_dict(&weights, false)?;
        info!(
            "weights are loaded: {} missing, {} unexpected",
            report.missing.len(),
            report.unexpected.len()
        );
        Ok(report)
    }

    /// Save adapter weights with integrity hashes in the metadata.
    pub fn save_weights(
        &self,
        path: impl AsRef<Path>,
        dtype: Option<Dtype>,
        metadata: Option<Metadata>,
    ) -> Result<()> {
        let metadata = metadata.filter(|m| !m.is_empty());
        save_safetensors(path, &self.state_dict()?, dtype, metadata)
    }

    /// Flat view of every trainable tensor, keyed `<name>.<param>`.
    pub fn trainable_parameters(&self) -> HashMap<Rc<str>, Array> {
        let mut out = HashMap::new();
        for lora in self.loras() {
            let module = lora.module.borrow();
            for (key, value) in module.named_parameters() {
                out.insert(Rc::from(format!("{}.{key}", module.name())), value);
            }
        }
        out
    }

    /// Replace trainable tensors from a flat map.
    pub fn update_parameters(&self, params: &HashMap<Rc<str>, Array>) -> Result<()> {
        let by_name: HashMap<String, &AttachedLora> = self.loras().map(|l| (l.name(), l)).collect();
        for (key, value) in params {
            let (name, rest) = key
                .split_once('.')
                .ok_or_else(|| LoraError::InvalidState(format!("malformed parameter key {key}")))?;
            let lora = by_name
                .get(name)
                .ok_or_else(|| LoraError::InvalidState(format!("no adapter named {name}")))?;
            if !lora.module.borrow_mut().set_tensor(rest, value.clone())? {
                return Err(LoraError::InvalidState(format!("unknown parameter {key}")));
            }
        }
        Ok(())
    }

    /// Number of trainable scalars.
    pub fn num_trainable_params(&self) -> usize {
        self.loras().map(|l| l.module.borrow().num_parameters()).sum()
    }

    /// Configure LoRA+ ratios.
    pub fn set_loraplus_lr_ratio(
        &mut self,
        default: Option<f64>,
        unet: Option<f64>,
        text_encoder: Option<f64>,
    ) {
        self.loraplus = LoraPlusRatios {
            default,
            unet,
            text_encoder,
        };
        info!(
            "LoRA+ UNet LR Ratio: {:?}, Text Encoder LR Ratio: {:?}",
            self.loraplus.unet_ratio(),
            self.loraplus.text_encoder_ratio()
        );
    }

    /// Optimizer parameter groups.
    ///
    /// `text_encoder_lrs` holds the CLIP and T5 rates; an empty list uses
    /// `default_lr` for both and a single value applies to both. The backbone
    /// uses `unet_lr`, falling back to `default_lr`.
    pub fn prepare_optimizer_params(
        &self,
        text_encoder_lrs: &[f64],
        unet_lr: Option<f64>,
        default_lr: Option<f64>,
    ) -> Vec<ParameterGroup> {
        let (clip_lr, t5_lr) = match text_encoder_lrs {
            [] => (default_lr, default_lr),
            [lr] => (Some(*lr), Some(*lr)),
            [clip, t5, ..] => (Some(*clip), Some(*t5)),
        };

        let te_ratio = self.loraplus.text_encoder_ratio();
        let mut builder = ParameterGroupBuilder::new();

        let clip_names = param_names(
            self.text_encoder_loras
                .iter()
                .filter(|l| l.name().starts_with(LORA_PREFIX_TEXT_ENCODER_CLIP)),
        );
        if !clip_names.is_empty() {
            info!("Text Encoder 1 (CLIP-L): LR {:?}", clip_lr);
            builder.add_family("textencoder 1", clip_names, clip_lr, te_ratio);
        }

        let t5_names = param_names(
            self.text_encoder_loras
                .iter()
                .filter(|l| l.name().starts_with(LORA_PREFIX_TEXT_ENCODER_T5)),
        );
        if !t5_names.is_empty() {
            info!("Text Encoder 2 (T5XXL): LR {:?}", t5_lr);
            builder.add_family("textencoder 2", t5_names, t5_lr, te_ratio);
        }

        let unet_names = param_names(self.unet_loras.iter());
        builder.add_family(
            "unet",
            unet_names,
            unet_lr.or(default_lr),
            self.loraplus.unet_ratio(),
        );

        debug!("{}", builder.summary());
        builder.build()
    }

    /// Rescale adapters whose scaled delta norm exceeds `max_norm`.
    ///
    /// Each delta is scaled by the stored `alpha / rank`. Norms are clamped
    /// below at `max_norm / 2`; an adapter with norm `n`
    /// above the limit has its down and up weights multiplied by
    /// `sqrt(max_norm / n)`.
    pub fn apply_max_norm_regularization(&self, max_norm: f32, device: Device) -> Result<MaxNormStats> {
        let mut keys_scaled = 0;
        let mut norms = Vec::with_capacity(self.len());

        for lora in self.loras() {
            let mut module = lora.module.borrow_mut();
            // alpha may have been reloaded since construction
            let scale = module.alpha() / module.rank() as f32;
            let delta = module.delta(device)?.multiply(&Array::from_f32(scale))?;
            let raw_norm = delta.square()?.sum(None)?.sqrt()?;
            raw_norm.eval()?;
            let raw_norm = raw_norm.item::<f32>();

            let norm = raw_norm.max(max_norm / 2.0);
            let desired = norm.min(max_norm);
            let ratio = desired / norm;
            if ratio != 1.0 {
                keys_scaled += 1;
                module.scale_weights(ratio.sqrt())?;
                debug!("{}: delta norm {raw_norm} scaled by {ratio}", module.name());
            }
            norms.push(raw_norm * ratio);
        }

        if norms.is_empty() {
            return Ok(MaxNormStats::default());
        }
        Ok(MaxNormStats {
            keys_scaled,
            mean_norm: norms.iter().sum::<f32>() / norms.len() as f32,
            max_norm: norms.iter().copied().fold(f32::MIN, f32::max),
        })
    }
}

fn param_names<'a>(loras: impl Iterator<Item = &'a AttachedLora>) -> Vec<String> {
    let mut names = Vec::new();
    for lora in loras {
        let module = lora.module.borrow();
        for (key, _) in module.named_parameters() {
            names.push(format!("{}.{key}", module.name()));
        }
    }
    names
}
