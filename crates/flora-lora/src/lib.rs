//! Low-rank adapters for Flux-family diffusion models.
//!
//! This crate provides:
//! - Adapter modules with dropout, split-QKV branches and train/inference variants
//! - Target discovery over named module trees (Flux, CLIP-L, T5-XXL)
//! - Attaching adapters to layer slots without mutating base layers
//! - Merging deltas into base weights with backup and restore
//! - Safetensors serialization with integrity hashes
//! - LoRA+ optimizer parameter groups and max-norm regularization
//!
//! # Example
//!
//! ```ignore
//! use flora_core::NetworkConfig;
//! use flora_lora::{Architecture, LoraNetwork, load_safetensors};
//!
//! let flux = Architecture::Flux.build_tree(load_safetensors("flux1-dev.safetensors")?)?;
//! let clip = Architecture::Clip.build_tree(load_safetensors("clip_l.safetensors")?)?;
//!
//! let mut network = LoraNetwork::create_network(&NetworkConfig::default(), &[&clip], &flux)?;
//! network.apply_to(true, true)?;
//! ```

#![warn(missing_docs)]

pub mod arch;
pub mod delta;
pub mod discovery;
mod error;
pub mod hashes;
pub mod io;
pub mod layer;
pub mod module;
pub mod network;
pub mod param_groups;
pub mod split;
pub mod tree;

pub use arch::{clip_classifier, flux_classifier, t5_classifier, Architecture};
pub use delta::{dense_delta, split_delta};
pub use discovery::{
    discover, validate_unique_names, Candidate, DiscoveryReport, RankSource, SkipReason,
    SkippedLayer, LORA_PREFIX_FLUX, LORA_PREFIX_TEXT_ENCODER_CLIP, LORA_PREFIX_TEXT_ENCODER_T5,
};
pub use error::{LoraError, Result};
pub use io::{
    load_safetensors, load_safetensors_with_metadata, save_safetensors, Metadata, WeightMap,
};
pub use layer::{BackupState, BaseLayer, LayerGeometry, SharedLayer};
pub use module::{
    DropoutConfig, LoraModule, LoraModuleConfig, LoraWeights, ModuleKind, ModuleVariant,
};
pub use network::{AttachedLora, LoadReport, LoraNetwork, MaxNormStats};
pub use param_groups::{ParameterGroup, ParameterGroupBuilder};
pub use split::{merge_split_weights, split_dense_weights, split_dims_for};
pub use tree::{Classifier, LayerSlot, ModuleNode, ModuleTree, SharedAdapter, EMBEDDING_CLASS};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::arch::Architecture;
    pub use crate::error::{LoraError, Result};
    pub use crate::io::{load_safetensors, save_safetensors, WeightMap};
    pub use crate::layer::{BaseLayer, LayerGeometry};
    pub use crate::module::{LoraModule, LoraModuleConfig, ModuleKind};
    pub use crate::network::LoraNetwork;
    pub use crate::tree::{ModuleNode, ModuleTree};
}
