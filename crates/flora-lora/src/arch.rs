//! Block classification for Flux, CLIP-L and T5-XXL checkpoints.
//!
//! Checkpoints carry no module types, so the tree builder names intermediate
//! nodes from their dotted path. Only the block classes that discovery
//! targets need to be recognized; everything else is a plain `"Module"`.

use std::fmt;
use std::str::FromStr;

use flora_core::FloraError;

use crate::io::WeightMap;
use crate::tree::{Classifier, ModuleTree, EMBEDDING_CLASS};
use crate::Result;

fn is_index(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

// token, position and relative position tables of the text encoders
fn is_embedding(segments: &[&str]) -> bool {
    match segments.last() {
        Some(&("shared" | "embed_tokens" | "relative_attention_bias")) => true,
        Some(last) => last.ends_with("embedding") || last.ends_with("embeddings"),
        None => false,
    }
}

/// Flux: `double_blocks.N` and `single_blocks.N`.
pub fn flux_classifier(path: &str) -> Option<&'static str> {
    let segments: Vec<&str> = path.split('.').collect();
    match segments.as_slice() {
        [.., "double_blocks", idx] if is_index(idx) => Some("DoubleStreamBlock"),
        [.., "single_blocks", idx] if is_index(idx) => Some("SingleStreamBlock"),
        _ => None,
    }
}

/// CLIP text model: `layers.N.self_attn` and `layers.N.mlp`; token and
/// position embeddings are tables.
pub fn clip_classifier(path: &str) -> Option<&'static str> {
    let segments: Vec<&str> = path.split('.').collect();
    if is_embedding(&segments) {
        return Some(EMBEDDING_CLASS);
    }
    match segments.as_slice() {
        [.., "layers", idx, "self_attn"] if is_index(idx) => Some("CLIPAttention"),
        [.., "layers", idx, "mlp"] if is_index(idx) => Some("CLIPMLP"),
        _ => None,
    }
}

/// T5 encoder: `block.N.layer.0.SelfAttention` and `block.N.layer.1.DenseReluDense`;
/// `shared`, `embed_tokens` and `relative_attention_bias` are tables.
pub fn t5_classifier(path: &str) -> Option<&'static str> {
    let segments: Vec<&str> = path.split('.').collect();
    if is_embedding(&segments) {
        return Some(EMBEDDING_CLASS);
    }
    match segments.as_slice() {
        [.., "block", idx, "layer", "0", "SelfAttention"] if is_index(idx) => Some("T5Attention"),
        [.., "block", idx, "layer", "1", "DenseReluDense"] if is_index(idx) => {
            Some("T5DenseGatedActDense")
        }
        _ => None,
    }
}

/// Model families flora builds trees for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Flux transformer.
    Flux,
    /// CLIP-L text encoder.
    Clip,
    /// T5-XXL text encoder.
    T5,
}

impl Architecture {
    /// Class name of the tree root.
    pub fn root_class(&self) -> &'static str {
        match self {
            Self::Flux => "Flux",
            Self::Clip => "CLIPTextModel",
            Self::T5 => "T5EncoderModel",
        }
    }

    /// Path classifier.
    pub fn classifier(&self) -> Classifier {
        match self {
            Self::Flux => flux_classifier,
            Self::Clip => clip_classifier,
            Self::T5 => t5_classifier,
        }
    }

    /// Build a module tree from a checkpoint of this family.
    pub fn build_tree(&self, weights: WeightMap) -> Result<ModuleTree> {
        ModuleTree::from_weights(weights, self.root_class(), self.classifier())
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Flux => write!(f, "flux"),
            Self::Clip => write!(f, "clip"),
            Self::T5 => write!(f, "t5"),
        }
    }
}

impl FromStr for Architecture {
    type Err = FloraError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flux" => Ok(Self::Flux),
            "clip" | "clip_l" => Ok(Self::Clip),
            "t5" | "t5xxl" => Ok(Self::T5),
            other => Err(FloraError::InvalidArgument(format!(
                "unknown architecture: {other}"
            ))),
        }
    }
}
