//! Checkpoint key remapping.
//!
//! Lumina-family checkpoints circulate under two naming conventions: the
//! Alpha-VLLM layout used by the reference training code and the Diffusers
//! layout. [`KeyRemapper`] converts flat weight maps between them by
//! substituting literal key fragments from a fixed table.
//!
//! A `()` in a pattern stands for a block index and is expanded to each of
//! `0..num_blocks`. Patterns only match on whole dotted segments, so
//! `layers.1.` never matches inside `layers.10.`.

#![warn(missing_docs)]

use std::collections::HashMap;

use tracing::{debug, info};

const BLOCK_PLACEHOLDER: &str = "()";

/// Alpha-VLLM to Diffusers rules for Lumina Image 2.0.
const ALPHA_VLLM_TO_DIFFUSERS: &[(&str, &str)] = &[
    // Embedding layers
    ("cap_embedder.0.weight", "time_caption_embed.caption_embedder.0.weight"),
    ("cap_embedder.1.weight", "time_caption_embed.caption_embedder.1.weight"),
    ("cap_embedder.1.bias", "time_caption_embed.caption_embedder.1.bias"),
    ("x_embedder.weight", "patch_embedder.proj.weight"),
    ("x_embedder.bias", "patch_embedder.proj.bias"),
    // Attention modulation
    ("layers.().adaLN_modulation.1.weight", "transformer_blocks.().adaln_modulation.1.weight"),
    ("layers.().adaLN_modulation.1.bias", "transformer_blocks.().adaln_modulation.1.bias"),
    // Final layers
    ("final_layer.adaLN_modulation.1.weight", "final_adaln_modulation.1.weight"),
    ("final_layer.adaLN_modulation.1.bias", "final_adaln_modulation.1.bias"),
    ("final_layer.linear.weight", "final_linear.weight"),
    ("final_layer.linear.bias", "final_linear.bias"),
    // Noise refiner
    ("noise_refiner.().adaLN_modulation.1.weight", "single_transformer_blocks.().adaln_modulation.1.weight"),
    ("noise_refiner.().adaLN_modulation.1.bias", "single_transformer_blocks.().adaln_modulation.1.bias"),
    ("noise_refiner.().attention.qkv.weight", "single_transformer_blocks.().attn.to_qkv.weight"),
    ("noise_refiner.().attention.out.weight", "single_transformer_blocks.().attn.to_out.0.weight"),
    // Time embedding
    ("t_embedder.mlp.0.weight", "time_embedder.0.weight"),
    ("t_embedder.mlp.0.bias", "time_embedder.0.bias"),
    ("t_embedder.mlp.2.weight", "time_embedder.2.weight"),
    ("t_embedder.mlp.2.bias", "time_embedder.2.bias"),
    // Context attention
    ("context_refiner.().attention.qkv.weight", "transformer_blocks.().attn2.to_qkv.weight"),
    ("context_refiner.().attention.out.weight", "transformer_blocks.().attn2.to_out.0.weight"),
    // Normalization
    ("layers.().attention_norm1.weight", "transformer_blocks.().norm1.weight"),
    ("layers.().attention_norm2.weight", "transformer_blocks.().norm2.weight"),
    // FFN
    ("layers.().feed_forward.w1.weight", "transformer_blocks.().ff.net.0.proj.weight"),
    ("layers.().feed_forward.w2.weight", "transformer_blocks.().ff.net.2.weight"),
    ("layers.().feed_forward.w3.weight", "transformer_blocks.().ff.net.4.weight"),
];

/// Result of remapping a weight map.
#[derive(Debug, Clone)]
pub struct RemapOutcome<T> {
    /// Remapped weights.
    pub weights: HashMap<String, T>,
    /// Keys that matched no rule and were passed through, sorted.
    pub unmatched: Vec<String>,
}

/// Ordered `(pattern, replacement)` substitution rules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRemapper {
    rules: Vec<(String, String)>,
}

impl KeyRemapper {
    /// Create a remapper from rules. Earlier rules take precedence.
    pub fn new<I, P, R>(rules: I) -> Self
    where
        I: IntoIterator<Item = (P, R)>,
        P: Into<String>,
        R: Into<String>,
    {
        Self {
            rules: rules
                .into_iter()
                .map(|(p, r)| (p.into(), r.into()))
                .collect(),
        }
    }

    /// Lumina Alpha-VLLM names to Diffusers names.
    pub fn alpha_vllm_to_diffusers() -> Self {
        Self::new(ALPHA_VLLM_TO_DIFFUSERS.iter().copied())
    }

    /// Lumina Diffusers names to Alpha-VLLM names.
    pub fn diffusers_to_alpha_vllm() -> Self {
        Self::alpha_vllm_to_diffusers().reversed()
    }

    /// The same table in the other direction.
    pub fn reversed(&self) -> Self {
        Self {
            rules: self
                .rules
                .iter()
                .map(|(p, r)| (r.clone(), p.clone()))
                .collect(),
        }
    }

    /// Rules in precedence order.
    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    /// Remap one key, or `None` if no rule matches.
    pub fn remap_key(&self, key: &str, num_blocks: usize) -> Option<String> {
        for (pattern, replacement) in &self.rules {
            if pattern.contains(BLOCK_PLACEHOLDER) {
                for block in 0..num_blocks {
                    let index = block.to_string();
                    let expanded = pattern.replace(BLOCK_PLACEHOLDER, &index);
                    let target = replacement.replace(BLOCK_PLACEHOLDER, &index);
                    if let Some(new_key) = replace_segment(key, &expanded, &target) {
                        return Some(new_key);
                    }
                }
            } else if let Some(new_key) = replace_segment(key, pattern, replacement) {
                return Some(new_key);
            }
        }
        None
    }

    /// Remap every key of a weight map. Unmatched keys keep their name.
    pub fn remap<T>(&self, weights: HashMap<String, T>, num_blocks: usize) -> RemapOutcome<T> {
        let mut remapped = HashMap::with_capacity(weights.len());
        let mut unmatched = Vec::new();

        for (key, value) in weights {
            match self.remap_key(&key, num_blocks) {
                Some(new_key) => {
                    remapped.insert(new_key, value);
                }
                None => {
                    debug!("Unmatched key in conversion: {key}");
                    unmatched.push(key.clone());
                    remapped.insert(key, value);
                }
            }
        }

        unmatched.sort();
        info!(
            "Converted {} keys ({} unmatched)",
            remapped.len(),
            unmatched.len()
        );
        RemapOutcome {
            weights: remapped,
            unmatched,
        }
    }
}

/// Replace the first occurrence of `pattern` that covers whole dotted segments.
fn replace_segment(key: &str, pattern: &str, replacement: &str) -> Option<String> {
    key.match_indices(pattern).find_map(|(start, _)| {
        let end = start + pattern.len();
        let starts_segment = start == 0 || key[..start].ends_with('.');
        let ends_segment = end == key.len() || key[end..].starts_with('.');
        (starts_segment && ends_segment)
            .then(|| format!("{}{}{}", &key[..start], replacement, &key[end..]))
    })
}
