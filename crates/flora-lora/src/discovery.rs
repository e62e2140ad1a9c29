//! Adapter target discovery.
//!
//! [`discover`] is a pure pass over a module tree: it finds the leaves under
//! the targeted block classes, resolves their rank and alpha, and returns
//! both the accepted candidates and the skipped layers. Name uniqueness is
//! checked separately by [`validate_unique_names`].

use std::collections::{HashMap, HashSet};

use flora_core::{FluxBlockDims, NetworkConfig};

use crate::split::split_dims_for;
use crate::tree::{LayerSlot, ModuleNode};
use crate::{LoraError, Result};

/// Flux double-stream block class.
pub const FLUX_TARGET_DOUBLE: &[&str] = &["DoubleStreamBlock"];

/// Flux single-stream block class.
pub const FLUX_TARGET_SINGLE: &[&str] = &["SingleStreamBlock"];

/// Text encoder block classes (CLIP and T5).
pub const TEXT_ENCODER_TARGETS: &[&str] = &[
    "CLIPAttention",
    "CLIPSdpaAttention",
    "CLIPMLP",
    "T5Attention",
    "T5DenseGatedActDense",
];

/// Name prefix of backbone adapters.
pub const LORA_PREFIX_FLUX: &str = "lora_unet";

/// Name prefix of CLIP-L adapters.
pub const LORA_PREFIX_TEXT_ENCODER_CLIP: &str = "lora_te1";

/// Name prefix of T5-XXL adapters.
pub const LORA_PREFIX_TEXT_ENCODER_T5: &str = "lora_te3";

/// Where ranks and alphas come from.
#[derive(Debug, Clone)]
pub enum RankSource {
    /// Training: global rank/alpha, conv rank/alpha for k x k kernels.
    Global {
        /// Rank for Linear and 1x1 Conv2d.
        rank: i32,
        /// Alpha for Linear and 1x1 Conv2d.
        alpha: f32,
        /// Rank for larger kernels, if those are trained at all.
        conv_rank: Option<i32>,
        /// Alpha for larger kernels.
        conv_alpha: Option<f32>,
    },
    /// Reload: per-name ranks and alphas recovered from a weight map.
    Map {
        /// Rank by adapter name.
        dims: HashMap<String, i32>,
        /// Alpha by adapter name.
        alphas: HashMap<String, f32>,
    },
}

impl RankSource {
    /// Global source from a network configuration.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::Global {
            rank: config.rank as i32,
            alpha: config.alpha,
            conv_rank: config.conv_rank.map(|r| r as i32),
            conv_alpha: config.effective_conv_alpha(),
        }
    }

    fn conv_configured(&self) -> bool {
        matches!(
            self,
            Self::Global {
                conv_rank: Some(_),
                ..
            }
        )
    }

    fn resolve(&self, name: &str, linear_like: bool) -> Option<(i32, Option<f32>)> {
        match self {
            Self::Global {
                rank,
                alpha,
                conv_rank,
                conv_alpha,
            } => {
                if linear_like {
                    Some((*rank, Some(*alpha)))
                } else {
                    conv_rank.map(|r| (r, *conv_alpha))
                }
            }
            Self::Map { dims, alphas } => dims
                .get(name)
                .map(|&rank| (rank, alphas.get(name).copied())),
        }
    }
}

/// A layer selected for adaptation.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Adapter name.
    pub name: String,
    /// Target slot.
    pub slot: LayerSlot,
    /// Resolved rank.
    pub rank: i32,
    /// Resolved alpha; `None` means alpha equals rank.
    pub alpha: Option<f32>,
    /// Split partition for fused projections.
    pub split_dims: Option<Vec<i32>>,
}

/// Why a layer was not adapted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Rank resolved to zero.
    ZeroRank,
    /// No rank available for this layer.
    MissingRank,
}

/// A layer that was eligible but skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLayer {
    /// Adapter name the layer would have had.
    pub name: String,
    /// Reason.
    pub reason: SkipReason,
}

/// Result of one discovery pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Accepted layers in tree order.
    pub candidates: Vec<Candidate>,
    /// Skipped layers in tree order.
    pub skipped: Vec<SkippedLayer>,
}

impl DiscoveryReport {
    /// Append another report.
    pub fn extend(&mut self, other: DiscoveryReport) {
        self.candidates.extend(other.candidates);
        self.skipped.extend(other.skipped);
    }
}

/// Adapter name for a leaf: `prefix.block.child` with dots replaced.
pub fn adapter_name(prefix: &str, block_path: &str, child_path: &str) -> String {
    let mut name = String::from(prefix);
    for part in [block_path, child_path] {
        if !part.is_empty() {
            name.push('.');
            name.push_str(part);
        }
    }
    name.replace('.', "_")
}

/// Find adaptable leaves under every node whose class is in `targets`.
///
/// With `split` set, fused Flux projections get their fixed partition.
pub fn discover(
    root: &ModuleNode,
    prefix: &str,
    targets: &[&str],
    ranks: &RankSource,
    split: Option<&FluxBlockDims>,
) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();

    for (block_path, block) in root.named_modules() {
        if !targets.contains(&block.class_name()) {
            continue;
        }
        for (child_path, slot) in block.leaves() {
            let name = adapter_name(prefix, &block_path, &child_path);
            let geometry = slot.geometry();
            let linear_like = geometry.is_linear() || geometry.is_pointwise_conv();

            let (rank, alpha) = match ranks.resolve(&name, linear_like) {
                Some((rank, alpha)) if rank > 0 => (rank, alpha),
                resolved => {
                    if linear_like || ranks.conv_configured() {
                        let reason = if resolved.is_some() {
                            SkipReason::ZeroRank
                        } else {
                            SkipReason::MissingRank
                        };
                        report.skipped.push(SkippedLayer { name, reason });
                    }
                    continue;
                }
            };

            let split_dims = split.and_then(|dims| split_dims_for(&name, dims));
            report.candidates.push(Candidate {
                name,
                slot,
                rank,
                alpha,
                split_dims,
            });
        }
    }

    report
}

/// Fail on the first adapter name that appears twice.
pub fn validate_unique_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(LoraError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layer::BaseLayer;

    fn linear(out: i32, inp: i32) -> ModuleNode {
        ModuleNode::leaf(BaseLayer::linear(mlx_rs::ops::zeros::<f32>(&[out, inp]).unwrap(), None).unwrap())
    }

    fn conv(out: i32, inp: i32, k: i32) -> ModuleNode {
        let weight = mlx_rs::ops::zeros::<f32>(&[out, inp, k, k]).unwrap();
        ModuleNode::leaf(BaseLayer::conv2d(weight, None, (1, 1), (k / 2, k / 2)).unwrap())
    }

    fn tree() -> ModuleNode {
        ModuleNode::new("Model")
            .with_child(
                "blocks",
                ModuleNode::new("ModuleList").with_child(
                    "0",
                    ModuleNode::new("Block")
                        .with_child("proj", linear(4, 4))
                        .with_child("pw", conv(4, 4, 1))
                        .with_child("conv", conv(4, 4, 3)),
                ),
            )
            .with_child("head", linear(2, 4))
    }

    fn global(conv_rank: Option<i32>) -> RankSource {
        RankSource::Global {
            rank: 2,
            alpha: 1.0,
            conv_rank,
            conv_alpha: conv_rank.map(|_| 1.0),
        }
    }

    #[test]
    fn test_names_and_targets() {
        let report = discover(&tree(), "lora_unet", &["Block"], &global(None), None);
        let names: Vec<&str> = report.candidates.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["lora_unet_blocks_0_proj", "lora_unet_blocks_0_pw"]);
        // 3x3 conv without a conv rank is neither adapted nor reported
        assert!(report.skipped.is_empty());
    }

    #[test]
    fn test_conv_rank_enables_kxk() {
        let report = discover(&tree(), "lora_unet", &["Block"], &global(Some(3)), None);
        let conv = report
            .candidates
            .iter()
            .find(|c| c.name == "lora_unet_blocks_0_conv")
            .unwrap();
        assert_eq!(conv.rank, 3);
    }

    #[test]
    fn test_map_source_skips_zero_and_missing() {
        let mut dims = HashMap::new();
        dims.insert("lora_unet_blocks_0_proj".to_string(), 0);
        dims.insert("lora_unet_blocks_0_conv".to_string(), 4);
        let source = RankSource::Map {
            dims,
            alphas: HashMap::new(),
        };
        let report = discover(&tree(), "lora_unet", &["Block"], &source, None);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].name, "lora_unet_blocks_0_conv");
        assert_eq!(report.candidates[0].alpha, None);
        assert_eq!(
            report.skipped,
            vec![
                SkippedLayer {
                    name: "lora_unet_blocks_0_proj".into(),
                    reason: SkipReason::ZeroRank
                },
                SkippedLayer {
                    name: "lora_unet_blocks_0_pw".into(),
                    reason: SkipReason::MissingRank
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_names() {
        assert!(validate_unique_names(["a", "b"]).is_ok());
        assert!(matches!(
            validate_unique_names(["a", "b", "a"]),
            Err(LoraError::DuplicateName(n)) if n == "a"
        ));
    }
}
