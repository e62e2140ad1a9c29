//! flora CLI - inspect, merge and convert Flux LoRA weights.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use flora_convert::KeyRemapper;
use flora_core::{Device, Dtype, NetworkConfig};
use flora_lora::{
    load_safetensors, load_safetensors_with_metadata, save_safetensors, Architecture,
    LoraNetwork, ModuleKind, ModuleTree, WeightMap, LORA_PREFIX_FLUX,
    LORA_PREFIX_TEXT_ENCODER_CLIP, LORA_PREFIX_TEXT_ENCODER_T5,
};
use mlx_rs::Dtype as MlxDtype;
use tracing::{info, warn};

/// Compute device for merge math.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum DeviceArg {
    /// CPU stream
    #[default]
    Cpu,
    /// GPU stream (Metal)
    Gpu,
}

impl From<DeviceArg> for Device {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => Device::Cpu,
            DeviceArg::Gpu => Device::Gpu,
        }
    }
}

#[derive(Parser)]
#[command(name = "flora")]
#[command(author, version, about = "LoRA tooling for Flux-family diffusion models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show adapter counts, ranks and metadata of a LoRA file
    Inspect {
        /// LoRA weights (.safetensors)
        lora: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Merge one or more LoRA files into Flux (and text encoder) checkpoints
    Merge {
        /// Flux checkpoint
        #[arg(long)]
        flux: PathBuf,

        /// CLIP-L checkpoint
        #[arg(long)]
        clip: Option<PathBuf>,

        /// T5-XXL checkpoint
        #[arg(long, requires = "clip")]
        t5: Option<PathBuf>,

        /// LoRA files, merged in order
        #[arg(long, required = true, num_args = 1..)]
        lora: Vec<PathBuf>,

        /// Multiplier per LoRA file (default 1.0)
        #[arg(long, num_args = 1..)]
        ratio: Vec<f32>,

        /// Directory for the merged checkpoints
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Storage precision of merged weights (f32, f16, bf16)
        #[arg(long)]
        precision: Option<Dtype>,

        /// Device for delta computation
        #[arg(long, value_enum, default_value_t = DeviceArg::Cpu)]
        device: DeviceArg,
    },

    /// Rename checkpoint keys between Alpha-VLLM and Diffusers layouts
    ConvertKeys {
        /// Input checkpoint
        #[arg(short, long)]
        input: PathBuf,

        /// Output checkpoint
        #[arg(short, long)]
        output: PathBuf,

        /// Number of transformer blocks
        #[arg(long)]
        num_blocks: usize,

        /// Convert Diffusers names back to Alpha-VLLM names
        #[arg(long)]
        reverse: bool,
    },

    /// Validate a network configuration file and print the resolved values
    Config {
        /// Configuration file (YAML or JSON)
        file: PathBuf,

        /// Extra key=value network arguments
        #[arg(long, num_args = 1..)]
        network_args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { lora, json } => run_inspect(&lora, json),
        Commands::Merge {
            flux,
            clip,
            t5,
            lora,
            ratio,
            output_dir,
            precision,
            device,
        } => run_merge(
            &flux,
            clip.as_deref(),
            t5.as_deref(),
            &lora,
            &ratio,
            &output_dir,
            precision,
            device.into(),
        ),
        Commands::ConvertKeys {
            input,
            output,
            num_blocks,
            reverse,
        } => run_convert_keys(&input, &output, num_blocks, reverse),
        Commands::Config { file, network_args } => run_config(&file, &network_args),
    }
}

fn family_of(name: &str) -> &'static str {
    if name.starts_with(LORA_PREFIX_FLUX) {
        "flux"
    } else if name.starts_with(LORA_PREFIX_TEXT_ENCODER_CLIP) {
        "clip"
    } else if name.starts_with(LORA_PREFIX_TEXT_ENCODER_T5) {
        "t5"
    } else {
        "other"
    }
}

fn run_inspect(path: &Path, json: bool) -> anyhow::Result<()> {
    let (weights, metadata) = load_safetensors_with_metadata(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    let mut ranks: BTreeMap<String, i32> = BTreeMap::new();
    let mut alphas: BTreeMap<String, f32> = BTreeMap::new();
    for (key, value) in &weights {
        let Some((name, rest)) = key.split_once('.') else {
            continue;
        };
        if rest == "alpha" {
            let alpha = value.as_dtype(MlxDtype::Float32)?;
            alphas.insert(name.to_string(), alpha.item::<f32>());
        } else if rest.starts_with("lora_down") {
            ranks.insert(name.to_string(), value.dim(0));
        }
    }

    let mut families: BTreeMap<&str, usize> = BTreeMap::new();
    let mut histogram: BTreeMap<(i32, String), usize> = BTreeMap::new();
    for (name, rank) in &ranks {
        *families.entry(family_of(name)).or_default() += 1;
        let alpha = alphas.get(name).copied().unwrap_or(*rank as f32);
        *histogram.entry((*rank, format!("{alpha}"))).or_default() += 1;
    }
    let metadata: BTreeMap<String, String> = metadata.into_iter().collect();

    if json {
        let histogram: Vec<serde_json::Value> = histogram
            .iter()
            .map(|((rank, alpha), count)| {
                serde_json::json!({ "rank": rank, "alpha": alpha, "count": count })
            })
            .collect();
        let report = serde_json::json!({
            "file": path.display().to_string(),
            "tensors": weights.len(),
            "modules": families,
            "ranks": histogram,
            "metadata": metadata,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("========================================");
    println!("  LoRA: {}", path.display());
    println!("========================================");
    println!("Tensors:  {}", weights.len());
    println!("Modules:  {}", ranks.len());
    for (family, count) in &families {
        println!("  {:<6} {}", family, count);
    }
    println!("Rank / alpha:");
    for ((rank, alpha), count) in &histogram {
        println!("  rank {:<4} alpha {:<8} x{}", rank, alpha, count);
    }
    if !metadata.is_empty() {
        println!("Metadata:");
        for (key, value) in &metadata {
            println!("  {key}: {value}");
        }
    }
    Ok(())
}

/// Adapter modules present in `weights` but not in `merged`, counted by family.
fn unmerged_modules(weights: &WeightMap, merged: &HashSet<String>) -> BTreeMap<&'static str, usize> {
    let names: BTreeSet<&str> = weights
        .keys()
        .filter_map(|key| key.split_once('.'))
        .filter(|(_, rest)| rest.starts_with("lora_down"))
        .map(|(name, _)| name)
        .collect();

    let mut counts = BTreeMap::new();
    for name in names.into_iter().filter(|name| !merged.contains(*name)) {
        *counts.entry(family_of(name)).or_insert(0) += 1;
    }
    counts
}

fn load_tree(path: &Path, arch: Architecture) -> anyhow::Result<ModuleTree> {
    info!("Loading {} from {}", arch, path.display());
    let weights = load_safetensors(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    Ok(arch.build_tree(weights)?)
}

fn save_tree(tree: &ModuleTree, input: &Path, output_dir: &Path, dtype: Option<Dtype>) -> anyhow::Result<()> {
    let file_name = input
        .file_name()
        .with_context(|| format!("no file name in {}", input.display()))?;
    let output = output_dir.join(file_name);
    if output == input {
        bail!("refusing to overwrite input checkpoint {}", input.display());
    }
    save_safetensors(&output, &tree.to_weights(), dtype, None)?;
    println!("Saved {}", output.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_merge(
    flux_path: &Path,
    clip_path: Option<&Path>,
    t5_path: Option<&Path>,
    loras: &[PathBuf],
    ratios: &[f32],
    output_dir: &Path,
    precision: Option<Dtype>,
    device: Device,
) -> anyhow::Result<()> {
    if !ratios.is_empty() && ratios.len() != loras.len() {
        bail!(
            "got {} ratios for {} LoRA files",
            ratios.len(),
            loras.len()
        );
    }

    let flux = load_tree(flux_path, Architecture::Flux)?;
    let clip = clip_path.map(|p| load_tree(p, Architecture::Clip)).transpose()?;
    let t5 = t5_path.map(|p| load_tree(p, Architecture::T5)).transpose()?;
    let text_encoders: Vec<&ModuleTree> = clip.iter().chain(t5.iter()).collect();

    for (i, lora_path) in loras.iter().enumerate() {
        let ratio = ratios.get(i).copied().unwrap_or(1.0);
        info!("Merging {} with ratio {}", lora_path.display(), ratio);
        let weights = load_safetensors(lora_path)
            .with_context(|| format!("failed to load {}", lora_path.display()))?;

        let config = NetworkConfig {
            multiplier: ratio,
            ..Default::default()
        };
        let mut network = LoraNetwork::from_weights(
            &weights,
            &config,
            &text_encoders,
            &flux,
            ModuleKind::Inference,
        )?;
        if !network.skipped().is_empty() {
            warn!(
                "{} layers in the base models have no weights in {}",
                network.skipped().len(),
                lora_path.display()
            );
        }
        network.merge_to(&weights, precision, device)?;
        println!("Merged {} modules from {}", network.len(), lora_path.display());

        let merged: HashSet<String> = network.loras().map(|l| l.name()).collect();
        for (family, count) in unmerged_modules(&weights, &merged) {
            let hint = match family {
                "clip" if clip.is_none() => " (no --clip checkpoint given)",
                "t5" if t5.is_none() => " (no --t5 checkpoint given)",
                _ => "",
            };
            warn!(
                "{} {} modules in {} were not merged{}",
                count,
                family,
                lora_path.display(),
                hint
            );
        }
    }

    std::fs::create_dir_all(output_dir)?;
    save_tree(&flux, flux_path, output_dir, precision)?;
    if let (Some(tree), Some(path)) = (&clip, clip_path) {
        save_tree(tree, path, output_dir, precision)?;
    }
    if let (Some(tree), Some(path)) = (&t5, t5_path) {
        save_tree(tree, path, output_dir, precision)?;
    }
    Ok(())
}

fn run_convert_keys(input: &Path, output: &Path, num_blocks: usize, reverse: bool) -> anyhow::Result<()> {
    let weights = load_safetensors(input)
        .with_context(|| format!("failed to load {}", input.display()))?;

    let remapper = if reverse {
        KeyRemapper::diffusers_to_alpha_vllm()
    } else {
        KeyRemapper::alpha_vllm_to_diffusers()
    };
    let outcome = remapper.remap(weights, num_blocks);
    if !outcome.unmatched.is_empty() {
        warn!("{} keys were not converted", outcome.unmatched.len());
    }

    save_safetensors(output, &outcome.weights, None, None)?;
    println!(
        "Converted {} keys into {}",
        outcome.weights.len() - outcome.unmatched.len(),
        output.display()
    );
    Ok(())
}

fn run_config(path: &Path, network_args: &[String]) -> anyhow::Result<()> {
    let mut config = NetworkConfig::from_file(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    if !network_args.is_empty() {
        config.apply_network_args(network_args)?;
        config.validate()?;
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
