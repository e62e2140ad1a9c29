//! Shared fixtures: a reduced Flux model with two blocks of each family.

#![allow(dead_code)]

use flora_core::{FluxBlockDims, NetworkConfig};
use flora_lora::{Architecture, LoraNetwork, ModuleTree, WeightMap};
use mlx_rs::Array;

pub const HIDDEN: i32 = 4;
pub const MLP_HIDDEN: i32 = 8;

pub fn random_tensor(shape: &[i32]) -> Array {
    mlx_rs::random::normal::<f32>(shape, None, None, None).unwrap()
}

pub fn max_abs_diff(a: &Array, b: &Array) -> f32 {
    let diff = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
    diff.eval().unwrap();
    diff.item::<f32>()
}

pub fn flux_weights() -> WeightMap {
    let mut weights = WeightMap::new();
    for i in 0..2 {
        weights.insert(
            format!("double_blocks.{i}.img_attn.qkv.weight"),
            random_tensor(&[3 * HIDDEN, HIDDEN]),
        );
        weights.insert(
            format!("double_blocks.{i}.img_attn.qkv.bias"),
            random_tensor(&[3 * HIDDEN]),
        );
        weights.insert(
            format!("double_blocks.{i}.img_attn.proj.weight"),
            random_tensor(&[HIDDEN, HIDDEN]),
        );
        weights.insert(
            format!("single_blocks.{i}.linear1.weight"),
            random_tensor(&[3 * HIDDEN + MLP_HIDDEN, HIDDEN]),
        );
        weights.insert(
            format!("single_blocks.{i}.linear2.weight"),
            random_tensor(&[HIDDEN, HIDDEN + MLP_HIDDEN]),
        );
    }
    weights.insert("img_in.weight".into(), random_tensor(&[HIDDEN, HIDDEN]));
    weights
}

pub fn flux_tree() -> ModuleTree {
    Architecture::Flux.build_tree(flux_weights()).unwrap()
}

pub fn config() -> NetworkConfig {
    NetworkConfig {
        rank: 4,
        alpha: 2.0,
        block_dims: FluxBlockDims {
            hidden_size: HIDDEN as usize,
            mlp_hidden: MLP_HIDDEN as usize,
        },
        ..Default::default()
    }
}

/// Give every up projection random values so deltas are non-zero.
pub fn randomize_ups(network: &LoraNetwork) {
    for lora in network.loras() {
        let mut module = lora.module().borrow_mut();
        for (key, value) in module.named_parameters() {
            if key.contains("lora_up") {
                let shape = value.shape().to_vec();
                assert!(module.set_tensor(&key, random_tensor(&shape)).unwrap());
            }
        }
    }
}
