//! Weight dictionary file I/O.
//!
//! Adapter and base checkpoints are flat `name -> tensor` maps stored as
//! safetensors. F32, F16 and BF16 tensors are supported; loaded arrays keep
//! their storage dtype.

use std::collections::HashMap;
use std::path::Path;

use flora_core::{Dtype, FloraError};
use mlx_rs::{Array, Dtype as MlxDtype};
use safetensors::tensor::TensorView;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::hashes::{legacy_hash, model_hash, LEGACY_HASH_KEY, MODEL_HASH_KEY};
use crate::{LoraError, Result};

/// Flat mapping from tensor name to tensor.
pub type WeightMap = HashMap<String, Array>;

/// File-level metadata.
pub type Metadata = HashMap<String, String>;

/// MLX dtype for a storage precision.
pub fn to_mlx_dtype(dtype: Dtype) -> MlxDtype {
    match dtype {
        Dtype::Float32 => MlxDtype::Float32,
        Dtype::Float16 => MlxDtype::Float16,
        Dtype::BFloat16 => MlxDtype::Bfloat16,
    }
}

/// Storage precision of an MLX dtype, if it is one flora writes.
pub fn from_mlx_dtype(dtype: MlxDtype) -> Option<Dtype> {
    match dtype {
        MlxDtype::Float32 => Some(Dtype::Float32),
        MlxDtype::Float16 => Some(Dtype::Float16),
        MlxDtype::Bfloat16 => Some(Dtype::BFloat16),
        _ => None,
    }
}

/// Load all tensors from a safetensors file.
pub fn load_safetensors(path: impl AsRef<Path>) -> Result<WeightMap> {
    Ok(load_safetensors_with_metadata(path)?.0)
}

/// Load all tensors and the metadata block from a safetensors file.
pub fn load_safetensors_with_metadata(path: impl AsRef<Path>) -> Result<(WeightMap, Metadata)> {
    let path = path.as_ref();
    if path.extension().map_or(true, |e| e != "safetensors") {
        return Err(FloraError::InvalidArgument(format!(
            "only .safetensors files are supported: {}",
            path.display()
        ))
        .into());
    }

    let data = std::fs::read(path)?;
    let (_, header) = SafeTensors::read_metadata(&data)?;
    let metadata = header.metadata().clone().unwrap_or_default();
    let tensors = SafeTensors::deserialize(&data)?;

    let mut weights = WeightMap::with_capacity(tensors.len());
    for (name, view) in tensors.tensors() {
        weights.insert(name.clone(), decode_tensor(&name, &view)?);
    }
    info!("Loaded {} tensors from {:?}", weights.len(), path);
    Ok((weights, metadata))
}

fn decode_tensor(name: &str, view: &TensorView<'_>) -> Result<Array> {
    let shape: Vec<i32> = view.shape().iter().map(|&s| s as i32).collect();
    let data = view.data();

    // Read through byte chunks; the mmap'd buffer has no alignment guarantee.
    let (floats, dtype): (Vec<f32>, MlxDtype) = match view.dtype() {
        safetensors::Dtype::F32 => (
            data.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            MlxDtype::Float32,
        ),
        safetensors::Dtype::F16 => (
            data.chunks_exact(2)
                .map(|b| half::f16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            MlxDtype::Float16,
        ),
        safetensors::Dtype::BF16 => (
            data.chunks_exact(2)
                .map(|b| half::bf16::from_le_bytes([b[0], b[1]]).to_f32())
                .collect(),
            MlxDtype::Bfloat16,
        ),
        other => {
            return Err(LoraError::InvalidState(format!(
                "unsupported dtype {other:?} for tensor {name}"
            )))
        }
    };

    let array = Array::from_slice(&floats, &shape);
    if dtype == MlxDtype::Float32 {
        Ok(array)
    } else {
        Ok(array.as_dtype(dtype)?)
    }
}

struct EncodedTensor {
    name: String,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

/// Flatten to host f32 values in row-major order.
pub fn to_f32_vec(array: &Array) -> Result<Vec<f32>> {
    let flat = array.as_dtype(MlxDtype::Float32)?.reshape(&[-1])?;
    flat.eval()?;
    Ok(flat.as_slice::<f32>().to_vec())
}

fn encode_tensor(name: &str, array: &Array, dtype: Option<Dtype>) -> Result<EncodedTensor> {
    let target = match dtype {
        Some(d) => d,
        None => from_mlx_dtype(array.dtype()).ok_or_else(|| {
            LoraError::InvalidState(format!(
                "tensor {name} has unsupported dtype {:?}",
                array.dtype()
            ))
        })?,
    };

    // Round through the target precision so values match what is written.
    let values = to_f32_vec(&array.as_dtype(to_mlx_dtype(target))?)?;
    let (st_dtype, bytes): (safetensors::Dtype, Vec<u8>) = match target {
        Dtype::Float32 => (safetensors::Dtype::F32, bytemuck::cast_slice(&values).to_vec()),
        Dtype::Float16 => {
            let halfs: Vec<half::f16> = values.iter().map(|&v| half::f16::from_f32(v)).collect();
            (safetensors::Dtype::F16, bytemuck::cast_slice(&halfs).to_vec())
        }
        Dtype::BFloat16 => {
            let halfs: Vec<half::bf16> = values.iter().map(|&v| half::bf16::from_f32(v)).collect();
            (safetensors::Dtype::BF16, bytemuck::cast_slice(&halfs).to_vec())
        }
    };

    Ok(EncodedTensor {
        name: name.to_string(),
        dtype: st_dtype,
        shape: array.shape().iter().map(|&s| s as usize).collect(),
        bytes,
    })
}

fn views(encoded: &[EncodedTensor]) -> Result<Vec<(&str, TensorView<'_>)>> {
    encoded
        .iter()
        .map(|t| {
            Ok((
                t.name.as_str(),
                TensorView::new(t.dtype, t.shape.clone(), &t.bytes)?,
            ))
        })
        .collect()
}

/// Compute `(sshs_model_hash, sshs_legacy_hash)` for a weight map.
///
/// Only `ss_*` metadata keys take part in the hashed serialization.
pub fn precalculate_hashes(
    weights: &WeightMap,
    dtype: Option<Dtype>,
    metadata: &Metadata,
) -> Result<(String, String)> {
    let encoded = weights
        .iter()
        .map(|(name, array)| encode_tensor(name, array, dtype))
        .collect::<Result<Vec<_>>>()?;
    hashes_for(&encoded, metadata)
}

fn hashes_for(encoded: &[EncodedTensor], metadata: &Metadata) -> Result<(String, String)> {
    let training_meta: Metadata = metadata
        .iter()
        .filter(|(k, _)| k.starts_with("ss_"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let training_meta = (!training_meta.is_empty()).then_some(training_meta);

    let serialized = safetensors::serialize(views(encoded)?, &training_meta)?;
    Ok((model_hash(&serialized)?, legacy_hash(&serialized)))
}

/// Save a weight map as safetensors.
///
/// Tensors are cast to `dtype` when given. The two integrity hashes are
/// computed and added to `metadata` before writing.
pub fn save_safetensors(
    path: impl AsRef<Path>,
    weights: &WeightMap,
    dtype: Option<Dtype>,
    metadata: Option<Metadata>,
) -> Result<()> {
    let path = path.as_ref();
    let mut encoded = weights
        .iter()
        .map(|(name, array)| encode_tensor(name, array, dtype))
        .collect::<Result<Vec<_>>>()?;
    encoded.sort_by(|a, b| a.name.cmp(&b.name));

    let mut metadata = metadata.unwrap_or_default();
    let (model, legacy) = hashes_for(&encoded, &metadata)?;
    debug!("{MODEL_HASH_KEY}={model} {LEGACY_HASH_KEY}={legacy}");
    metadata.insert(MODEL_HASH_KEY.to_string(), model);
    metadata.insert(LEGACY_HASH_KEY.to_string(), legacy);

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    safetensors::serialize_to_file(views(&encoded)?, &Some(metadata), path)?;
    info!("Saved {} tensors to {:?}", encoded.len(), path);
    Ok(())
}
