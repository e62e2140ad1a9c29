//! Split-QKV partitioning.
//!
//! Fused Flux projections can be trained as several low-rank branches that
//! share one input. On disk they are always stored as a single decomposition:
//! the branch downs are stacked row-wise and the branch ups are placed on the
//! block diagonal of a zero `[sum(split_dims), rank * n]` matrix.

use flora_core::FluxBlockDims;
use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;

use crate::{LoraError, Result};

/// Fixed partition for a fused Flux projection, if `name` is one.
///
/// Double-stream `qkv` splits into three attention projections; single-stream
/// `linear1` additionally carries the MLP input.
pub fn split_dims_for(name: &str, dims: &FluxBlockDims) -> Option<Vec<i32>> {
    let hidden = dims.hidden_size as i32;
    if name.contains("double") && name.contains("qkv") {
        Some(vec![hidden; 3])
    } else if name.contains("single") && name.contains("linear1") {
        Some(vec![hidden, hidden, hidden, dims.mlp_hidden as i32])
    } else {
        None
    }
}

/// Fold branch weights into the dense on-disk form.
///
/// Returns `(down, up)` with shapes `[rank * n, in]` and
/// `[sum(split_dims), rank * n]`.
pub fn merge_split_weights(
    downs: &[Array],
    ups: &[Array],
    split_dims: &[i32],
) -> Result<(Array, Array)> {
    let n = split_dims.len();
    if downs.len() != n || ups.len() != n {
        return Err(LoraError::InvalidSplit(format!(
            "expected {n} branches, got {} downs and {} ups",
            downs.len(),
            ups.len()
        )));
    }

    let first = ups
        .first()
        .ok_or_else(|| LoraError::InvalidSplit("no branches to merge".into()))?;
    let rank = first.dim(1);
    let total_rank = rank * n as i32;
    let dtype = first.dtype();

    let down_refs: Vec<&Array> = downs.iter().collect();
    let down = mlx_rs::ops::concatenate_axis(&down_refs, 0)?;

    let mut rows = Vec::with_capacity(n);
    for (j, (up, &split)) in ups.iter().zip(split_dims).enumerate() {
        if up.shape() != [split, rank] {
            return Err(LoraError::ShapeMismatch(format!(
                "branch {j} up expected [{split}, {rank}], got {:?}",
                up.shape()
            )));
        }
        let left = j as i32 * rank;
        let right = total_rank - left - rank;
        let mut pieces = Vec::with_capacity(3);
        if left > 0 {
            pieces.push(mlx_rs::ops::zeros::<f32>(&[split, left])?.as_dtype(dtype)?);
        }
        pieces.push(up.clone());
        if right > 0 {
            pieces.push(mlx_rs::ops::zeros::<f32>(&[split, right])?.as_dtype(dtype)?);
        }
        let refs: Vec<&Array> = pieces.iter().collect();
        rows.push(mlx_rs::ops::concatenate_axis(&refs, 1)?);
    }
    let row_refs: Vec<&Array> = rows.iter().collect();
    let up = mlx_rs::ops::concatenate_axis(&row_refs, 0)?;

    Ok((down, up))
}

/// Recover branch weights from the dense on-disk form.
///
/// The down weight is chunked evenly along its rows; each branch up is the
/// non-zero block `up[offset..offset + split_j, j * rank..(j + 1) * rank]`.
pub fn split_dense_weights(
    down: &Array,
    up: &Array,
    split_dims: &[i32],
) -> Result<(Vec<Array>, Vec<Array>)> {
    let n = split_dims.len() as i32;
    if n == 0 || down.ndim() != 2 || up.ndim() != 2 {
        return Err(LoraError::InvalidSplit(format!(
            "cannot split down {:?} / up {:?} into {n} branches",
            down.shape(),
            up.shape()
        )));
    }
    let total: i32 = split_dims.iter().sum();
    if down.dim(0) % n != 0 || up.dim(1) % n != 0 || up.dim(0) != total {
        return Err(LoraError::InvalidSplit(format!(
            "down {:?} / up {:?} do not fit split dims {:?}",
            down.shape(),
            up.shape(),
            split_dims
        )));
    }

    let chunk = down.dim(0) / n;
    let rank = up.dim(1) / n;
    let mut downs = Vec::with_capacity(split_dims.len());
    let mut ups = Vec::with_capacity(split_dims.len());
    let mut offset = 0;
    for (j, &split) in split_dims.iter().enumerate() {
        let j = j as i32;
        downs.push(down.index((j * chunk..(j + 1) * chunk, ..)));
        ups.push(up.index((offset..offset + split, j * rank..(j + 1) * rank)));
        offset += split;
    }
    Ok((downs, ups))
}
