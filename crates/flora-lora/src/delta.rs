//! Dense delta geometry.
//!
//! Turns a `(up, down)` decomposition into the dense weight update it
//! represents, computed in f32:
//!
//! - Linear: `up @ down`
//! - 1x1 convolution: the same product on the squeezed kernels
//! - 3x3 convolution: `down` convolved by the 1x1 `up` kernel, with the
//!   channel axes permuted so the result is `[out, in, kh, kw]`
//!
//! Other kernel sizes are rejected.

use flora_core::Device;
use mlx_rs::{Array, Dtype as MlxDtype, StreamOrDevice};

use crate::{LoraError, Result};

/// Stream for heavy merge math on `device`.
pub(crate) fn stream_for(device: Device) -> StreamOrDevice {
    match device {
        Device::Cpu => StreamOrDevice::cpu(),
        Device::Gpu => StreamOrDevice::gpu(),
    }
}

/// Unscaled dense delta of one decomposition.
pub fn dense_delta(up: &Array, down: &Array, device: Device) -> Result<Array> {
    let stream = stream_for(device);
    let up = up.as_dtype(MlxDtype::Float32)?;
    let down = down.as_dtype(MlxDtype::Float32)?;

    match (up.shape(), down.shape()) {
        ([_, up_rank], [down_rank, _]) if up_rank == down_rank => {
            Ok(mlx_rs::ops::matmul_device(&up, &down, &stream)?)
        }
        ([out, rank, 1, 1], [down_rank, in_dim, 1, 1]) if rank == down_rank => {
            let (out, rank, in_dim) = (*out, *rank, *in_dim);
            let up = up.reshape(&[out, rank])?;
            let down = down.reshape(&[rank, in_dim])?;
            let product = mlx_rs::ops::matmul_device(&up, &down, &stream)?;
            Ok(product.reshape(&[out, in_dim, 1, 1])?)
        }
        ([_, rank, 1, 1], [down_rank, _, 3, 3]) if rank == down_rank => {
            // [rank, in, kh, kw] -> NHWC batch of `in` images with `rank` channels
            let input = down.transpose_axes(&[1, 2, 3, 0])?;
            let kernel = up.transpose_axes(&[0, 2, 3, 1])?;
            let conved = mlx_rs::ops::conv2d_device(
                &input, &kernel, (1, 1), (0, 0), None, None, &stream,
            )?;
            // [in, kh, kw, out] -> [out, in, kh, kw]
            Ok(conved.transpose_axes(&[3, 0, 1, 2])?)
        }
        ([_, _, 1, 1], [_, _, kh, kw]) if [*kh, *kw] != [1, 1] && [*kh, *kw] != [3, 3] => {
            Err(LoraError::UnsupportedKernel(vec![*kh, *kw]))
        }
        ([_, _, uh, uw], [_, _, _, _]) if [*uh, *uw] != [1, 1] => {
            Err(LoraError::UnsupportedKernel(vec![*uh, *uw]))
        }
        (up_shape, down_shape) => Err(LoraError::ShapeMismatch(format!(
            "cannot combine up {:?} with down {:?}",
            up_shape, down_shape
        ))),
    }
}

/// Unscaled dense delta of a split decomposition.
///
/// Each branch contributes its own block of output rows, in branch order.
pub fn split_delta(ups: &[Array], downs: &[Array], device: Device) -> Result<Array> {
    if ups.len() != downs.len() || ups.is_empty() {
        return Err(LoraError::InvalidSplit(format!(
            "{} up weights for {} down weights",
            ups.len(),
            downs.len()
        )));
    }
    let blocks = ups
        .iter()
        .zip(downs)
        .map(|(up, down)| dense_delta(up, down, device))
        .collect::<Result<Vec<_>>>()?;
    let refs: Vec<&Array> = blocks.iter().collect();
    Ok(mlx_rs::ops::concatenate_axis(&refs, 0)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn max_abs_diff(a: &Array, b: &Array) -> f32 {
        let diff = a.subtract(b).unwrap().abs().unwrap().max(None).unwrap();
        diff.eval().unwrap();
        diff.item::<f32>()
    }

    #[test]
    fn test_linear_delta() {
        let up = Array::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[2, 2]);
        let down = Array::from_slice(&[1.0f32, 0.0, 1.0, 0.0, 1.0, 1.0], &[2, 3]);
        let delta = dense_delta(&up, &down, Device::Cpu).unwrap();
        let expected = Array::from_slice(&[1.0f32, 2.0, 3.0, 3.0, 4.0, 7.0], &[2, 3]);
        assert_eq!(delta.shape(), &[2, 3]);
        assert!(max_abs_diff(&delta, &expected) < 1e-6);
    }

    #[test]
    fn test_pointwise_conv_matches_linear() {
        let up = mlx_rs::random::normal::<f32>(&[6, 2], None, None, None).unwrap();
        let down = mlx_rs::random::normal::<f32>(&[2, 5], None, None, None).unwrap();
        let linear = dense_delta(&up, &down, Device::Cpu).unwrap();

        let conv = dense_delta(
            &up.reshape(&[6, 2, 1, 1]).unwrap(),
            &down.reshape(&[2, 5, 1, 1]).unwrap(),
            Device::Cpu,
        )
        .unwrap();
        assert_eq!(conv.shape(), &[6, 5, 1, 1]);
        let conv = conv.reshape(&[6, 5]).unwrap();
        assert!(max_abs_diff(&conv, &linear) < 1e-5);
    }

    #[test]
    fn test_3x3_conv_delta_is_channel_mix() {
        // A 1x1 up kernel only mixes rank channels, so every spatial tap of
        // the delta is `up @ down[:, :, h, w]`.
        let up = mlx_rs::random::normal::<f32>(&[4, 2, 1, 1], None, None, None).unwrap();
        let down = mlx_rs::random::normal::<f32>(&[2, 3, 3, 3], None, None, None).unwrap();
        let delta = dense_delta(&up, &down, Device::Cpu).unwrap();
        assert_eq!(delta.shape(), &[4, 3, 3, 3]);

        let up2 = up.reshape(&[4, 2]).unwrap();
        let expected = up2
            .matmul(&down.reshape(&[2, 27]).unwrap())
            .unwrap()
            .reshape(&[4, 3, 3, 3])
            .unwrap();
        assert!(max_abs_diff(&delta, &expected) < 1e-4);
    }

    #[test]
    fn test_rejects_other_kernels() {
        let up = mlx_rs::ops::zeros::<f32>(&[4, 2, 1, 1]).unwrap();
        let down = mlx_rs::ops::zeros::<f32>(&[2, 3, 5, 5]).unwrap();
        assert!(matches!(
            dense_delta(&up, &down, Device::Cpu),
            Err(LoraError::UnsupportedKernel(_))
        ));

        let down = mlx_rs::ops::zeros::<f32>(&[2, 3, 1, 3]).unwrap();
        assert!(matches!(
            dense_delta(&up, &down, Device::Cpu),
            Err(LoraError::UnsupportedKernel(_))
        ));
    }

    #[test]
    fn test_rank_mismatch() {
        let up = mlx_rs::ops::zeros::<f32>(&[4, 2]).unwrap();
        let down = mlx_rs::ops::zeros::<f32>(&[3, 5]).unwrap();
        assert!(matches!(
            dense_delta(&up, &down, Device::Cpu),
            Err(LoraError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_split_delta_stacks_rows() {
        let ups = vec![
            mlx_rs::random::normal::<f32>(&[3, 2], None, None, None).unwrap(),
            mlx_rs::random::normal::<f32>(&[5, 2], None, None, None).unwrap(),
        ];
        let downs = vec![
            mlx_rs::random::normal::<f32>(&[2, 4], None, None, None).unwrap(),
            mlx_rs::random::normal::<f32>(&[2, 4], None, None, None).unwrap(),
        ];
        let delta = split_delta(&ups, &downs, Device::Cpu).unwrap();
        assert_eq!(delta.shape(), &[8, 4]);

        use mlx_rs::ops::indexing::IndexOp;
        let second = ups[1].matmul(&downs[1]).unwrap();
        assert!(max_abs_diff(&delta.index((3..8, ..)), &second) < 1e-5);
    }
}
