//! Frozen base layers and their weight backups.
//!
//! A [`BaseLayer`] is the pretrained linear or convolutional layer an adapter
//! targets. Its weight is only ever replaced as a whole (MLX arrays are
//! immutable), so a backup is just the retained handle of the pristine array.
//!
//! Backups follow a small state machine:
//!
//! ```text
//!   (none) --backup--> Pristine --merge--> Merged --restore--> Restored
//!                         ^                  |  ^                  |
//!                         |                  +--+ merge            |
//!                         +-------------------backup---------------+
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use mlx_rs::{Array, Dtype as MlxDtype};
use tracing::debug;

use crate::{LoraError, Result};

/// Shared handle to a base layer.
pub type SharedLayer = Rc<RefCell<BaseLayer>>;

/// Static shape description of a target layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerGeometry {
    /// Dense layer, weight `[out_features, in_features]`.
    Linear {
        /// Input features.
        in_features: i32,
        /// Output features.
        out_features: i32,
    },
    /// 2-D convolution, weight `[out_channels, in_channels, kh, kw]`.
    Conv2d {
        /// Input channels.
        in_channels: i32,
        /// Output channels.
        out_channels: i32,
        /// Kernel size `(kh, kw)`.
        kernel: (i32, i32),
        /// Stride.
        stride: (i32, i32),
        /// Zero padding.
        padding: (i32, i32),
    },
}

impl LayerGeometry {
    /// Infer geometry from a checkpoint weight shape.
    ///
    /// Convolutions get stride 1 and "same" padding.
    pub fn from_weight_shape(shape: &[i32]) -> Option<Self> {
        match *shape {
            [out_features, in_features] => Some(Self::Linear {
                in_features,
                out_features,
            }),
            [out_channels, in_channels, kh, kw] => Some(Self::Conv2d {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                stride: (1, 1),
                padding: (kh / 2, kw / 2),
            }),
            _ => None,
        }
    }

    /// Input dimension (features or channels).
    pub fn in_dim(&self) -> i32 {
        match *self {
            Self::Linear { in_features, .. } => in_features,
            Self::Conv2d { in_channels, .. } => in_channels,
        }
    }

    /// Output dimension (features or channels).
    pub fn out_dim(&self) -> i32 {
        match *self {
            Self::Linear { out_features, .. } => out_features,
            Self::Conv2d { out_channels, .. } => out_channels,
        }
    }

    /// Kernel size for convolutions.
    pub fn kernel(&self) -> Option<(i32, i32)> {
        match *self {
            Self::Linear { .. } => None,
            Self::Conv2d { kernel, .. } => Some(kernel),
        }
    }

    /// Whether this is a dense layer.
    pub fn is_linear(&self) -> bool {
        matches!(self, Self::Linear { .. })
    }

    /// Whether this is a 1x1 convolution.
    pub fn is_pointwise_conv(&self) -> bool {
        self.kernel() == Some((1, 1))
    }

    /// Expected weight shape.
    pub fn weight_shape(&self) -> Vec<i32> {
        match *self {
            Self::Linear {
                in_features,
                out_features,
            } => vec![out_features, in_features],
            Self::Conv2d {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                ..
            } => vec![out_channels, in_channels, kh, kw],
        }
    }

    /// Module class name used during discovery.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Linear { .. } => "Linear",
            Self::Conv2d { .. } => "Conv2d",
        }
    }
}

/// Position of a layer in the backup state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    /// Snapshot taken, weight equals the snapshot.
    Pristine,
    /// One or more deltas folded into the weight.
    Merged,
    /// Snapshot written back. Must be re-armed before the next merge.
    Restored,
}

#[derive(Debug, Clone)]
struct WeightBackup {
    snapshot: Array,
    state: BackupState,
}

/// A frozen pretrained layer.
#[derive(Debug, Clone)]
pub struct BaseLayer {
    geometry: LayerGeometry,
    weight: Array,
    bias: Option<Array>,
    backup: Option<WeightBackup>,
}

impl BaseLayer {
    /// Create a layer, checking the weight against the geometry.
    pub fn new(geometry: LayerGeometry, weight: Array, bias: Option<Array>) -> Result<Self> {
        let expected = geometry.weight_shape();
        if weight.shape() != expected.as_slice() {
            return Err(LoraError::ShapeMismatch(format!(
                "layer weight expected {:?}, got {:?}",
                expected,
                weight.shape()
            )));
        }
        if let Some(ref b) = bias {
            if b.shape() != [geometry.out_dim()] {
                return Err(LoraError::ShapeMismatch(format!(
                    "layer bias expected [{}], got {:?}",
                    geometry.out_dim(),
                    b.shape()
                )));
            }
        }
        Ok(Self {
            geometry,
            weight,
            bias,
            backup: None,
        })
    }

    /// Dense layer from a `[out, in]` weight.
    pub fn linear(weight: Array, bias: Option<Array>) -> Result<Self> {
        let geometry = match *weight.shape() {
            [out_features, in_features] => LayerGeometry::Linear {
                in_features,
                out_features,
            },
            _ => {
                return Err(LoraError::ShapeMismatch(format!(
                    "linear weight must be 2-D, got {:?}",
                    weight.shape()
                )))
            }
        };
        Self::new(geometry, weight, bias)
    }

    /// Convolution from an `[out, in, kh, kw]` weight.
    pub fn conv2d(
        weight: Array,
        bias: Option<Array>,
        stride: (i32, i32),
        padding: (i32, i32),
    ) -> Result<Self> {
        let geometry = match *weight.shape() {
            [out_channels, in_channels, kh, kw] => LayerGeometry::Conv2d {
                in_channels,
                out_channels,
                kernel: (kh, kw),
                stride,
                padding,
            },
            _ => {
                return Err(LoraError::ShapeMismatch(format!(
                    "conv2d weight must be 4-D, got {:?}",
                    weight.shape()
                )))
            }
        };
        Self::new(geometry, weight, bias)
    }

    /// Wrap into a shared handle.
    pub fn into_shared(self) -> SharedLayer {
        Rc::new(RefCell::new(self))
    }

    /// Layer geometry.
    pub fn geometry(&self) -> LayerGeometry {
        self.geometry
    }

    /// Current weight.
    pub fn weight(&self) -> &Array {
        &self.weight
    }

    /// Bias, if any.
    pub fn bias(&self) -> Option<&Array> {
        self.bias.as_ref()
    }

    /// Plain forward pass. Convolutions take and return NCHW activations.
    pub fn forward(&self, x: &Array) -> Result<Array> {
        match self.geometry {
            LayerGeometry::Linear { .. } => linear_forward(x, &self.weight, self.bias.as_ref()),
            LayerGeometry::Conv2d {
                stride, padding, ..
            } => {
                let y = conv2d_nchw(x, &self.weight, stride, padding)?;
                match self.bias {
                    Some(ref bias) => {
                        let bias = bias.reshape(&[1, self.geometry.out_dim(), 1, 1])?;
                        Ok(y.add(&bias)?)
                    }
                    None => Ok(y),
                }
            }
        }
    }

    /// Backup state, `None` when no snapshot has been taken.
    pub fn backup_state(&self) -> Option<BackupState> {
        self.backup.as_ref().map(|b| b.state)
    }

    /// Snapshot the pristine weight, or re-arm a restored backup.
    pub fn backup(&mut self) -> Result<()> {
        match self.backup_state() {
            None => {
                self.backup = Some(WeightBackup {
                    snapshot: self.weight.clone(),
                    state: BackupState::Pristine,
                });
                Ok(())
            }
            Some(BackupState::Restored) => {
                if let Some(b) = self.backup.as_mut() {
                    b.state = BackupState::Pristine;
                }
                Ok(())
            }
            from => Err(LoraError::IllegalTransition {
                operation: "backup",
                from,
            }),
        }
    }

    /// Add a full-precision delta to the weight.
    ///
    /// The sum is computed in f32 and cast to `dtype`, or to the weight's
    /// current dtype when `None`. Layers without a backup are merged
    /// irreversibly.
    pub fn merge_delta(&mut self, delta: &Array, dtype: Option<MlxDtype>) -> Result<()> {
        if let Some(ref b) = self.backup {
            if b.state == BackupState::Restored {
                return Err(LoraError::IllegalTransition {
                    operation: "merge",
                    from: Some(b.state),
                });
            }
        }
        if delta.shape() != self.weight.shape() {
            return Err(LoraError::ShapeMismatch(format!(
                "delta {:?} does not match weight {:?}",
                delta.shape(),
                self.weight.shape()
            )));
        }

        let dtype = dtype.unwrap_or(self.weight.dtype());
        let merged = self
            .weight
            .as_dtype(MlxDtype::Float32)?
            .add(&delta.as_dtype(MlxDtype::Float32)?)?
            .as_dtype(dtype)?;
        self.weight = merged;

        match self.backup {
            Some(ref mut b) => b.state = BackupState::Merged,
            None => debug!("merging into layer without backup"),
        }
        Ok(())
    }

    /// Write the snapshot back.
    pub fn restore(&mut self) -> Result<()> {
        match self.backup.as_mut() {
            Some(b) if b.state == BackupState::Merged => {
                self.weight = b.snapshot.clone();
                b.state = BackupState::Restored;
                Ok(())
            }
            other => Err(LoraError::IllegalTransition {
                operation: "restore",
                from: other.map(|b| b.state),
            }),
        }
    }
}

/// `x @ W.T + b`
pub(crate) fn linear_forward(x: &Array, weight: &Array, bias: Option<&Array>) -> Result<Array> {
    let y = x.matmul(&weight.t())?;
    match bias {
        Some(bias) => Ok(y.add(bias)?),
        None => Ok(y),
    }
}

/// Convolution over NCHW activations with an `[out, in, kh, kw]` weight.
pub(crate) fn conv2d_nchw(
    x: &Array,
    weight: &Array,
    stride: (i32, i32),
    padding: (i32, i32),
) -> Result<Array> {
    let x = x.transpose_axes(&[0, 2, 3, 1])?;
    let w = weight.transpose_axes(&[0, 2, 3, 1])?;
    let y = mlx_rs::ops::conv2d(&x, &w, stride, padding, None, None)?;
    Ok(y.transpose_axes(&[0, 3, 1, 2])?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear(out_features: i32, in_features: i32) -> BaseLayer {
        let w = mlx_rs::random::normal::<f32>(&[out_features, in_features], None, None, None)
            .unwrap();
        BaseLayer::linear(w, None).unwrap()
    }

    #[test]
    fn test_geometry_from_shape() {
        let g = LayerGeometry::from_weight_shape(&[64, 32, 3, 3]).unwrap();
        assert_eq!(g.in_dim(), 32);
        assert_eq!(g.out_dim(), 64);
        assert_eq!(g.kernel(), Some((3, 3)));
        assert!(!g.is_pointwise_conv());
        assert!(matches!(
            g,
            LayerGeometry::Conv2d {
                padding: (1, 1),
                ..
            }
        ));
        assert!(LayerGeometry::from_weight_shape(&[8]).is_none());
    }

    #[test]
    fn test_linear_forward_shape() {
        let layer = linear(16, 8);
        let x = mlx_rs::random::normal::<f32>(&[2, 3, 8], None, None, None).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 3, 16]);
    }

    #[test]
    fn test_conv_forward_shape() {
        let w = mlx_rs::random::normal::<f32>(&[6, 4, 3, 3], None, None, None).unwrap();
        let b = mlx_rs::ops::zeros::<f32>(&[6]).unwrap();
        let layer = BaseLayer::conv2d(w, Some(b), (1, 1), (1, 1)).unwrap();
        let x = mlx_rs::random::normal::<f32>(&[2, 4, 5, 5], None, None, None).unwrap();
        let y = layer.forward(&x).unwrap();
        assert_eq!(y.shape(), &[2, 6, 5, 5]);
    }

    #[test]
    fn test_rejects_bad_bias() {
        let w = mlx_rs::ops::zeros::<f32>(&[4, 2]).unwrap();
        let b = mlx_rs::ops::zeros::<f32>(&[3]).unwrap();
        assert!(BaseLayer::linear(w, Some(b)).is_err());
    }

    #[test]
    fn test_backup_state_machine() {
        let mut layer = linear(4, 4);
        assert_eq!(layer.backup_state(), None);

        // restore without a backup is rejected
        assert!(matches!(
            layer.restore(),
            Err(LoraError::IllegalTransition { from: None, .. })
        ));

        layer.backup().unwrap();
        assert_eq!(layer.backup_state(), Some(BackupState::Pristine));
        assert!(layer.backup().is_err());
        assert!(layer.restore().is_err());

        let delta = mlx_rs::ops::ones::<f32>(&[4, 4]).unwrap();
        layer.merge_delta(&delta, None).unwrap();
        layer.merge_delta(&delta, None).unwrap();
        assert_eq!(layer.backup_state(), Some(BackupState::Merged));

        layer.restore().unwrap();
        assert_eq!(layer.backup_state(), Some(BackupState::Restored));
        assert!(layer.restore().is_err());
        assert!(layer.merge_delta(&delta, None).is_err());

        layer.backup().unwrap();
        assert_eq!(layer.backup_state(), Some(BackupState::Pristine));
    }

    #[test]
    fn test_merge_without_backup_is_irreversible() {
        let mut layer = linear(4, 4);
        let delta = mlx_rs::ops::ones::<f32>(&[4, 4]).unwrap();
        layer.merge_delta(&delta, None).unwrap();
        assert_eq!(layer.backup_state(), None);
        assert!(layer.restore().is_err());
    }

    #[test]
    fn test_merge_keeps_storage_dtype() {
        let w = mlx_rs::ops::zeros::<f32>(&[4, 4])
            .unwrap()
            .as_dtype(MlxDtype::Float16)
            .unwrap();
        let mut layer = BaseLayer::linear(w, None).unwrap();
        let delta = mlx_rs::ops::ones::<f32>(&[4, 4]).unwrap();
        layer.merge_delta(&delta, None).unwrap();
        assert_eq!(layer.weight().dtype(), MlxDtype::Float16);

        layer.merge_delta(&delta, Some(MlxDtype::Float32)).unwrap();
        assert_eq!(layer.weight().dtype(), MlxDtype::Float32);
        let w = layer.weight().clone();
        w.eval().unwrap();
        assert!(w.as_slice::<f32>().iter().all(|&v| (v - 2.0).abs() < 1e-6));
    }

    #[test]
    fn test_merge_rejects_shape_mismatch() {
        let mut layer = linear(4, 4);
        let delta = mlx_rs::ops::ones::<f32>(&[4, 2]).unwrap();
        assert!(matches!(
            layer.merge_delta(&delta, None),
            Err(LoraError::ShapeMismatch(_))
        ));
    }
}
