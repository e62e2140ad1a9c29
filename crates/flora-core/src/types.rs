//! Common type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::FloraError;

/// Storage precision for weight tensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 32-bit floating point.
    #[default]
    Float32,
    /// 16-bit floating point.
    Float16,
    /// Brain floating point (16-bit).
    BFloat16,
}

impl FromStr for Dtype {
    type Err = FloraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float" | "float32" | "f32" | "fp32" => Ok(Self::Float32),
            "fp16" | "float16" | "f16" => Ok(Self::Float16),
            "bf16" | "bfloat16" => Ok(Self::BFloat16),
            other => Err(FloraError::InvalidArgument(format!(
                "unknown precision: {other}"
            ))),
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
        };
        f.write_str(name)
    }
}

/// Compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    /// CPU computation.
    #[default]
    Cpu,
    /// GPU computation (Metal on macOS).
    Gpu,
}

/// Which backbone block families receive adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TrainBlocks {
    /// Both double-stream and single-stream blocks.
    #[default]
    All,
    /// Single-stream blocks only.
    Single,
    /// Double-stream blocks only.
    Double,
}

impl TrainBlocks {
    /// Whether blocks of the given family class are selected.
    #[must_use]
    pub fn includes(&self, block_class: &str) -> bool {
        match self {
            Self::All => true,
            Self::Single => block_class == "SingleStreamBlock",
            Self::Double => block_class == "DoubleStreamBlock",
        }
    }
}

impl FromStr for TrainBlocks {
    type Err = FloraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Self::All),
            "single" => Ok(Self::Single),
            "double" => Ok(Self::Double),
            other => Err(FloraError::InvalidArgument(format!(
                "invalid train_blocks: {other}"
            ))),
        }
    }
}

impl fmt::Display for TrainBlocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::All => "all",
            Self::Single => "single",
            Self::Double => "double",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_parse() {
        assert_eq!("fp16".parse::<Dtype>().unwrap(), Dtype::Float16);
        assert_eq!("BF16".parse::<Dtype>().unwrap(), Dtype::BFloat16);
        assert_eq!("float".parse::<Dtype>().unwrap(), Dtype::Float32);
        assert!("int8".parse::<Dtype>().is_err());
    }

    #[test]
    fn test_train_blocks_includes() {
        assert!(TrainBlocks::All.includes("DoubleStreamBlock"));
        assert!(TrainBlocks::All.includes("SingleStreamBlock"));
        assert!(TrainBlocks::Single.includes("SingleStreamBlock"));
        assert!(!TrainBlocks::Single.includes("DoubleStreamBlock"));
        assert!(!TrainBlocks::Double.includes("SingleStreamBlock"));
    }

    #[test]
    fn test_train_blocks_parse() {
        assert_eq!("double".parse::<TrainBlocks>().unwrap(), TrainBlocks::Double);
        assert!("both".parse::<TrainBlocks>().is_err());
    }
}
