//! Model configuration
//!
//! Defaults reproduce the reference FH-PS network: a five stage encoder going
//! 3 -> 64 -> 128 -> 256 -> 512 -> 1024 channels and a three class output head.

use std::path::Path;

use candle_core::{bail, Result};
use serde::{Deserialize, Serialize};

/// How the directional guidance branch derives its direction planes from the
/// predicted mask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectionMode {
    /// Direction planes are all zeros.
    #[default]
    Zeros,
    /// Central finite differences of the channel-averaged mask.
    Gradient,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FhpsConfig {
    /// Image channels fed to the first encoder stage
    pub in_channels: usize,
    /// Output channels of the five encoder stages, shallowest first
    pub encoder_channels: Vec<usize>,
    /// Number of segmentation classes (output channels of both decoders)
    pub num_classes: usize,
    /// BatchNorm epsilon
    pub bn_eps: f64,
    pub direction: DirectionMode,
    /// Gate the guidance conv output with the direction magnitude
    pub guided_modulation: bool,
}

impl Default for FhpsConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            encoder_channels: vec![64, 128, 256, 512, 1024],
            num_classes: 3,
            bn_eps: 1e-5,
            direction: DirectionMode::Zeros,
            guided_modulation: false,
        }
    }
}

impl FhpsConfig {
    pub const NUM_STAGES: usize = 5;

    /// Narrow variant with the same topology, handy for quick experiments
    pub fn tiny() -> Self {
        Self {
            encoder_channels: vec![8, 16, 32, 64, 128],
            ..Self::default()
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw).map_err(candle_core::Error::wrap)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.encoder_channels.len() != Self::NUM_STAGES {
            bail!(
                "expected {} encoder stages, got {}",
                Self::NUM_STAGES,
                self.encoder_channels.len()
            )
        }
        if self.encoder_channels.contains(&0) || self.in_channels == 0 {
            bail!("channel counts must be non-zero: {:?}", self.encoder_channels)
        }
        if self.num_classes == 0 {
            bail!("num_classes must be at least 1")
        }
        Ok(())
    }

    /// Channels of the deepest encoder stage (attention / MSFSM width)
    pub fn bottleneck_channels(&self) -> usize {
        self.encoder_channels[Self::NUM_STAGES - 1]
    }

    /// Every encoder stage halves the resolution
    pub fn downsample_factor(&self) -> usize {
        1 << Self::NUM_STAGES
    }

    /// The MSFSM pooling branch needs at least a 2x2 bottleneck
    pub fn min_input_size(&self) -> usize {
        2 * self.downsample_factor()
    }
}
