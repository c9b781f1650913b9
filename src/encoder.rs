//! Convolutional encoder
//!
//! Five identical stages: conv3x3 -> bn -> relu -> maxpool(2). Each stage
//! halves the resolution, so a 128x128 input yields feature maps of
//! 64, 32, 16, 8 and 4 pixels per side.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::FhpsConfig;

/// One encoder stage. Weight layout follows `nn.Sequential(conv, bn, relu, pool)`,
/// so the conv sits under `.0` and the batch norm under `.1`.
pub struct EncoderStage {
    pub conv: Conv2d,
    pub bn: BatchNorm,
}

impl EncoderStage {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        bn_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(in_channels, out_channels, 3, cfg, vb.pp("0"))?;
        let bn = batch_norm(out_channels, bn_eps, vb.pp("1"))?;
        Ok(Self { conv, bn })
    }
}

impl ModuleT for EncoderStage {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = self.conv.forward(x)?;
        let x = self.bn.forward_t(&x, train)?;
        x.relu()?.max_pool2d(2)
    }
}

/// Multi-scale features from the encoder, shallowest first
#[derive(Debug, Clone)]
pub struct EncoderFeatures {
    pub x1: Tensor,
    pub x2: Tensor,
    pub x3: Tensor,
    pub x4: Tensor,
    pub x5: Tensor,
}

impl EncoderFeatures {
    /// Skip connections consumed by the refinement decoder (all but the deepest)
    pub fn skips(&self) -> [&Tensor; 4] {
        [&self.x1, &self.x2, &self.x3, &self.x4]
    }
}

pub struct Encoder {
    pub conv1: EncoderStage,
    pub conv2: EncoderStage,
    pub conv3: EncoderStage,
    pub conv4: EncoderStage,
    pub conv5: EncoderStage,
    span: tracing::Span,
}

impl Encoder {
    pub fn new(
        in_channels: usize,
        channels: &[usize],
        bn_eps: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if channels.len() != FhpsConfig::NUM_STAGES {
            candle_core::bail!(
                "encoder needs {} stage widths, got {:?}",
                FhpsConfig::NUM_STAGES,
                channels
            )
        }
        let conv1 = EncoderStage::new(in_channels, channels[0], bn_eps, vb.pp("conv1"))?;
        let conv2 = EncoderStage::new(channels[0], channels[1], bn_eps, vb.pp("conv2"))?;
        let conv3 = EncoderStage::new(channels[1], channels[2], bn_eps, vb.pp("conv3"))?;
        let conv4 = EncoderStage::new(channels[2], channels[3], bn_eps, vb.pp("conv4"))?;
        let conv5 = EncoderStage::new(channels[3], channels[4], bn_eps, vb.pp("conv5"))?;
        let span = tracing::span!(tracing::Level::TRACE, "encoder");
        Ok(Self {
            conv1,
            conv2,
            conv3,
            conv4,
            conv5,
            span,
        })
    }

    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<EncoderFeatures> {
        let _enter = self.span.enter();
        let x1 = self.conv1.forward_t(x, train)?;
        let x2 = self.conv2.forward_t(&x1, train)?;
        let x3 = self.conv3.forward_t(&x2, train)?;
        let x4 = self.conv4.forward_t(&x3, train)?;
        let x5 = self.conv5.forward_t(&x4, train)?;
        Ok(EncoderFeatures { x1, x2, x3, x4, x5 })
    }

    pub fn forward(&self, x: &Tensor) -> Result<EncoderFeatures> {
        self.forward_t(x, false)
    }
}
