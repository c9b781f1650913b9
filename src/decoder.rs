//! Decoders for the FH-PS network
//!
//! Contains the plain MaskDecoder head and the skip-connected Decoder that
//! starts from the directional guidance block.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{conv_transpose2d, ConvTranspose2d, ConvTranspose2dConfig, VarBuilder};

use crate::config::{DirectionMode, FhpsConfig};
use crate::guidance::{calculate_direction_info, DirectionalGuidanceBlock};
use crate::interpolate::upsample_bilinear;

/// 2x2 transposed conv with stride 2: doubles the resolution
fn up2(in_channels: usize, out_channels: usize, vb: VarBuilder) -> Result<ConvTranspose2d> {
    let cfg = ConvTranspose2dConfig {
        stride: 2,
        ..Default::default()
    };
    conv_transpose2d(in_channels, out_channels, 2, cfg, vb)
}

/// Mask decoder: five stride-2 transposed convs straight from the bottleneck,
/// no activations in between.
pub struct MaskDecoder {
    pub deconv5: ConvTranspose2d,
    pub deconv4: ConvTranspose2d,
    pub deconv3: ConvTranspose2d,
    pub deconv2: ConvTranspose2d,
    pub deconv1: ConvTranspose2d,
    span: tracing::Span,
}

impl MaskDecoder {
    pub fn new(config: &FhpsConfig, vb: VarBuilder) -> Result<Self> {
        let ch = &config.encoder_channels;
        let deconv5 = up2(ch[4], ch[3], vb.pp("deconv5"))?;
        let deconv4 = up2(ch[3], ch[2], vb.pp("deconv4"))?;
        let deconv3 = up2(ch[2], ch[1], vb.pp("deconv3"))?;
        let deconv2 = up2(ch[1], ch[0], vb.pp("deconv2"))?;
        let deconv1 = up2(ch[0], config.num_classes, vb.pp("deconv1"))?;
        let span = tracing::span!(tracing::Level::TRACE, "mask-decoder");
        Ok(Self {
            deconv5,
            deconv4,
            deconv3,
            deconv2,
            deconv1,
            span,
        })
    }
}

impl Module for MaskDecoder {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let x = self.deconv5.forward(x)?;
        let x = self.deconv4.forward(&x)?;
        let x = self.deconv3.forward(&x)?;
        let x = self.deconv2.forward(&x)?;
        self.deconv1.forward(&x)
    }
}

/// Refinement decoder
///
/// DGB -> deconv5 -> [resize, cat skip4] -> deconv4 -> [resize, cat skip3]
/// -> deconv3 -> [resize, cat skip2] -> deconv2 -> [resize, cat skip1] -> deconv1
pub struct Decoder {
    pub deconv5: ConvTranspose2d,
    pub deconv4: ConvTranspose2d,
    pub deconv3: ConvTranspose2d,
    pub deconv2: ConvTranspose2d,
    pub deconv1: ConvTranspose2d,
    pub dgb: DirectionalGuidanceBlock,
    direction: DirectionMode,
    span: tracing::Span,
}

impl Decoder {
    pub fn new(config: &FhpsConfig, vb: VarBuilder) -> Result<Self> {
        let ch = &config.encoder_channels;
        // every stage after the first sees its own output concatenated with a skip
        // of the same width
        let deconv5 = up2(ch[4], ch[3], vb.pp("deconv5"))?;
        let deconv4 = up2(ch[3] * 2, ch[2], vb.pp("deconv4"))?;
        let deconv3 = up2(ch[2] * 2, ch[1], vb.pp("deconv3"))?;
        let deconv2 = up2(ch[1] * 2, ch[0], vb.pp("deconv2"))?;
        let deconv1 = up2(ch[0] * 2, config.num_classes, vb.pp("deconv1"))?;
        let dgb = DirectionalGuidanceBlock::new(ch[4], config.guided_modulation, vb.pp("dgb"))?;
        let span = tracing::span!(tracing::Level::TRACE, "decoder");
        Ok(Self {
            deconv5,
            deconv4,
            deconv3,
            deconv2,
            deconv1,
            dgb,
            direction: config.direction,
            span,
        })
    }

    /// Upsample with `deconv`, snap to the skip's resolution and concatenate it
    fn merge(deconv: &ConvTranspose2d, x: &Tensor, skip: &Tensor) -> Result<Tensor> {
        let x = deconv.forward(x)?;
        let (_, _, h, w) = skip.dims4()?;
        let x = upsample_bilinear(&x, h, w)?;
        Tensor::cat(&[&x, skip], 1)
    }

    /// `x`: bottleneck features, `skips`: encoder maps shallowest first,
    /// `mask`: prediction of the mask decoder.
    pub fn forward(&self, x: &Tensor, skips: &[&Tensor], mask: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        if skips.len() != 4 {
            bail!("decoder expects 4 skip connections, got {}", skips.len())
        }

        let direction_info = calculate_direction_info(mask, self.direction)?;
        let x = self.dgb.forward(x, &direction_info)?;

        let x = Self::merge(&self.deconv5, &x, skips[3])?;
        let x = Self::merge(&self.deconv4, &x, skips[2])?;
        let x = Self::merge(&self.deconv3, &x, skips[1])?;
        let x = Self::merge(&self.deconv2, &x, skips[0])?;
        self.deconv1.forward(&x)
    }
}
