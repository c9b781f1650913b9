//! MSFSM (Multi-Scale Feature Selection Module)
//!
//! Four parallel branches over the bottleneck, concatenated on channels and
//! fused back to the input width with a 1x1 conv:
//! - branch1: 1x1 conv
//! - branch2: 2x2 max-pool, resized back to branch1's size
//! - branch3: 3x3 conv, dilation 2
//! - branch4: 3x3 conv, dilation 3

use candle_core::{Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::interpolate::upsample_bilinear;

/// 3x3 atrous conv with "same" padding
fn atrous_conv(channels: usize, dilation: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: dilation,
        dilation,
        ..Default::default()
    };
    conv2d(channels, channels, 3, cfg, vb)
}

/// branch2: 2x2 max-pool (floored on odd sides) resized back to `h`x`w`
fn pooled_branch(x: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let pooled = x.max_pool2d(2)?;
    upsample_bilinear(&pooled, h, w)
}

pub struct Msfsm {
    pub branch1: Conv2d,
    pub branch3: Conv2d,
    pub branch4: Conv2d,
    pub conv_fusion: Conv2d,
    span: tracing::Span,
}

impl Msfsm {
    pub fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let branch1 = conv2d(in_channels, in_channels, 1, Default::default(), vb.pp("branch1"))?;
        // branch2 is a pooling branch and owns no weights
        let branch3 = atrous_conv(in_channels, 2, vb.pp("branch3"))?;
        let branch4 = atrous_conv(in_channels, 3, vb.pp("branch4"))?;
        let conv_fusion = conv2d(
            in_channels * 4,
            in_channels,
            1,
            Default::default(),
            vb.pp("conv_fusion"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "msfsm");
        Ok(Self {
            branch1,
            branch3,
            branch4,
            conv_fusion,
            span,
        })
    }
}

impl Module for Msfsm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let b1 = self.branch1.forward(x)?;
        let (_, _, h, w) = b1.dims4()?;

        let b2 = pooled_branch(x, h, w)?;

        let b3 = self.branch3.forward(x)?;
        let b4 = self.branch4.forward(x)?;

        let fusion = Tensor::cat(&[&b1, &b2, &b3, &b4], 1)?;
        self.conv_fusion.forward(&fusion)
    }
}
