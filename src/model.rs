//! CompleteModel - dual attention encoder/decoder for FH-PS segmentation
//!
//! encoder -> dual attention -> MSFSM -> mask decoder
//!                                    \-> DGB + skip decoder (refinement)
//!
//! Variable names follow the PyTorch state dict of the reference network, so
//! checkpoints exported with `model.state_dict()` load without remapping.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{VarBuilder, VarMap};

use crate::attention::DualAttention;
use crate::config::FhpsConfig;
use crate::decoder::{Decoder, MaskDecoder};
use crate::encoder::Encoder;
use crate::guidance::DirectionalGuidanceBlock;
use crate::msfsm::Msfsm;

/// Both heads of the network
#[derive(Debug, Clone)]
pub struct SegmentationOutput {
    /// Mask decoder logits `[B, classes, H, W]`
    pub mask: Tensor,
    /// Skip decoder logits `[B, classes, H, W]`
    pub refined: Tensor,
}

pub struct CompleteModel {
    pub config: FhpsConfig,
    pub encoder: Encoder,
    pub dual_attention: DualAttention,
    pub msfsm: Msfsm,
    // Declared by the reference network but never used in its forward pass;
    // loaded so full checkpoints resolve.
    #[allow(dead_code)]
    dgb: DirectionalGuidanceBlock,
    pub mask_decoder: MaskDecoder,
    pub decoder: Decoder,
    span: tracing::Span,
}

impl CompleteModel {
    pub fn new(config: FhpsConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let bottleneck = config.bottleneck_channels();

        let encoder = Encoder::new(
            config.in_channels,
            &config.encoder_channels,
            config.bn_eps,
            vb.pp("encoder"),
        )?;
        let dual_attention = DualAttention::new();
        let msfsm = Msfsm::new(bottleneck, vb.pp("msfsm"))?;
        let dgb =
            DirectionalGuidanceBlock::new(bottleneck, config.guided_modulation, vb.pp("dgb"))?;
        let mask_decoder = MaskDecoder::new(&config, vb.pp("mask_decoder"))?;
        let decoder = Decoder::new(&config, vb.pp("decoder"))?;
        let span = tracing::span!(tracing::Level::TRACE, "fhps");

        Ok(Self {
            config,
            encoder,
            dual_attention,
            msfsm,
            dgb,
            mask_decoder,
            decoder,
            span,
        })
    }

    /// Load a safetensors checkpoint
    pub fn load<P: AsRef<Path>>(path: P, config: FhpsConfig, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "loading weights");
        let tensors = candle_core::safetensors::load(path, device)?;
        let tensors: HashMap<String, Tensor> = tensors.into_iter().collect();
        tracing::debug!(count = tensors.len(), "tensors in checkpoint");
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb)
    }

    /// Reject inputs the encoder cannot reduce to at least a 2x2 bottleneck
    /// or whose sides do not survive five halvings exactly.
    pub fn check_input(&self, x: &Tensor) -> Result<()> {
        let (_, c, h, w) = x.dims4()?;
        if c != self.config.in_channels {
            bail!("expected {} input channels, got {c}", self.config.in_channels)
        }
        let factor = self.config.downsample_factor();
        let min = self.config.min_input_size();
        if h < min || w < min || h % factor != 0 || w % factor != 0 {
            bail!("input size {h}x{w} must be a multiple of {factor} and at least {min}x{min}")
        }
        Ok(())
    }

    /// Run both heads, `train` toggles batch-norm statistics
    pub fn forward_all_t(&self, x: &Tensor, train: bool) -> Result<SegmentationOutput> {
        let _enter = self.span.enter();
        self.check_input(x)?;

        let features = self.encoder.forward_t(x, train)?;
        let bottleneck = self.dual_attention.forward(&features.x5)?;
        let bottleneck = self.msfsm.forward(&bottleneck)?;

        let mask = self.mask_decoder.forward(&bottleneck)?;
        let refined = self.decoder.forward(&bottleneck, &features.skips(), &mask)?;
        Ok(SegmentationOutput { mask, refined })
    }

    pub fn forward_all(&self, x: &Tensor) -> Result<SegmentationOutput> {
        self.forward_all_t(x, false)
    }

    /// Mask logits; the refinement head is still evaluated
    pub fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        Ok(self.forward_all_t(x, train)?.mask)
    }

    /// Per-pixel class map `[B, H, W]` (u32)
    pub fn predict(&self, x: &Tensor) -> Result<Tensor> {
        let logits = self.forward(x)?;
        logits.argmax(1)
    }
}

impl Module for CompleteModel {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }
}

/// Number of learnable scalars in `varmap` (batch-norm running stats excluded)
pub fn num_parameters(varmap: &VarMap) -> Result<usize> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("varmap lock poisoned: {e}")))?;
    Ok(data
        .iter()
        .filter(|(name, _)| !name.ends_with("running_mean") && !name.ends_with("running_var"))
        .map(|(_, var)| var.elem_count())
        .sum())
}
