//! Directional guidance: direction planes derived from a mask, and the
//! guidance block that upsamples the bottleneck ahead of the decoder.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{conv2d, Conv2d, Conv2dConfig, VarBuilder};

use crate::config::DirectionMode;
use crate::interpolate::upsample_bilinear;

/// Central difference along `dim`, replicating the border values
fn central_difference(x: &Tensor, dim: usize) -> Result<Tensor> {
    let size = x.dim(dim)?;
    let padded = x.pad_with_same(dim, 1, 1)?;
    let forward = padded.narrow(dim, 2, size)?;
    let backward = padded.narrow(dim, 0, size)?;
    (forward - backward)? * 0.5
}

/// Direction planes `[B, 2, H, W]` for a `[B, C, H, W]` segmentation map.
///
/// Channel 0 is the horizontal direction, channel 1 the vertical one.
pub fn calculate_direction_info(mask: &Tensor, mode: DirectionMode) -> Result<Tensor> {
    let (b, _c, h, w) = mask.dims4()?;
    match mode {
        DirectionMode::Zeros => Tensor::zeros((b, 2, h, w), mask.dtype(), mask.device()),
        DirectionMode::Gradient => {
            let mean = mask.mean_keepdim(1)?;
            let horizontal = central_difference(&mean, 3)?;
            let vertical = central_difference(&mean, 2)?;
            Tensor::cat(&[&horizontal, &vertical], 1)
        }
    }
}

/// DGB: 2x bilinear upsample followed by a 3x3 conv.
pub struct DirectionalGuidanceBlock {
    pub conv: Conv2d,
    modulate: bool,
    span: tracing::Span,
}

impl DirectionalGuidanceBlock {
    pub fn new(in_channels: usize, modulate: bool, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv = conv2d(in_channels, in_channels, 3, cfg, vb.pp("conv"))?;
        let span = tracing::span!(tracing::Level::TRACE, "dgb");
        Ok(Self {
            conv,
            modulate,
            span,
        })
    }

    pub fn forward(&self, x: &Tensor, direction_info: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (_, _, h, w) = x.dims4()?;
        let x = upsample_bilinear(x, h * 2, w * 2)?;
        let out = self.conv.forward(&x)?;

        if direction_info.dim(1)? != 2 {
            bail!(
                "direction info needs 2 planes, got shape {:?}",
                direction_info.dims()
            )
        }
        let horizontal = direction_info.narrow(1, 0, 1)?;
        let vertical = direction_info.narrow(1, 1, 1)?;

        if !self.modulate {
            return Ok(out);
        }

        // gate in [1.5, 2): flat regions keep a uniform gain, edges get boosted
        let (_, _, oh, ow) = out.dims4()?;
        let magnitude = (horizontal.abs()? + vertical.abs()?)?;
        let magnitude = upsample_bilinear(&magnitude, oh, ow)?;
        let gate = (candle_nn::ops::sigmoid(&magnitude)? + 1.0)?;
        out.broadcast_mul(&gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn zeros_mode_is_all_zero() -> Result<()> {
        let mask = Tensor::randn(0f32, 1., (2, 3, 8, 8), &Device::Cpu)?;
        let dir = calculate_direction_info(&mask, DirectionMode::Zeros)?;
        assert_eq!(dir.dims(), &[2, 2, 8, 8]);
        assert_eq!(dir.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn gradient_of_horizontal_ramp() -> Result<()> {
        // every row is 0, 1, 2, 3: constant horizontal slope, no vertical one
        let row = Tensor::arange(0f32, 4., &Device::Cpu)?;
        let mask = row.reshape((1, 1, 1, 4))?.broadcast_as((1, 1, 3, 4))?.contiguous()?;
        let dir = calculate_direction_info(&mask, DirectionMode::Gradient)?;
        let horizontal = dir.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(&horizontal[..4], &[0.5, 1.0, 1.0, 0.5]);
        let vertical = dir.narrow(1, 1, 1)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(vertical, 0.0);
        Ok(())
    }

    fn block_pair() -> Result<(DirectionalGuidanceBlock, DirectionalGuidanceBlock)> {
        // both blocks resolve to the same conv variables
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let plain = DirectionalGuidanceBlock::new(4, false, vb.pp("dgb"))?;
        let gated = DirectionalGuidanceBlock::new(4, true, vb.pp("dgb"))?;
        Ok((plain, gated))
    }

    #[test]
    fn unmodulated_block_ignores_direction_planes() -> Result<()> {
        let (plain, _) = block_pair()?;
        let x = Tensor::randn(0f32, 1., (1, 4, 3, 3), &Device::Cpu)?;
        let zeros = Tensor::zeros((1, 2, 12, 12), DType::F32, &Device::Cpu)?;
        let noise = Tensor::randn(0f32, 1., (1, 2, 12, 12), &Device::Cpu)?;

        let a = plain.forward(&x, &zeros)?;
        let b = plain.forward(&x, &noise)?;
        assert_eq!(a.dims(), &[1, 4, 6, 6]);
        let diff = (a - b)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        Ok(())
    }

    #[test]
    fn flat_direction_gates_by_one_and_a_half() -> Result<()> {
        let (plain, gated) = block_pair()?;
        let x = Tensor::randn(0f32, 1., (1, 4, 3, 3), &Device::Cpu)?;
        let zeros = Tensor::zeros((1, 2, 12, 12), DType::F32, &Device::Cpu)?;

        let base = plain.forward(&x, &zeros)?;
        let out = gated.forward(&x, &zeros)?;
        let diff = (out - (base * 1.5)?)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6, "diff {diff}");
        Ok(())
    }

    #[test]
    fn edges_raise_the_gate() -> Result<()> {
        let (plain, gated) = block_pair()?;
        let x = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
        let strong = Tensor::full(10f32, (1, 2, 4, 4), &Device::Cpu)?;

        let base = plain.forward(&x, &strong)?;
        let out = gated.forward(&x, &strong)?;
        // sigmoid(20) + 1 is 2 to within f32 precision
        let diff = (out - (base * 2.0)?)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "diff {diff}");
        Ok(())
    }

    #[test]
    fn rejects_wrong_plane_count() -> Result<()> {
        let (plain, _) = block_pair()?;
        let x = Tensor::randn(0f32, 1., (1, 4, 2, 2), &Device::Cpu)?;
        let planes = Tensor::zeros((1, 3, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(plain.forward(&x, &planes).is_err());
        Ok(())
    }
}
