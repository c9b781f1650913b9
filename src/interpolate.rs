//! Bilinear resizing with `align_corners = true` semantics
//!
//! Built from `index_select` and broadcast blends so every candle backend can
//! run it, including the ones without a native bilinear kernel.

use candle_core::{bail, Result, Tensor};

/// Source taps for one axis: (lower index, upper index, fraction of upper)
fn axis_taps(in_size: usize, out_size: usize) -> (Vec<u32>, Vec<u32>, Vec<f32>) {
    let mut lo = Vec::with_capacity(out_size);
    let mut hi = Vec::with_capacity(out_size);
    let mut frac = Vec::with_capacity(out_size);
    let scale = if out_size > 1 {
        (in_size - 1) as f64 / (out_size - 1) as f64
    } else {
        0.0
    };
    for i in 0..out_size {
        let src = i as f64 * scale;
        let i0 = (src.floor() as usize).min(in_size - 1);
        let i1 = (i0 + 1).min(in_size - 1);
        lo.push(i0 as u32);
        hi.push(i1 as u32);
        frac.push((src - i0 as f64) as f32);
    }
    (lo, hi, frac)
}

fn resize_axis(x: &Tensor, dim: usize, out_size: usize) -> Result<Tensor> {
    let in_size = x.dim(dim)?;
    if in_size == out_size {
        return Ok(x.clone());
    }
    if in_size == 0 || out_size == 0 {
        bail!("cannot resize axis {dim} from {in_size} to {out_size}")
    }
    let device = x.device();
    let (lo, hi, frac) = axis_taps(in_size, out_size);
    let lo = Tensor::new(lo.as_slice(), device)?;
    let hi = Tensor::new(hi.as_slice(), device)?;

    let mut weight_shape = vec![1usize; x.rank()];
    weight_shape[dim] = out_size;
    let weight = Tensor::new(frac.as_slice(), device)?
        .reshape(weight_shape)?
        .to_dtype(x.dtype())?;

    let x = x.contiguous()?;
    let a = x.index_select(&lo, dim)?;
    let b = x.index_select(&hi, dim)?;
    a.broadcast_add(&(b - &a)?.broadcast_mul(&weight)?)
}

/// Resize a `[B, C, H, W]` tensor to `[B, C, h, w]`
pub fn upsample_bilinear(x: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    if x.rank() != 4 {
        bail!("upsample_bilinear expects a rank 4 tensor, got {:?}", x.dims())
    }
    let x = resize_axis(x, 2, h)?;
    resize_axis(&x, 3, w)
}
