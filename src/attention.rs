//! Dual attention: channel attention followed by positional attention
//!
//! Neither block has learned parameters. Both build an affinity map from the
//! feature map itself, normalize it with a softmax over the last axis and add
//! the attended features back onto the input.

use candle_core::{Module, Result, Tensor};
use candle_nn::ops::softmax_last_dim;

/// Channel attention over a `[B, C, H, W]` map.
///
/// The key is a plain reshape of the input to `[B, N, C]` (N = H * W), not a
/// transpose, so the affinity map is `[B, C, C]`.
#[derive(Debug, Clone)]
pub struct ChannelAttention {
    span: tracing::Span,
}

impl ChannelAttention {
    pub fn new() -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "channel-attn");
        Self { span }
    }
}

impl Default for ChannelAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for ChannelAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, c, h, w) = x.dims4()?;
        let n = h * w;
        let query = x.reshape((b, c, n))?;
        let key = x.reshape((b, n, c))?;
        let attn = softmax_last_dim(&query.matmul(&key)?)?;
        let out = attn.matmul(&query)?.reshape((b, c, h, w))?;
        out + x
    }
}

/// Positional (spatial) attention over a `[B, C, H, W]` map with a
/// `[B, N, N]` affinity map.
#[derive(Debug, Clone)]
pub struct PositionalAttention {
    span: tracing::Span,
}

impl PositionalAttention {
    pub fn new() -> Self {
        let span = tracing::span!(tracing::Level::TRACE, "pos-attn");
        Self { span }
    }
}

impl Default for PositionalAttention {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for PositionalAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b, c, h, w) = x.dims4()?;
        let key = x.reshape((b, c, h * w))?;
        let query = key.transpose(1, 2)?.contiguous()?;
        let attn = softmax_last_dim(&query.matmul(&key)?)?;
        let attn_t = attn.transpose(1, 2)?.contiguous()?;
        let out = key.matmul(&attn_t)?.reshape((b, c, h, w))?;
        out + x
    }
}

#[derive(Debug, Clone, Default)]
pub struct DualAttention {
    pub channel_attention: ChannelAttention,
    pub positional_attention: PositionalAttention,
}

impl DualAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Module for DualAttention {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.channel_attention.forward(x)?;
        self.positional_attention.forward(&x)
    }
}
