//! Loss and a single-step trainer
//!
//! Both heads are supervised: the loss is the sum of per-head pixel-wise
//! cross-entropy and soft Dice.

use std::path::Path;

use candle_core::{bail, DType, Device, Result, Tensor, D};
use candle_nn::{encoding::one_hot, loss, AdamW, Optimizer, ParamsAdamW, VarBuilder, VarMap};

use crate::config::FhpsConfig;
use crate::model::CompleteModel;

const DICE_SMOOTH: f64 = 1.0;

/// Pixel-wise cross-entropy of `[B, K, H, W]` logits against `[B, H, W]`
/// u32 class targets.
pub fn pixel_cross_entropy(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (b, k, h, w) = logits.dims4()?;
    if targets.dims() != [b, h, w].as_slice() {
        bail!("targets {:?} do not match logits {:?}", targets.dims(), logits.dims())
    }
    let flat = logits.permute((0, 2, 3, 1))?.reshape((b * h * w, k))?;
    let targets = targets.flatten_all()?;
    loss::cross_entropy(&flat, &targets)
}

/// Soft Dice loss averaged over the batch, smoothed by [`DICE_SMOOTH`]
pub fn dice_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (_, k, _, _) = logits.dims4()?;
    let probs = candle_nn::ops::softmax(logits, 1)?;
    let truth = one_hot(targets.clone(), k, 1f32, 0f32)?
        .permute((0, 3, 1, 2))?
        .to_dtype(probs.dtype())?;

    let intersection = (&probs * &truth)?.flatten_from(1)?.sum(D::Minus1)?;
    let total = (probs.flatten_from(1)?.sum(D::Minus1)? + truth.flatten_from(1)?.sum(D::Minus1)?)?;
    let dice = ((intersection * 2.0)? + DICE_SMOOTH)?.div(&(total + DICE_SMOOTH)?)?;
    dice.affine(-1.0, 1.0)?.mean_all()
}

pub fn segmentation_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    pixel_cross_entropy(logits, targets)? + dice_loss(logits, targets)?
}

/// Owns a freshly initialized model together with its variables and optimizer
pub struct Trainer {
    pub model: CompleteModel,
    pub varmap: VarMap,
    optimizer: AdamW,
}

impl Trainer {
    pub fn new(config: FhpsConfig, learning_rate: f64, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = CompleteModel::new(config, vb)?;
        let params = ParamsAdamW {
            lr: learning_rate,
            ..Default::default()
        };
        let optimizer = AdamW::new(varmap.all_vars(), params)?;
        Ok(Self {
            model,
            varmap,
            optimizer,
        })
    }

    /// One optimization step on a batch, returns the loss before the update
    pub fn step(&mut self, images: &Tensor, targets: &Tensor) -> Result<f32> {
        let out = self.model.forward_all_t(images, true)?;
        let mask_loss = segmentation_loss(&out.mask, targets)?;
        let refined_loss = segmentation_loss(&out.refined, targets)?;
        let loss = (mask_loss + refined_loss)?;
        self.optimizer.backward_step(&loss)?;
        let loss = loss.to_scalar::<f32>()?;
        tracing::debug!(loss, "train step");
        Ok(loss)
    }

    /// Write every variable to a safetensors checkpoint loadable with
    /// [`CompleteModel::load`]
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        tracing::info!(path = %path.as_ref().display(), "saving checkpoint");
        self.varmap.save(path)
    }
}
