use anyhow::Result;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};

use candle_fhps::encoder::Encoder;
use candle_fhps::model::num_parameters;
use candle_fhps::{CompleteModel, DirectionMode, FhpsConfig};

fn tiny_model(config: FhpsConfig) -> Result<(CompleteModel, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let model = CompleteModel::new(config, vb)?;
    Ok((model, varmap))
}

#[test]
fn encoder_halves_every_stage() -> Result<()> {
    let (model, _varmap) = tiny_model(FhpsConfig::tiny())?;
    let x = Tensor::randn(0f32, 1., (1, 3, 128, 128), &Device::Cpu)?;
    let f = model.encoder.forward(&x)?;
    assert_eq!(f.x1.dims(), &[1, 8, 64, 64]);
    assert_eq!(f.x2.dims(), &[1, 16, 32, 32]);
    assert_eq!(f.x3.dims(), &[1, 32, 16, 16]);
    assert_eq!(f.x4.dims(), &[1, 64, 8, 8]);
    assert_eq!(f.x5.dims(), &[1, 128, 4, 4]);
    Ok(())
}

#[test]
fn encoder_needs_one_width_per_stage() -> Result<()> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    assert!(Encoder::new(3, &[8, 16, 32], 1e-5, vb.pp("short")).is_err());
    assert!(Encoder::new(3, &[8, 16, 32, 64, 128, 256], 1e-5, vb.pp("long")).is_err());
    assert!(Encoder::new(3, &[8, 16, 32, 64, 128], 1e-5, vb.pp("ok")).is_ok());
    Ok(())
}

#[test]
fn forward_returns_full_resolution_mask() -> Result<()> {
    let (model, _varmap) = tiny_model(FhpsConfig::tiny())?;
    let x = Tensor::randn(0f32, 1., (2, 3, 64, 96), &Device::Cpu)?;
    let mask = model.forward(&x)?;
    assert_eq!(mask.dims(), &[2, 3, 64, 96]);

    let out = model.forward_all(&x)?;
    assert_eq!(out.refined.dims(), &[2, 3, 64, 96]);
    let diff = (out.mask - mask)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}

#[test]
fn predict_gives_class_indices() -> Result<()> {
    let (model, _varmap) = tiny_model(FhpsConfig::tiny())?;
    let x = Tensor::randn(0f32, 1., (1, 3, 64, 64), &Device::Cpu)?;
    let classes = model.predict(&x)?;
    assert_eq!(classes.dims(), &[1, 64, 64]);
    assert_eq!(classes.dtype(), DType::U32);
    let max = classes.flatten_all()?.max(0)?.to_scalar::<u32>()?;
    assert!(max < 3);
    Ok(())
}

#[test]
fn rejects_unsupported_inputs() -> Result<()> {
    let (model, _varmap) = tiny_model(FhpsConfig::tiny())?;
    // too small for a 2x2 bottleneck
    let small = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&small).is_err());
    // not a multiple of 32
    let odd = Tensor::zeros((1, 3, 80, 64), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&odd).is_err());
    // wrong channel count
    let gray = Tensor::zeros((1, 1, 64, 64), DType::F32, &Device::Cpu)?;
    assert!(model.forward(&gray).is_err());
    Ok(())
}

#[test]
fn modulated_gradient_guidance_runs() -> Result<()> {
    let config = FhpsConfig {
        direction: DirectionMode::Gradient,
        guided_modulation: true,
        num_classes: 2,
        ..FhpsConfig::tiny()
    };
    let (model, _varmap) = tiny_model(config)?;
    let x = Tensor::randn(0f32, 1., (1, 3, 64, 64), &Device::Cpu)?;
    let out = model.forward_all(&x)?;
    assert_eq!(out.mask.dims(), &[1, 2, 64, 64]);
    assert_eq!(out.refined.dims(), &[1, 2, 64, 64]);
    Ok(())
}

#[test]
fn variable_names_follow_state_dict() -> Result<()> {
    let (_model, varmap) = tiny_model(FhpsConfig::tiny())?;
    let data = varmap.data().lock().unwrap();
    for name in [
        "encoder.conv1.0.weight",
        "encoder.conv1.1.running_mean",
        "encoder.conv5.1.bias",
        "msfsm.branch1.weight",
        "msfsm.branch4.bias",
        "msfsm.conv_fusion.weight",
        "dgb.conv.weight",
        "mask_decoder.deconv5.weight",
        "decoder.deconv1.bias",
        "decoder.dgb.conv.weight",
    ] {
        assert!(data.contains_key(name), "missing {name}");
    }
    // ConvTranspose2d weights are [in, out, k, k]
    assert_eq!(data["decoder.deconv4.weight"].dims(), &[128, 32, 2, 2]);
    Ok(())
}

#[test]
fn tiny_parameter_count() -> Result<()> {
    let (_model, varmap) = tiny_model(FhpsConfig::tiny())?;
    // conv3x3 + bias + bn affine per encoder stage
    let stage = |i: usize, o: usize| 9 * i * o + 3 * o;
    let encoder = stage(3, 8) + stage(8, 16) + stage(16, 32) + stage(32, 64) + stage(64, 128);
    let conv = |i: usize, o: usize, k: usize| i * o * k * k + o;
    let msfsm = conv(128, 128, 1) + 2 * conv(128, 128, 3) + conv(512, 128, 1);
    let dgb = conv(128, 128, 3);
    let mask_decoder = conv(128, 64, 2)
        + conv(64, 32, 2)
        + conv(32, 16, 2)
        + conv(16, 8, 2)
        + conv(8, 3, 2);
    let decoder = conv(128, 64, 2)
        + conv(128, 32, 2)
        + conv(64, 16, 2)
        + conv(32, 8, 2)
        + conv(16, 3, 2);
    let expected = encoder + msfsm + 2 * dgb + mask_decoder + decoder;
    assert_eq!(expected, 869_718);
    assert_eq!(num_parameters(&varmap)?, expected);
    Ok(())
}
