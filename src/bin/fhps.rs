//! FH-PS segmentation command line tool

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Result};
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::{Args, Parser, Subcommand};

use candle_fhps::model::num_parameters;
use candle_fhps::preprocess::{class_map_to_image, image_to_tensor, DEFAULT_PALETTE};
use candle_fhps::{CompleteModel, FhpsConfig};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// JSON model config, defaults to the reference widths.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct SegmentArgs {
    /// Image to segment
    image: PathBuf,

    /// safetensors checkpoint
    #[arg(long)]
    weights: PathBuf,

    /// Where to write the colorized mask
    #[arg(long, default_value = "fhps_mask.png")]
    output: PathBuf,

    /// Square inference resolution, a multiple of 32
    #[arg(long, default_value_t = 256)]
    size: usize,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[arg(long, default_value_t = 256)]
    size: usize,

    #[arg(long, default_value_t = 1)]
    batch: usize,

    #[arg(long, default_value_t = 5)]
    iters: usize,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Segment an image with a trained checkpoint
    Segment(SegmentArgs),
    /// Print parameter count and feature shapes
    Summary {
        #[arg(long, default_value_t = 128)]
        size: usize,
    },
    /// Time forward passes with random weights
    Bench(BenchArgs),
}

fn device(cpu: bool) -> Result<Device> {
    if cpu {
        return Ok(Device::Cpu);
    }
    if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        tracing::info!("no GPU backend compiled in, running on CPU");
        Ok(Device::Cpu)
    }
}

/// Force the device queue to drain by reading a value back
fn sync(t: &Tensor) -> Result<()> {
    let _ = t.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    Ok(())
}

fn random_model(config: FhpsConfig, device: &Device) -> Result<(CompleteModel, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = CompleteModel::new(config, vb)?;
    Ok((model, varmap))
}

fn segment(args: SegmentArgs, config: FhpsConfig, device: &Device) -> Result<()> {
    if args.size % config.downsample_factor() != 0 || args.size < config.min_input_size() {
        bail!(
            "--size must be a multiple of {} and at least {}",
            config.downsample_factor(),
            config.min_input_size()
        )
    }
    let model = CompleteModel::load(&args.weights, config, device)?;

    let img = image::open(&args.image)?;
    let (orig_w, orig_h) = (img.width(), img.height());
    tracing::info!(image = %args.image.display(), orig_w, orig_h, "loaded image");

    let input = image_to_tensor(&img, args.size, device)?;
    let start = Instant::now();
    let classes = model.predict(&input)?;
    sync(&classes.to_dtype(DType::F32)?)?;
    tracing::info!(elapsed = ?start.elapsed(), "inference done");

    let mask = class_map_to_image(&classes.squeeze(0)?, &DEFAULT_PALETTE)?;
    // nearest keeps class colors crisp
    let mask = image::imageops::resize(&mask, orig_w, orig_h, image::imageops::FilterType::Nearest);
    mask.save(&args.output)?;
    println!("saved mask to {}", args.output.display());
    Ok(())
}

fn summary(size: usize, config: FhpsConfig, device: &Device) -> Result<()> {
    let (model, varmap) = random_model(config, device)?;
    println!("parameters: {}", num_parameters(&varmap)?);

    let x = Tensor::randn(0f32, 1., (1, model.config.in_channels, size, size), device)?;
    model.check_input(&x)?;
    let features = model.encoder.forward(&x)?;
    for (i, f) in [&features.x1, &features.x2, &features.x3, &features.x4, &features.x5]
        .iter()
        .enumerate()
    {
        println!("encoder stage {}: {:?}", i + 1, f.dims());
    }
    let out = model.forward_all(&x)?;
    println!("mask:    {:?}", out.mask.dims());
    println!("refined: {:?}", out.refined.dims());
    Ok(())
}

fn bench(args: BenchArgs, config: FhpsConfig, device: &Device) -> Result<()> {
    let (model, _varmap) = random_model(config, device)?;
    let x = Tensor::randn(
        0f32,
        1.,
        (args.batch, model.config.in_channels, args.size, args.size),
        device,
    )?;

    println!("warmup...");
    sync(&model.forward(&x)?)?;

    let start = Instant::now();
    for _ in 0..args.iters {
        sync(&model.forward(&x)?)?;
    }
    let elapsed = start.elapsed();
    println!(
        "{} iters at {}x{} (batch {}): avg {:?}",
        args.iters,
        args.size,
        args.size,
        args.batch,
        elapsed / args.iters.max(1) as u32
    );
    Ok(())
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let cli = Cli::parse();
    let _guard = if cli.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
        None
    };

    let config = match &cli.config {
        Some(path) => FhpsConfig::from_json_file(path)?,
        None => FhpsConfig::default(),
    };
    let device = device(cli.cpu)?;

    match cli.command {
        Commands::Segment(args) => segment(args, config, &device),
        Commands::Summary { size } => summary(size, config, &device),
        Commands::Bench(args) => bench(args, config, &device),
    }
}
