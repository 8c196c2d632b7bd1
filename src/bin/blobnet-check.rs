//! Build one fully-connected layer, time a forward and backward pass, and
//! check its gradients by finite differences.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, ValueEnum};
use log::info;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use blobnet::gradient_check::GradientChecker;
use blobnet::layers::{InnerProductConfig, InnerProductLayer};
use blobnet::{Accelerator, AcceleratorConfig, Blob, Context, FillerConfig, Layer, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Device {
    Host,
    Accelerator,
}

#[derive(Parser, Debug)]
#[command(about = "Check a fully-connected layer's gradients", long_about = None)]
struct Args {
    /// Examples per batch
    #[arg(long, default_value_t = 10)]
    batch: usize,

    /// Inputs per example
    #[arg(long, default_value_t = 5)]
    inputs: usize,

    /// Outputs per example
    #[arg(long, default_value_t = 5)]
    outputs: usize,

    /// Leave out the bias term
    #[arg(long)]
    no_bias: bool,

    /// Where to run the layer
    #[arg(long, value_enum, default_value_t = Device::Host)]
    device: Device,

    /// Accelerator worker threads (0 = one per core)
    #[arg(long, value_name = "N", default_value_t = 0)]
    threads: usize,

    /// Seed for parameter fillers, inputs and the gradient check
    #[arg(long, default_value_t = 1701)]
    seed: u64,

    /// After checking, clip every weight column to this L2 norm
    #[arg(long, value_name = "NORM")]
    max_norm: Option<f64>,

    /// Use f64 instead of f32
    #[arg(long)]
    double: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_default_env()
        .filter_level(if args.verbose {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .init();

    let result = if args.double {
        run::<f64>(&args)
    } else {
        run::<f32>(&args)
    };
    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run<T: Scalar>(args: &Args) -> Result<()> {
    let mut ctx = match args.device {
        Device::Host => Context::host(),
        Device::Accelerator => {
            let accelerator = Accelerator::new(&AcceleratorConfig {
                num_threads: args.threads,
                ..AcceleratorConfig::default()
            })
            .context("failed to start the accelerator")?;
            info!(
                "running on {} with {} threads",
                accelerator.label(),
                accelerator.num_threads()
            );
            Context::with_accelerator(Arc::new(accelerator))
        }
    }
    .seeded(args.seed);

    let config = InnerProductConfig {
        num_output: args.outputs,
        bias_term: !args.no_bias,
        weight_filler: FillerConfig::Xavier,
        bias_filler: FillerConfig::Constant { value: 0.1 },
    };
    let mut layer = InnerProductLayer::<T>::new("fc", config).context("bad layer settings")?;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let x = Array::random_using((args.batch, args.inputs, 1, 1), Uniform::new(-1.0, 1.0), &mut rng)
        .mapv(T::from_f64);
    let mut bottom = vec![Blob::from_array(x.view())];
    let mut top = vec![];
    layer
        .set_up_top(&mut ctx, &bottom, &mut top)
        .context("set-up failed")?;
    info!("input {} -> output {}", bottom[0].shape(), top[0].shape());

    let start = Instant::now();
    layer.forward(&ctx, &mut bottom, &mut top)?;
    let forward_time = start.elapsed();
    top[0].fill_diff(T::one());
    let start = Instant::now();
    layer.backward(&ctx, &mut top, true, &mut bottom)?;
    let backward_time = start.elapsed();
    info!("forward took {forward_time:?}, backward took {backward_time:?}");

    let checker = GradientChecker {
        seed: args.seed,
        ..GradientChecker::default()
    };
    let report = checker
        .check(&mut ctx, &mut layer, &mut bottom, &mut top, &[0])
        .context("gradient check failed to run")?;
    println!("{report}");
    if !report.is_ok() {
        bail!("{} gradient mismatches", report.mismatches.len());
    }

    if let Some(max_norm) = args.max_norm {
        layer.normalize_weights(&ctx, T::from_f64(max_norm))?;
        let norms = column_norms(&mut layer);
        let largest = norms.iter().copied().fold(0.0, f64::max);
        println!("largest weight column norm after clipping: {largest}");
    }

    if let Ok(accelerator) = ctx.accelerator() {
        info!(
            "{} live device buffers, {} bytes",
            accelerator.live_buffers(),
            accelerator.allocated_bytes()
        );
    }
    Ok(())
}

/// L2 norm of each strided weight column.
fn column_norms<T: Scalar>(layer: &mut InnerProductLayer<T>) -> Vec<f64> {
    let Some(weight) = layer.params_mut().first_mut() else {
        return vec![];
    };
    let width = weight.shape().width;
    let data = weight.host_data();
    (0..width)
        .map(|i| {
            data.iter()
                .skip(i)
                .step_by(width)
                .map(|v| v.into_f64().powi(2))
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}
