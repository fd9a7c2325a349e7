// src/bin/wavefront_bench.rs
// Renders the reference kernels on CPU and/or wavefront devices and reports timing and the mean radiance

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;

use forge3d_integrator::path_tracing::film::{FilmPasses, KernelFilm};
use forge3d_integrator::path_tracing::kernel::{reference, KernelData, KernelRegistry};
use forge3d_integrator::path_tracing::{BufferParams, PathTrace, RenderBuffers, RenderWork};
use forge3d_integrator::{CompactionBackend, Device, DeviceInfo, DeviceType, IntegratorConfig};

#[derive(Parser, Debug)]
#[command(
    name = "wavefront_bench",
    about = "Render the reference integrator kernels and report throughput per device."
)]
struct Args {
    /// Image width in pixels
    #[arg(long, default_value_t = 256)]
    width: usize,

    /// Image height in pixels
    #[arg(long, default_value_t = 256)]
    height: usize,

    /// Samples per pixel
    #[arg(long, default_value_t = 16)]
    samples: usize,

    /// Samples rendered per `render()` step
    #[arg(long, default_value_t = 4)]
    samples_per_step: usize,

    /// Comma-separated device types (cpu, wavefront)
    #[arg(long, value_delimiter = ',', default_value = "wavefront")]
    devices: Vec<String>,

    /// JSON integrator config; flags below override it
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Path-state pool capacity per wavefront device
    #[arg(long)]
    max_num_paths: Option<usize>,

    #[arg(long)]
    megakernel_tail_threshold: Option<usize>,

    /// Compaction backend (host, wgpu)
    #[arg(long)]
    compaction: Option<String>,

    /// Write the summary as JSON to this path
    #[arg(long, value_name = "PATH")]
    json_out: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct BenchSummary {
    width: usize,
    height: usize,
    samples: usize,
    devices: Vec<String>,
    seconds: f64,
    samples_per_second: f64,
    mean_radiance: f32,
    expected_radiance: f32,
}

fn load_config(args: &Args) -> anyhow::Result<IntegratorConfig> {
    let mut config = match &args.config {
        Some(path) => IntegratorConfig::from_path(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => IntegratorConfig::default(),
    };
    if let Some(max_num_paths) = args.max_num_paths {
        config.max_num_paths = max_num_paths;
    }
    if let Some(threshold) = args.megakernel_tail_threshold {
        config.megakernel_tail_threshold = threshold;
    }
    if let Some(compaction) = &args.compaction {
        config.compaction = match CompactionBackend::from_str(compaction) {
            Some(backend) => backend,
            None => bail!("unknown compaction backend {compaction:?}"),
        };
    }
    config.validate()?;
    Ok(config)
}

fn mean_radiance(film: &KernelFilm, buffers: &RenderBuffers) -> f32 {
    let (Some(combined), Some(sample_count)) = (film.pass_combined, film.pass_sample_count) else {
        return 0.0;
    };
    let num_pixels = buffers.params().num_pixels();
    if num_pixels == 0 {
        return 0.0;
    }
    let sum: f32 = (0..num_pixels)
        .map(|pixel| {
            let base = pixel * film.pass_stride;
            let n = buffers.read_u32(base + sample_count).max(1) as f32;
            buffers.read(base + combined) / n
        })
        .sum();
    sum / num_pixels as f32
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(&args)?;

    let devices = args
        .devices
        .iter()
        .enumerate()
        .map(|(i, name)| match DeviceType::from_str(name) {
            Some(DeviceType::Cpu) => Ok(Device::new(DeviceInfo::cpu(format!("cpu{i}"), &config))),
            Some(DeviceType::Wavefront) => Ok(Device::new(DeviceInfo::wavefront(format!("wf{i}"), &config))),
            None => bail!("unknown device type {name:?}"),
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let film = KernelFilm::new(FilmPasses::default());
    let data = Arc::new(KernelData::new(film, &config));
    let (_, kernels) = KernelRegistry::new(reference::kernel_functions()).select(config.kernel_arch);

    let mut path_trace = PathTrace::new(devices, kernels, data, &config)?;
    let big_tile = BufferParams::new(args.width, args.height, film.pass_stride);
    path_trace.reset(big_tile);

    let step = args.samples_per_step.max(1);
    let start = Instant::now();
    let mut sample = 0;
    while sample < args.samples {
        let num_samples = step.min(args.samples - sample);
        path_trace.render(&RenderWork::samples(sample, num_samples))?;
        sample += num_samples;
    }
    let seconds = start.elapsed().as_secs_f64();

    let buffers = RenderBuffers::new(big_tile);
    path_trace.copy_to_render_buffers(&buffers);

    let summary = BenchSummary {
        width: args.width,
        height: args.height,
        samples: args.samples,
        devices: args.devices.clone(),
        seconds,
        samples_per_second: (args.width * args.height * args.samples) as f64 / seconds.max(1e-9),
        mean_radiance: mean_radiance(&film, &buffers),
        expected_radiance: reference::expected_radiance(config.max_bounce),
    };

    println!("{}", path_trace.full_report());
    println!(
        "{:.2} Msamples/s, mean radiance {:.4} (expected {:.4})",
        summary.samples_per_second / 1e6,
        summary.mean_radiance,
        summary.expected_radiance
    );

    if let Some(path) = &args.json_out {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
