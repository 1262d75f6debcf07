//! # Framecast
//!
//! Headless driver: renders a synthetic test pattern in float RGBA and pushes
//! it through the frame sender, the same way a render host would.

use anyhow::Result;
use framecast_core::config::SenderConfig;
use framecast_core::transport::{CountingTransport, RawFileTransport, Transport};
use framecast_core::{FrameOutcome, FrameSender, TransferFunction};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

struct RunOptions {
    config: SenderConfig,
    frames: u64,
    width: i32,
    height: i32,
    output: Option<PathBuf>,
    realtime: bool,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("framecast=info,wgpu=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Framecast v{}", framecast_core::VERSION);

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;
    run(options)
}

fn run(options: RunOptions) -> Result<()> {
    let transport: Box<dyn Transport> = match &options.output {
        Some(path) => Box::new(RawFileTransport::new(path)),
        None => Box::new(CountingTransport::new()),
    };
    let mut sender = FrameSender::new(transport);

    let frame_interval = Duration::from_secs_f64(1.0 / options.config.frame_rate);
    let start = Instant::now();
    let mut pixels = Vec::new();

    for index in 0..options.frames {
        render_pattern(&mut pixels, options.width, options.height, index);

        match sender.on_frame(&pixels, options.width, options.height, &options.config)? {
            FrameOutcome::Dropped => tracing::debug!("Frame {} dropped", index),
            FrameOutcome::SendFailed => tracing::debug!("Frame {} send failed", index),
            _ => {}
        }

        if options.realtime {
            let due = frame_interval * (index as u32 + 1);
            if let Some(wait) = due.checked_sub(start.elapsed()) {
                std::thread::sleep(wait);
            }
        }
    }

    sender.shutdown();
    let status = sender.status();

    let elapsed = start.elapsed();
    tracing::info!(
        "Sent {} of {} frames in {:.2}s ({:.1} fps)",
        status.frames_sent,
        options.frames,
        elapsed.as_secs_f64(),
        options.frames as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );

    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

// ============================================================================
// Test Pattern
// ============================================================================

/// Colour bars over a luma ramp, with a bar that moves one step per frame.
/// Rows are written bottom-up like a render host's framebuffer.
fn render_pattern(pixels: &mut Vec<f32>, width: i32, height: i32, index: u64) {
    const BARS: [[f32; 3]; 7] = [
        [0.75, 0.75, 0.75],
        [0.75, 0.75, 0.0],
        [0.0, 0.75, 0.75],
        [0.0, 0.75, 0.0],
        [0.75, 0.0, 0.75],
        [0.75, 0.0, 0.0],
        [0.0, 0.0, 0.75],
    ];

    let w = width.max(0) as usize;
    let h = height.max(0) as usize;
    pixels.resize(w * h * 4, 0.0);

    let marker = (index as usize * 4) % w.max(1);
    for y in 0..h {
        // y counts from the bottom; top two thirds carry the bars
        let top = h - 1 - y;
        for x in 0..w {
            let rgb = if top < h * 2 / 3 {
                BARS[x * BARS.len() / w]
            } else {
                let v = x as f32 / (w.max(2) - 1) as f32;
                [v, v, v]
            };
            let rgb = if x.abs_diff(marker) < 2 { [1.0, 1.0, 1.0] } else { rgb };

            let o = (y * w + x) * 4;
            pixels[o..o + 4].copy_from_slice(&[rgb[0], rgb[1], rgb[2], 1.0]);
        }
    }
}

// ============================================================================
// Arguments
// ============================================================================

fn parse_args(args: &[String]) -> Result<RunOptions> {
    let mut config = SenderConfig {
        enabled: true,
        ..Default::default()
    };
    let mut frames: u64 = 300;
    let mut width: i32 = 1920;
    let mut height: i32 = 1080;
    let mut output: Option<PathBuf> = None;
    let mut realtime = false;

    fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
        args.get(i + 1)
            .map(String::as_str)
            .ok_or_else(|| anyhow::anyhow!("Missing value for {}", flag))
    }

    // --config first so flags can override it
    if let Some(pos) = args.iter().position(|a| a == "--config" || a == "-c") {
        let path = value(args, pos, "--config")?;
        config = SenderConfig::load(path)
            .map_err(|e| anyhow::anyhow!("Config {}: {}", path, e))?;
        config.enabled = true;
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 2;
            }
            "--frames" | "-n" => {
                let v = value(args, i, "--frames")?;
                frames = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid frame count {}: {}", v, e))?;
                i += 2;
            }
            "--width" => {
                let v = value(args, i, "--width")?;
                width = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid width {}: {}", v, e))?;
                i += 2;
            }
            "--height" => {
                let v = value(args, i, "--height")?;
                height = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid height {}: {}", v, e))?;
                i += 2;
            }
            "--fps" => {
                let v = value(args, i, "--fps")?;
                config.frame_rate = v
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid frame rate {}: {}", v, e))?;
                i += 2;
            }
            "--output" | "-o" => {
                output = Some(PathBuf::from(value(args, i, "--output")?));
                i += 2;
            }
            "--name" => {
                config.source_name = value(args, i, "--name")?.to_string();
                i += 2;
            }
            "--hdr" => {
                config.hdr_enabled = true;
                if config.transfer_function == TransferFunction::Sdr {
                    config.transfer_function = TransferFunction::Pq;
                }
                i += 1;
            }
            "--hlg" => {
                config.hdr_enabled = true;
                config.transfer_function = TransferFunction::Hlg;
                i += 1;
            }
            "--rgba" => {
                config.optimal_format = false;
                i += 1;
            }
            "--async" => {
                config.async_sending = true;
                i += 1;
            }
            "--no-gpu" => {
                config.gpu_acceleration = false;
                i += 1;
            }
            "--realtime" => {
                realtime = true;
                i += 1;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
            }
        }
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    Ok(RunOptions {
        config,
        frames,
        width,
        height,
        output,
        realtime,
    })
}

fn print_usage() {
    eprintln!(
        "\nUsage:\n  framecast [--config <file.json>] [--frames <n>] [--width <w>] [--height <h>]\n            [--fps <rate>] [--output <file.raw>] [--name <source>] [--hdr | --hlg]\n            [--rgba] [--async] [--no-gpu] [--realtime]\n\nWithout --output frames go to a counting sink. RUST_LOG overrides log levels.\n"
    );
}
