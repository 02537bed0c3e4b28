//! FrameBatch driver - Main Entry Point
//!
//! Loads a model on the reference runtime, probes it, and pushes a synthetic
//! stream of frames through the asynchronous batching path, reporting
//! throughput and the collected metrics at the end.

use anyhow::{Context, Result};
use framebatch_common::config::WorkloadConfig;
use framebatch_common::{DriverConfig, FrameBatchError, FunctionKind, METRICS};
use framebatch_engine::{
    ArgmaxClassifier, DetectionBBox, ExecParams, Frame, Model, ModelFunction, PixelFormat, PollResult,
    ReferenceRuntime, SsdDetector,
};
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Default)]
struct RunStats {
    submitted: usize,
    ready: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path =
        std::env::var("FRAMEBATCH_CONFIG").unwrap_or_else(|_| "configs/driver.yaml".to_string());
    let config = DriverConfig::load(&config_path)
        .with_context(|| format!("failed to load driver config {}", config_path))?;

    // Initialize logging
    let level = &config.observability.log_level;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("framebatch={level},framebatch_engine={level},framebatch_common={level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting FrameBatch driver with {}", config_path);

    let runtime = ReferenceRuntime::new(config.options.resolved_nireq())?;
    let function = match config.function {
        FunctionKind::ProcessFrame => ModelFunction::process_frame(),
        FunctionKind::Detect => ModelFunction::detect(
            SsdDetector::new(0.5).with_labels(vec!["background".to_string(), "bright".to_string()]),
        ),
        FunctionKind::Classify => ModelFunction::classify(ArgmaxClassifier::new(Vec::new())),
    };

    let mut model = Model::load(&runtime, &config.model_path, function, config.options.clone())
        .with_context(|| format!("failed to load model {}", config.model_path.display()))?;

    let input = model.input_info(&config.input_name)?;
    info!(
        "Input \"{}\": {} channels, {:?}x{:?} {:?}",
        config.input_name, input.channels, input.width, input.height, input.dtype
    );

    if config.function == FunctionKind::ProcessFrame {
        let (width, height) = model.output_dims(
            &config.input_name,
            config.workload.width,
            config.workload.height,
            &config.output_name,
        )?;
        info!(
            "Output for {}x{} frames is {}x{}",
            config.workload.width, config.workload.height, width, height
        );
    }

    let start = Instant::now();
    let mut stats = RunStats::default();

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = run_workload(&mut model, &config, &mut stats) => {
            result?;
        }
    }

    let elapsed = start.elapsed();
    let summary = model.unload();
    info!(
        "Processed {} of {} frames ({} failed) in {:?}, {:.1} frames/s",
        stats.ready,
        stats.submitted,
        stats.failed,
        elapsed,
        stats.ready as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    debug!("Unload summary: {:?}", summary);

    if config.observability.enable_metrics {
        println!("{}", METRICS.gather());
    }

    info!("FrameBatch driver shutdown complete");
    Ok(())
}

/// Submit every frame of the workload and collect the results in order
async fn run_workload(
    model: &mut Model<ReferenceRuntime>,
    config: &DriverConfig,
    stats: &mut RunStats,
) -> Result<()> {
    let workload = &config.workload;
    let poll_interval = Duration::from_millis(workload.poll_interval_ms);

    while stats.ready + stats.failed < workload.frames {
        if stats.submitted < workload.frames {
            let frame = synthetic_frame(workload, stats.submitted, config.function);
            let mut params = ExecParams::new(&config.input_name, &config.output_name, frame);
            if config.function == FunctionKind::ProcessFrame {
                params = params.with_output(Frame::new(workload.width, workload.height, PixelFormat::Bgr24));
            }

            match model.execute_async(params) {
                Ok(()) => stats.submitted += 1,
                Err(e) if e.is_retryable() => {
                    // Nothing was queued; the same frame goes again on the next pass
                    debug!("All slots busy: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        } else if let Err(e) = model.flush() {
            if !matches!(e, FrameBatchError::ResourceExhausted(_)) {
                return Err(e.into());
            }
        }

        match model.poll_result() {
            PollResult::Ready { output, .. } => {
                stats.ready += 1;
                debug!(
                    "Frame {} ready: {}x{}, {} detections",
                    stats.ready + stats.failed,
                    output.width,
                    output.height,
                    output.detections.len()
                );
            }
            PollResult::Failed { .. } => {
                stats.failed += 1;
                warn!("Frame {} failed", stats.ready + stats.failed);
            }
            PollResult::NotReady | PollResult::Empty => {
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    Ok(())
}

/// A gradient frame; classification frames carry two detected regions
fn synthetic_frame(workload: &WorkloadConfig, index: usize, function: FunctionKind) -> Frame {
    let (width, height) = (workload.width, workload.height);
    let mut frame = Frame::new(width, height, PixelFormat::Bgr24);
    for y in 0..height {
        for x in 0..width {
            for c in 0..3 {
                frame.set_pixel(x, y, c, ((x + y * 2 + c * 40 + index) % 256) as u8);
            }
        }
    }

    if function == FunctionKind::Classify {
        let (w, h) = ((width / 2) as i32, (height / 2) as i32);
        frame = frame.with_detections(vec![
            DetectionBBox::new(0, 0, w, h, "object", 0.9),
            DetectionBBox::new(w, h, w, h, "object", 0.8),
        ]);
    }
    frame
}
