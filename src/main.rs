//! CLI entry point for vmbx
//!
//! Runs the camera workflows against the simulated platform configured in
//! `config/vmbx.toml`:
//! - list cameras and module features
//! - grab frames synchronously or through a frame callback, optionally
//!   writing them to raw files
//! - print chunk data of every frame
//! - print device events while acquiring
//!
//! # Usage
//!
//! ```bash
//! vmbx list-cameras
//! vmbx list-features --module stream --json
//! vmbx grab --count 20 --sync
//! vmbx grab --count 100 --output frames/
//! VMBX_CAPTURE__BUFFER_COUNT=8 vmbx show-config
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};
use vmbx::logging;
use vmbx::recorder::{FrameRecorder, FrameWriter};
use vmbx::setup;
use vmbx::{AllocationMode, Camera, CaptureOptions, System, VmbxConfig};
use vmbx_core::chunk::ChunkFeatures;
use vmbx_core::feature::{FeatureContainer, FeatureSource};
use vmbx_core::module::ModuleKind;

#[derive(Parser)]
#[command(name = "vmbx")]
#[command(about = "Camera access, frame acquisition and events on the vmbx stack", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = vmbx::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List cameras in enumeration order
    ListCameras,

    /// List the features of one module
    ListFeatures {
        /// Camera id (first camera if omitted)
        #[arg(long)]
        camera: Option<String>,

        /// Module whose features are listed
        #[arg(long, value_enum, default_value = "camera")]
        module: ModuleArg,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Acquire frames
    Grab {
        /// Number of frames
        #[arg(long, default_value = "10")]
        count: u64,

        /// Pull frames with wait_for_frame instead of a callback
        #[arg(long)]
        sync: bool,

        /// Write every completed frame to DIR/frame_NNNNNN.raw
        #[arg(long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Acquire frames and print their chunk data
    Chunks {
        /// Number of frames
        #[arg(long, default_value = "5")]
        count: u64,
    },

    /// Print the configured device events while acquiring
    Events {
        /// Number of frames to acquire
        #[arg(long, default_value = "5")]
        count: u64,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModuleArg {
    Camera,
    LocalDevice,
    Stream,
    Interface,
    TransportLayer,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = VmbxConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config).context("Failed to initialize logging")?;

    let system = System::from_config(config).context("Failed to start the camera system")?;
    let result = match cli.command {
        Commands::ListCameras => list_cameras(&system),
        Commands::ListFeatures {
            camera,
            module,
            json,
        } => list_features(&system, camera.as_deref(), module, json).await,
        Commands::Grab {
            count,
            sync,
            output,
        } => grab(&system, count, sync, output).await,
        Commands::Chunks { count } => chunks(&system, count).await,
        Commands::Events { count } => events(&system, count).await,
        Commands::ShowConfig => system
            .config()
            .to_toml()
            .map(|toml| print!("{}", toml))
            .context("Failed to render configuration"),
    };

    let failures = system.shutdown().await;
    if failures > 0 {
        warn!(failures, "Shutdown finished with failures");
    }
    result
}

fn list_cameras(system: &System) -> Result<()> {
    let cameras = system.get_cameras()?;
    if cameras.is_empty() {
        println!("No cameras found");
    }
    for camera in cameras {
        println!("/// Camera Name   : {}", camera.name);
        println!("/// Model Name    : {}", camera.model_name);
        println!("/// Camera ID     : {}", camera.id);
        println!("/// Serial Number : {}", camera.serial);
        println!("/// @ Interface   : {}", camera.interface_id.as_deref().unwrap_or("-"));
        println!("/// @ Transport   : {}", camera.transport_layer_id.as_deref().unwrap_or("-"));
        println!();
    }
    Ok(())
}

async fn open_camera(system: &System, id: Option<&str>) -> Result<Camera> {
    let camera = match id {
        Some(id) => system.open_by_id(id).await,
        None => {
            let cameras = system.get_cameras()?;
            let first = cameras.first().ok_or_else(|| anyhow!("No cameras found"))?;
            system.open(first).await
        }
    };
    camera.context("Failed to open camera")
}

async fn list_features(system: &System, camera_id: Option<&str>, module: ModuleArg, json: bool) -> Result<()> {
    let camera = open_camera(system, camera_id).await?;
    let descriptor = camera.descriptor().clone();
    let features: FeatureContainer = match module {
        ModuleArg::Camera => camera.features(),
        ModuleArg::LocalDevice => camera.local_features(),
        ModuleArg::Stream => camera.open_stream(0).await?.features(),
        ModuleArg::Interface => {
            let id = descriptor
                .interface_id
                .as_deref()
                .ok_or_else(|| anyhow!("Camera has no interface"))?;
            system.module_features(ModuleKind::Interface, id)?
        }
        ModuleArg::TransportLayer => {
            let id = descriptor
                .transport_layer_id
                .as_deref()
                .ok_or_else(|| anyhow!("Camera has no transport layer"))?;
            system.module_features(ModuleKind::TransportLayer, id)?
        }
    };

    if json {
        let listing: Vec<serde_json::Value> = features
            .infos()
            .into_iter()
            .map(|info| {
                let value = features.display_value(&info.name);
                serde_json::json!({ "info": info, "value": value })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        for info in features.infos() {
            println!("/// Feature Name : {}", info.name);
            println!("/// Display Name : {}", info.display_name);
            println!("/// Type         : {:?}", info.feature_type);
            println!("/// Value        : {}", features.display_value(&info.name));
            if !info.tooltip.is_empty() {
                println!("/// Tooltip      : {}", info.tooltip);
            }
            println!();
        }
    }
    camera.close().await?;
    Ok(())
}

async fn prepared_camera(system: &System) -> Result<Camera> {
    let camera = open_camera(system, None).await?;
    setup::apply(&camera.features(), &system.config().camera).context("Camera setup failed")?;
    Ok(camera)
}

fn allocation_mode(system: &System) -> AllocationMode {
    system.config().capture.allocation_mode.into()
}

fn trigger_mode(system: &System) -> bool {
    system.config().camera.mode == vmbx::config::CameraMode::Trigger
}

async fn grab(system: &System, count: u64, sync: bool, output: Option<PathBuf>) -> Result<()> {
    let recorder = match output {
        Some(dir) => {
            let writer = FrameWriter::create(&dir)?;
            info!(dir = %dir.display(), "Recording frames");
            Some(FrameRecorder::spawn(writer))
        }
        None => None,
    };
    let camera = prepared_camera(system).await?;
    let buffers = system.config().capture.buffer_count;
    let capture = camera.prepare_capture(allocation_mode(system), buffers).await?;
    let trigger = trigger_mode(system);

    if sync {
        capture.start().await?;
        for _ in 0..count {
            if trigger {
                camera.run_command("TriggerSoftware")?;
            }
            let frame = capture.next_frame().await?;
            println!("Frame {:>6}  {}  {}x{}", frame.id(), frame.status(), frame.width(), frame.height());
            if let Some(recorder) = &recorder {
                recorder.record(&frame);
            }
        }
    } else {
        let received = Arc::new(AtomicU64::new(0));
        let done = Arc::new(Notify::new());
        {
            let received = Arc::clone(&received);
            let done = Arc::clone(&done);
            let sink = recorder.as_ref().map(FrameRecorder::sink);
            capture.register_frame_callback(move |frame| {
                println!("Frame {:>6}  {}  {}x{}", frame.id(), frame.status(), frame.width(), frame.height());
                if let Some(sink) = &sink {
                    sink.record(&frame);
                }
                if received.fetch_add(1, Ordering::SeqCst) + 1 == count {
                    done.notify_one();
                }
                Ok(())
            })?;
        }
        capture.start().await?;
        if trigger {
            for _ in 0..count {
                camera.run_command("TriggerSoftware")?;
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        }
        if count > 0 {
            done.notified().await;
        }
    }

    capture.stop().await?;
    // Drops the callback and with it the recorder sink it holds.
    capture.unregister_frame_callback()?;
    if let Some(recorder) = recorder {
        let written = recorder.finish().await?;
        println!("Wrote {} frames", written);
    }
    let stats = capture.statistics();
    info!(
        delivered = stats.delivered,
        incomplete = stats.incomplete,
        lost = stats.lost,
        "Grab finished"
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    capture.end_capture().await?;
    camera.close().await?;
    Ok(())
}

fn print_chunks(chunks: &ChunkFeatures<'_>) {
    for name in chunks.feature_names() {
        println!("    {:<20} {}", name, chunks.display_value(&name));
    }
}

async fn chunks(system: &System, count: u64) -> Result<()> {
    let camera = prepared_camera(system).await?;
    let capture_config = &system.config().capture;
    let options = CaptureOptions {
        decode_chunks: true,
        ..CaptureOptions::from(capture_config)
    };
    let stream = camera.open_stream(capture_config.stream_index).await?;
    let capture = stream
        .prepare_capture_with(allocation_mode(system), capture_config.buffer_count, options)
        .await?;
    let trigger = trigger_mode(system);
    capture.start().await?;
    for _ in 0..count {
        if trigger {
            camera.run_command("TriggerSoftware")?;
        }
        let frame = capture.next_frame().await?;
        println!("Frame {} ({})", frame.id(), frame.status());
        match frame.chunks() {
            Ok(chunks) => print_chunks(&chunks),
            Err(err) => println!("    no chunks: {}", err),
        }
    }
    capture.stop().await?;
    camera.close().await?;
    Ok(())
}

async fn events(system: &System, count: u64) -> Result<()> {
    let camera = prepared_camera(system).await?;
    let mut subscriptions = Vec::new();
    for category in &system.config().camera.events {
        let feature = format!("Event{}", category);
        let subscription = camera
            .subscribe_event(&feature, |event| {
                println!(
                    "Event {} (id {:#x}, timestamp {}, sequence {})",
                    event.feature, event.event_id, event.timestamp, event.sequence
                );
            })
            .with_context(|| format!("Failed to subscribe to {}", feature))?;
        subscriptions.push(subscription);
    }

    let buffers = system.config().capture.buffer_count;
    let capture = camera.prepare_capture(allocation_mode(system), buffers).await?;
    let trigger = trigger_mode(system);
    capture.start().await?;
    for _ in 0..count {
        if trigger {
            camera.run_command("TriggerSoftware")?;
        }
        capture.next_frame().await?;
    }
    capture.stop().await?;
    drop(subscriptions);
    camera.close().await?;
    Ok(())
}
