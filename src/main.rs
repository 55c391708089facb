//! Mixr GW
//!
//! Gateway between a serial multi-slider controller and per-application
//! audio volume, with now-playing and cover art mirrored to the device.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mixr_gw::audio::{
    is_master, AudioMixer, RebuildReason, RoutingController, SessionRoutingTable,
    VolumeApplier,
};
use mixr_gw::config::AppConfig;
use mixr_gw::input::SliderInputDecoder;
use mixr_gw::link::{DeviceLink, LinkConfig};
use mixr_gw::media::{CoverEncoder, MediaProvider, NowPlayingWatcher};
use mixr_gw::paths::AppPaths;
use mixr_gw::shutdown::{self, ShutdownSignal};
use mixr_gw::supervisor::{ConnectionSupervisor, SupervisorConfig};
use mixr_gw::transport::{self, SerialTransport};
use mixr_gw::watcher::{SysinfoProcessSource, WhitelistProcessWatcher};

/// Mixr Gateway - slider controller to per-application volume
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: auto-detected)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Serial port, overrides com_port from the config
    #[arg(short, long, env = "MIXR_PORT")]
    port: Option<String>,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,

    /// Build the routing table once, print it and exit
    #[arg(long)]
    test_routing: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let paths = match &args.config {
        Some(path) => AppPaths::for_config(path),
        None => AppPaths::detect(),
    };
    paths.ensure_directories()?;

    // Held for the process lifetime so the file writer keeps flushing
    let _log_guard = init_logging(&args.log_level, &paths.logs_dir)?;

    info!("Starting Mixr GW v{}...", env!("CARGO_PKG_VERSION"));

    if args.list_ports {
        list_ports();
        return Ok(());
    }

    info!("Configuration file: {}", paths.config.display());
    let mut config = AppConfig::load(&paths.config).await?;
    if let Some(port) = args.port {
        info!("Serial port overridden to {}", port);
        config.com_port = port;
    }
    info!(
        "{} sliders on {} @ {} baud (noise reduction: {})",
        config.slider_mapping.len(),
        config.com_port,
        config.baud_rate,
        config.noise_reduction
    );

    let mixer = platform_mixer(&config);
    info!("Audio backend: {}", mixer.name());

    if args.test_routing {
        return test_routing(&config, mixer).await;
    }

    let (trigger, signal) = shutdown::channel();
    let app = tokio::spawn(run_app(config, mixer, signal));

    shutdown_signal().await;
    trigger.trigger();

    app.await??;
    info!("Mixr GW shutdown complete");
    Ok(())
}

async fn run_app(config: AppConfig, mixer: Arc<dyn AudioMixer>, signal: ShutdownSignal) -> Result<()> {
    let tuning = &config.tuning;
    let mut tasks = Vec::new();

    let routing = Arc::new(SessionRoutingTable::new(
        &config.slider_mapping,
        &config.session_groups,
    ));
    let (controller, controller_task) =
        RoutingController::spawn(routing.clone(), mixer.clone(), signal.clone());
    controller.request(RebuildReason::Startup);
    tasks.push(controller_task);

    let applier = VolumeApplier::spawn(routing, mixer, tuning.volume_workers, tuning.volume_queue);
    let serial = transport::shared(SerialTransport::new());

    let mut supervisor = ConnectionSupervisor::new(
        serial.clone(),
        SupervisorConfig {
            port: config.com_port.clone(),
            baud_rate: config.baud_rate,
            backoff: tuning.reconnect_backoff(),
        },
        SliderInputDecoder::from_config(&config),
        applier,
        controller.clone(),
    );

    match media_provider().await {
        Some(provider) => {
            let (media_tx, media_rx) = mpsc::unbounded_channel();
            let watcher = NowPlayingWatcher::new(provider, CoverEncoder::from(tuning), media_tx);
            supervisor = supervisor.with_media(watcher.notifier());

            let link = DeviceLink::new(serial, LinkConfig::from(tuning), supervisor.event_sender());
            tasks.push(tokio::spawn(link.run(media_rx, signal.clone())));
            tasks.push(tokio::spawn(watcher.run(tuning.media_watchdog(), signal.clone())));
        },
        None => info!("Now-playing mirroring disabled (no media session service)"),
    }

    let processes = WhitelistProcessWatcher::new(SysinfoProcessSource::new(), &config.whitelist);
    tasks.push(tokio::spawn(processes.run(
        controller,
        tuning.process_poll(),
        signal.clone(),
    )));

    info!("✅ Ready, waiting for the controller on {}", config.com_port);
    supervisor.run(signal).await;

    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task ended abnormally: {}", e);
        }
    }
    Ok(())
}

#[cfg(windows)]
fn platform_mixer(_config: &AppConfig) -> Arc<dyn AudioMixer> {
    Arc::new(mixr_gw::audio::wasapi::WasapiMixer::new())
}

/// Without a native mixer, pretend every configured slider has a stream
#[cfg(not(windows))]
fn platform_mixer(config: &AppConfig) -> Arc<dyn AudioMixer> {
    let names: Vec<String> = config
        .slider_mapping
        .iter()
        .filter(|s| !is_master(s))
        .cloned()
        .collect();
    Arc::new(mixr_gw::audio::ConsoleMixer::new(names))
}

#[cfg(windows)]
async fn media_provider() -> Option<Arc<dyn MediaProvider>> {
    use mixr_gw::media::gsmtc::GsmtcProvider;

    match tokio::task::spawn_blocking(GsmtcProvider::start).await {
        Ok(Ok(provider)) => Some(Arc::new(provider)),
        Ok(Err(e)) => {
            warn!("Media session service unavailable: {}", e);
            None
        },
        Err(e) => {
            warn!("Media session startup failed: {}", e);
            None
        },
    }
}

#[cfg(not(windows))]
async fn media_provider() -> Option<Arc<dyn MediaProvider>> {
    None
}

fn init_logging(level: &str, logs_dir: &Path) -> Result<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(logs_dir, "mixr.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}

fn list_ports() {
    use colored::*;

    println!("\n{}", "=== Serial Ports ===".bold().cyan());
    match serialport::available_ports() {
        Ok(ports) if ports.is_empty() => println!("  {}", "(none found)".yellow()),
        Ok(ports) => {
            for port in ports {
                let detail = match port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => format!(
                        "USB {:04x}:{:04x} {}",
                        usb.vid,
                        usb.pid,
                        usb.product.unwrap_or_default()
                    ),
                    serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                    serialport::SerialPortType::PciPort => "PCI".to_string(),
                    serialport::SerialPortType::Unknown => String::new(),
                };
                println!("  {} {}", port.port_name.green(), detail.dimmed());
            }
        },
        Err(e) => println!("  {} {}", "Failed to list ports:".red(), e),
    }
}

async fn test_routing(config: &AppConfig, mixer: Arc<dyn AudioMixer>) -> Result<()> {
    use colored::*;

    println!("\n{}", "=== Testing Audio Routing ===".bold().cyan());

    let routing = Arc::new(SessionRoutingTable::new(
        &config.slider_mapping,
        &config.session_groups,
    ));
    let summary = {
        let routing = routing.clone();
        tokio::task::spawn_blocking(move || {
            mixer.active_streams().map(|streams| routing.rebuild(streams))
        })
        .await??
    };

    println!(
        "  Streams: {}  mapped: {}",
        summary.streams_seen.to_string().green(),
        summary.streams_mapped.to_string().green()
    );

    println!("\n{}", "Sliders:".bold());
    for (index, slider) in config.slider_mapping.iter().enumerate() {
        let label = format!("{:>2}. {}", index, slider);
        if is_master(slider) {
            println!("  {} -> {}", label.yellow(), "default output device".cyan());
            continue;
        }
        let streams = routing.streams_for(slider);
        if streams.is_empty() {
            println!("  {} -> {}", label.yellow(), "no stream".red());
        } else {
            let names: Vec<&str> = streams.iter().map(|s| s.display_name.as_str()).collect();
            println!("  {} -> {}", label.yellow(), names.join(", ").green());
        }
    }

    println!("\n{}", "✅ Routing test complete!".green().bold());
    Ok(())
}
