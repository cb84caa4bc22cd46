//! bioview - command line acquisition runner
//!
//! Runs an experiment against the simulated radio driver: connects every
//! configured device, streams for a fixed duration and logs what the backend
//! reports. A configured biosignal amplifier is served by the simulated
//! amplifier.

use anyhow::{bail, Context};
use bioview_rs::{
    backend::AcquisitionBackend,
    config::{AddressBook, DeviceConfig, ExperimentConfig},
    hardware::biosignal::{SimBiosignalDriver, SimBiosignalSpec},
    hardware::sim::{SimDeviceSpec, SimDriver, SimTone},
    BackendMessage, ConnectionState,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "bioview")]
#[command(about = "Multi-device RF acquisition and IF demodulation")]
struct Cli {
    /// Experiment configuration (TOML or JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// CSV file receiving every processed block
    #[arg(short = 's', long)]
    save: Option<PathBuf>,

    /// Streaming duration in seconds
    #[arg(short = 'd', long, default_value = "5")]
    duration: f64,

    /// Also write logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

/// Single two-channel device used when no configuration is given
fn default_config() -> ExperimentConfig {
    ExperimentConfig {
        devices: vec![DeviceConfig::new("usrp0", vec![100e3, 125e3], 2.4e9)],
        ..Default::default()
    }
}

/// Simulated radios answering to every configured device
fn sim_driver(config: &ExperimentConfig) -> SimDriver {
    config
        .devices
        .iter()
        .enumerate()
        .fold(SimDriver::new(), |driver, (i, device)| {
            let tones = device
                .if_freq
                .iter()
                .zip(&device.tx_amplitude)
                .map(|(&freq, &amp)| SimTone::new(freq, amp * 0.5))
                .collect();
            let rx = device.rx_channels.iter().max().map_or(1, |c| c + 1);
            let tx = device.tx_channels.iter().max().map_or(1, |c| c + 1);
            driver.with_device(
                SimDeviceSpec::new(device.name.clone(), format!("SIM{:04}", i))
                    .with_channels(rx, tx)
                    .with_tones(tones)
                    .with_noise(0.01)
                    .with_realtime(true),
            )
        })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; the guard flushes the file writer on exit
    let (file_layer, _guard) = match &cli.log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(std::path::Path::new("."));
            let name = path.file_name().context("Log file path has no file name")?;
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
            (
                Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bioview_rs=debug")))
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path).with_context(|| format!("Loading {:?}", path))?,
        None => {
            tracing::info!("No configuration given, using a single simulated device");
            default_config()
        }
    };
    if cli.save.is_some() {
        config.save_path = cli.save.clone();
    }
    config.validate()?;

    tracing::info!(
        "Starting bioview: {} devices, {} sources, {} Hz",
        config.devices.len(),
        config.topology().len(),
        config.sample_rate
    );

    let driver = Arc::new(sim_driver(&config));
    let group = config.name.clone();
    let bio_name = config.biosignal.as_ref().map(|b| b.name.clone());
    let (backend, frontend) = AcquisitionBackend::new(config, driver);
    let mut backend = backend.with_address_book(AddressBook::load_default());
    if let Some(bio) = &bio_name {
        tracing::info!("Biosignal device {} on the simulated amplifier", bio);
        backend = backend.with_biosignal_driver(Arc::new(SimBiosignalDriver::new(
            SimBiosignalSpec::default().with_realtime(true),
        )));
    }
    let backend_handle = std::thread::Builder::new()
        .name("backend".into())
        .spawn(move || backend.run())
        .context("Failed to spawn backend thread")?;

    frontend.connect();
    let deadline = Instant::now() + CONNECT_TIMEOUT;
    let mut state = ConnectionState::Connecting;
    let mut bio_state = bio_name.as_ref().map(|_| ConnectionState::Connecting);
    while state != ConnectionState::Connected || bio_state == Some(ConnectionState::Connecting) {
        if Instant::now() >= deadline || state == ConnectionState::Disconnected {
            frontend.shutdown();
            let _ = backend_handle.join();
            bail!("Devices failed to connect");
        }
        if let Ok(BackendMessage::Status { device_id, state: s }) =
            frontend.receiver.recv_timeout(Duration::from_millis(100))
        {
            if device_id == group {
                state = s;
            } else if bio_name.as_deref() == Some(device_id.as_str()) {
                bio_state = Some(s);
            }
        }
    }

    frontend.start();
    let run_for = Duration::from_secs_f64(cli.duration.max(0.0));
    let started = Instant::now();
    let mut updates = 0u64;
    let mut last_report = Instant::now();
    while started.elapsed() < run_for {
        for msg in frontend.drain() {
            match msg {
                BackendMessage::Display { .. } => updates += 1,
                BackendMessage::Status { device_id, state } => {
                    tracing::info!("{} is {}", device_id, state);
                }
                _ => {}
            }
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            tracing::info!("{} display updates so far", updates);
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    frontend.stop();
    frontend.shutdown();
    let mut summary = None;
    while let Ok(msg) = frontend.receiver.recv_timeout(Duration::from_secs(5)) {
        match msg {
            BackendMessage::Stats(s) => summary = Some(s),
            BackendMessage::Shutdown => break,
            _ => {}
        }
    }
    if backend_handle.join().is_err() {
        bail!("Backend thread panicked");
    }

    match summary {
        Some(s) => {
            tracing::info!(
                "Run finished: {} blocks, {} skipped cycles, {} samples dropped, {} display updates",
                s.engine.blocks_emitted,
                s.engine.cycles_skipped,
                s.samples_dropped(),
                updates
            );
            if s.display.dropped > 0 {
                tracing::warn!("{} display updates dropped by the frontend queue", s.display.dropped);
            }
            if let Some(bio) = &s.biosignal {
                tracing::info!(
                    "Biosignal: {} samples in {} batches, {} rows saved",
                    bio.samples,
                    bio.batches,
                    bio.rows_saved
                );
            }
            if let Some(save) = s.save {
                tracing::info!("Saved {} blocks ({} failed)", save.written, save.failed);
            }
        }
        None => tracing::warn!("Backend stopped without reporting statistics"),
    }

    Ok(())
}
