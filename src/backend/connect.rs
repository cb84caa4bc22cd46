//! Device connection procedure
//!
//! Brings one configured device from "name in a config file" to "open handle
//! with tuned channels and ready streams". Every step that fails aborts the
//! connection of that device only and is reported as
//! [`BioviewError::Connection`].
//!
//! # Steps
//!
//! 1. Resolve the serial (address book, else discovery by name)
//! 2. Open the handle and select the front-end sub-devices
//! 3. Set the reference clock and wait for it to lock
//! 4. Set the time (PPS) source
//! 5. Check that every configured channel exists
//! 6. Tune rate, carrier, gain and antenna per channel
//! 7. Create the receive and transmit streams

use crate::config::{AddressBook, DeviceConfig, CLOCK_TIMEOUT};
use crate::error::{BioviewError, Result};
use crate::hardware::{RadioDriver, RadioHandle, RxStream, StreamArgs, TxStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Receive antenna port used on every channel
pub const RX_ANTENNA: &str = "RX2";

/// Transmit antenna port used on every channel
pub const TX_ANTENNA: &str = "TX1";

/// Clock sources accepted in a device configuration
const CLOCK_SOURCES: &[&str] = &["internal", "external", "gpsdo", "mimo"];

/// An opened, configured device
pub struct DeviceLink {
    pub name: String,
    pub serial: String,
    pub radio: Arc<dyn RadioHandle>,
    /// Receive stream, lent to the acquisition worker while streaming
    pub rx_stream: Option<Box<dyn RxStream>>,
    /// Transmit stream, lent to the transmission worker while streaming
    pub tx_stream: Option<Box<dyn TxStream>>,
}

impl std::fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceLink")
            .field("name", &self.name)
            .field("serial", &self.serial)
            .field("rx_stream", &self.rx_stream.is_some())
            .field("tx_stream", &self.tx_stream.is_some())
            .finish()
    }
}

fn lock_book(book: &Mutex<AddressBook>) -> MutexGuard<'_, AddressBook> {
    book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wrap a hardware failure as a connection error of this device
fn step<T>(device: &str, what: &str, result: Result<T>) -> Result<T> {
    result.map_err(|e| BioviewError::connection(device, format!("{}: {}", what, e)))
}

/// Find the device by name and remember its serial
fn discover(driver: &dyn RadioDriver, name: &str, book: &Mutex<AddressBook>) -> Result<String> {
    let found = step(name, "Discovery failed", driver.find(name))?;
    let address = found
        .into_iter()
        .find(|a| a.name == name)
        .ok_or_else(|| BioviewError::connection(name, "Device not found"))?;

    tracing::info!("Found {} ({}, serial {})", name, address.product, address.serial);
    let mut book = lock_book(book);
    if book.insert(name, address.serial.clone()) {
        if let Err(e) = book.save() {
            tracing::warn!("Failed to save address book: {}", e);
        }
    }
    Ok(address.serial)
}

/// Open the device, trying the cached serial first
fn open(
    driver: &dyn RadioDriver,
    name: &str,
    book: &Mutex<AddressBook>,
) -> Result<(String, Arc<dyn RadioHandle>)> {
    let cached = lock_book(book).lookup(name).map(str::to_owned);

    if let Some(serial) = cached {
        match driver.open(&serial) {
            Ok(radio) => return Ok((serial, radio)),
            Err(e) => {
                tracing::warn!("Cached serial {} for {} failed to open ({}), rediscovering", serial, name, e);
                let mut book = lock_book(book);
                book.remove(name);
                if let Err(e) = book.save() {
                    tracing::warn!("Failed to save address book: {}", e);
                }
            }
        }
    }

    let serial = discover(driver, name, book)?;
    let radio = step(name, "Failed to open device", driver.open(&serial))?;
    Ok((serial, radio))
}

/// Poll the lock sensor of one board until it locks or CLOCK_TIMEOUT passes
fn wait_for_lock(radio: &dyn RadioHandle, device: &str, board: usize) -> Result<()> {
    let start = Instant::now();
    loop {
        if step(device, "Failed to read ref lock sensor", radio.ref_locked(board))? {
            tracing::debug!("[{}] Board {} reference locked after {:?}", device, board, start.elapsed());
            return Ok(());
        }
        if start.elapsed() > CLOCK_TIMEOUT {
            return Err(BioviewError::connection(
                device,
                format!("Reference clock of board {} failed to lock within {:?}", board, CLOCK_TIMEOUT),
            ));
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn setup_ref(radio: &dyn RadioHandle, config: &DeviceConfig) -> Result<()> {
    let name = config.name.as_str();
    let clock = config.clock.as_str();
    if !CLOCK_SOURCES.contains(&clock) {
        return Err(BioviewError::connection(name, format!("Unknown clock source {}", clock)));
    }

    if clock == "mimo" {
        if radio.num_mboards() != 2 {
            return Err(BioviewError::connection(name, "mimo clock requires exactly two boards"));
        }
        // The second board slaves to the first over the MIMO cable
        step(name, "Failed to set clock source", radio.set_clock_source("mimo", Some(1)))?;
    } else {
        step(name, "Failed to set clock source", radio.set_clock_source(clock, None))?;
    }

    if clock != "internal" {
        for board in 0..radio.num_mboards() {
            if clock == "mimo" && board == 0 {
                continue;
            }
            wait_for_lock(radio, name, board)?;
        }
    }
    Ok(())
}

fn setup_pps(radio: &dyn RadioHandle, config: &DeviceConfig) -> Result<()> {
    let name = config.name.as_str();
    if config.pps == "mimo" {
        if radio.num_mboards() != 2 {
            return Err(BioviewError::connection(name, "mimo time source requires exactly two boards"));
        }
        step(name, "Failed to set time source", radio.set_time_source("mimo", Some(1)))
    } else {
        step(name, "Failed to set time source", radio.set_time_source(&config.pps, None))
    }
}

fn check_channels(radio: &dyn RadioHandle, config: &DeviceConfig) -> Result<()> {
    let rx_available = radio.rx_num_channels();
    if let Some(&chan) = config.rx_channels.iter().find(|&&c| c >= rx_available) {
        return Err(BioviewError::connection(
            &config.name,
            format!("Rx channel {} requested, device has {}", chan, rx_available),
        ));
    }
    let tx_available = radio.tx_num_channels();
    if let Some(&chan) = config.tx_channels.iter().find(|&&c| c >= tx_available) {
        return Err(BioviewError::connection(
            &config.name,
            format!("Tx channel {} requested, device has {}", chan, tx_available),
        ));
    }
    Ok(())
}

fn tune(radio: &dyn RadioHandle, config: &DeviceConfig, sample_rate: f64) -> Result<()> {
    let name = config.name.as_str();
    for (i, &chan) in config.rx_channels.iter().enumerate() {
        step(name, "Failed to set rx rate", radio.set_rx_rate(sample_rate, chan))?;
        step(name, "Failed to set rx frequency", radio.set_rx_freq(config.carrier_freq, chan))?;
        let gain = config.rx_gain.get(i).copied().unwrap_or(0.0);
        step(name, "Failed to set rx gain", radio.set_rx_gain(gain, chan))?;
        step(name, "Failed to set rx antenna", radio.set_rx_antenna(RX_ANTENNA, chan))?;

        let actual = radio.rx_rate(chan);
        if (actual - sample_rate).abs() > f64::EPSILON * sample_rate {
            tracing::warn!("[{}] Rx channel {} runs at {} Hz, requested {} Hz", name, chan, actual, sample_rate);
        }
    }
    for (i, &chan) in config.tx_channels.iter().enumerate() {
        step(name, "Failed to set tx rate", radio.set_tx_rate(sample_rate, chan))?;
        step(name, "Failed to set tx frequency", radio.set_tx_freq(config.carrier_freq, chan))?;
        let gain = config.tx_gain.get(i).copied().unwrap_or(0.0);
        step(name, "Failed to set tx gain", radio.set_tx_gain(gain, chan))?;
        step(name, "Failed to set tx antenna", radio.set_tx_antenna(TX_ANTENNA, chan))?;
    }
    Ok(())
}

/// Run the whole connection procedure for one device
pub fn connect_device(
    driver: &dyn RadioDriver,
    config: &DeviceConfig,
    sample_rate: f64,
    book: &Mutex<AddressBook>,
) -> Result<DeviceLink> {
    let name = config.name.as_str();
    let (serial, radio) = open(driver, name, book)?;
    tracing::info!("[{}] Opened device {}", name, serial);

    step(name, "Failed to set rx subdev", radio.set_rx_subdev_spec(&config.rx_subdev))?;
    step(name, "Failed to set tx subdev", radio.set_tx_subdev_spec(&config.tx_subdev))?;

    setup_ref(radio.as_ref(), config)?;
    setup_pps(radio.as_ref(), config)?;
    check_channels(radio.as_ref(), config)?;
    tune(radio.as_ref(), config, sample_rate)?;

    let rx_args = StreamArgs {
        cpu_format: config.cpu_format.clone(),
        wire_format: config.wire_format.clone(),
        channels: config.rx_channels.clone(),
    };
    let tx_args = StreamArgs {
        channels: config.tx_channels.clone(),
        ..rx_args.clone()
    };
    let rx_stream = step(name, "Failed to create rx stream", radio.rx_stream(&rx_args))?;
    let tx_stream = step(name, "Failed to create tx stream", radio.tx_stream(&tx_args))?;

    tracing::info!(
        "[{}] Configured {} rx / {} tx channels at {} Hz, carrier {} Hz",
        name,
        config.rx_channels.len(),
        config.tx_channels.len(),
        sample_rate,
        config.carrier_freq
    );

    Ok(DeviceLink {
        name: name.to_string(),
        serial,
        radio,
        rx_stream: Some(rx_stream),
        tx_stream: Some(tx_stream),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::{SimDeviceSpec, SimDriver};

    fn device(name: &str) -> DeviceConfig {
        DeviceConfig::new(name, vec![100e3, 125e3], 2.4e9).with_gains(vec![10.0, 20.0], vec![30.0, 40.0])
    }

    fn driver() -> SimDriver {
        SimDriver::new()
            .with_device(SimDeviceSpec::new("usrp0", "A1"))
            .with_device(SimDeviceSpec::new("usrp1", "B2").with_mboards(2))
    }

    #[test]
    fn test_connect_tunes_every_channel() {
        let driver = driver();
        let book = Mutex::new(AddressBook::in_memory());
        let link = connect_device(&driver, &device("usrp0"), 1e6, &book).unwrap();

        assert_eq!(link.serial, "A1");
        assert!(link.rx_stream.is_some() && link.tx_stream.is_some());
        assert_eq!(book.lock().unwrap().lookup("usrp0"), Some("A1"));

        let radio = driver.radio("A1").unwrap();
        assert_eq!(radio.rx_gains(), vec![10.0, 20.0]);
        assert_eq!(radio.tx_gains(), vec![30.0, 40.0]);
        assert_eq!(radio.rx_freqs(), vec![2.4e9, 2.4e9]);
        let (rx_ant, tx_ant) = radio.antennas();
        assert!(rx_ant.iter().all(|a| a == RX_ANTENNA));
        assert!(tx_ant.iter().all(|a| a == TX_ANTENNA));
    }

    #[test]
    fn test_unknown_device_is_connection_error() {
        let book = Mutex::new(AddressBook::in_memory());
        let err = connect_device(&driver(), &device("usrp9"), 1e6, &book).unwrap_err();
        assert!(matches!(err, BioviewError::Connection { ref device, .. } if device == "usrp9"));
    }

    #[test]
    fn test_stale_cached_serial_is_rediscovered() {
        let mut book = AddressBook::in_memory();
        book.insert("usrp0", "STALE");
        let book = Mutex::new(book);

        let link = connect_device(&driver(), &device("usrp0"), 1e6, &book).unwrap();
        assert_eq!(link.serial, "A1");
        assert_eq!(book.lock().unwrap().lookup("usrp0"), Some("A1"));
    }

    #[test]
    fn test_missing_channel_rejected() {
        let book = Mutex::new(AddressBook::in_memory());
        let config = device("usrp0").with_channels(vec![0, 2], vec![0]);
        let config = DeviceConfig {
            if_freq: vec![100e3],
            ..config
        };
        let err = connect_device(&driver(), &config, 1e6, &book).unwrap_err();
        assert!(err.to_string().contains("Rx channel 2"));
    }

    #[test]
    fn test_mimo_clock() {
        let book = Mutex::new(AddressBook::in_memory());
        let mut config = device("usrp1");
        config.clock = "mimo".into();
        config.pps = "mimo".into();
        connect_device(&driver(), &config, 1e6, &book).unwrap();

        // Single-board devices cannot use mimo
        let mut single = device("usrp0");
        single.clock = "mimo".into();
        assert!(connect_device(&driver(), &single, 1e6, &book).is_err());
    }

    #[test]
    fn test_unlocked_reference_times_out() {
        let driver = SimDriver::new().with_device(SimDeviceSpec::new("usrp0", "A1").with_unlockable_ref());
        let book = Mutex::new(AddressBook::in_memory());
        let mut config = device("usrp0");
        config.clock = "external".into();

        let start = Instant::now();
        let err = connect_device(&driver, &config, 1e6, &book).unwrap_err();
        assert!(start.elapsed() >= CLOCK_TIMEOUT);
        assert!(err.to_string().contains("failed to lock"));

        // Internal clock never polls the sensor
        let mut internal = device("usrp0");
        internal.clock = "internal".into();
        assert!(connect_device(&driver, &internal, 1e6, &book).is_ok());
    }
}
