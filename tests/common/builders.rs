//! Test data builders for creating test objects

use bioview_rs::config::BiosignalConfig;
use bioview_rs::{DeviceConfig, ExperimentConfig};

/// Builder for creating test experiment configurations
pub struct ExperimentBuilder {
    config: ExperimentConfig,
}

impl ExperimentBuilder {
    pub fn new() -> Self {
        Self {
            config: ExperimentConfig {
                sample_rate: 1e6,
                buffer_packets: 2,
                ..Default::default()
            },
        }
    }

    /// Add a two-channel device with the given IFs
    pub fn device(mut self, name: &str, if_freq: [f64; 2]) -> Self {
        self.config
            .devices
            .push(DeviceConfig::new(name, if_freq.to_vec(), 2.4e9));
        self
    }

    pub fn save_ds(mut self, save_ds: usize) -> Self {
        self.config.save_ds = save_ds;
        self
    }

    pub fn balance(mut self, balance: bool) -> Self {
        self.config.balance = balance;
        self
    }

    pub fn pairs(mut self, pairs: Vec<(usize, usize)>) -> Self {
        self.config.pairs = Some(pairs);
        self
    }

    /// Add a biosignal amplifier with the given channel mask
    pub fn biosignal(mut self, name: &str, channels: Vec<bool>) -> Self {
        let mut bio = BiosignalConfig::new(name, channels);
        bio.batch = 10;
        self.config.biosignal = Some(bio);
        self
    }

    pub fn build(self) -> ExperimentConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_builder() {
        let config = ExperimentBuilder::new()
            .device("usrp0", [100e3, 125e3])
            .save_ds(50)
            .build();

        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.save_ds, 50);
        assert!(config.validate().is_ok());
    }
}
