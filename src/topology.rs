//! Channel topology
//!
//! Maps the transmit/receive channels of one or more radio devices onto an
//! ordered list of logical [`DataSource`]s. Channels are numbered globally by
//! cumulative offset in device declaration order, so device 1's first receive
//! channel follows the last receive channel of device 0.
//!
//! # Algorithm
//!
//! 1. Build global receive and transmit enable masks. In balanced mode every
//!    other global index is enabled, otherwise every index is.
//! 2. Walk enabled receive channels ascending; for each, walk enabled transmit
//!    channels ascending.
//! 3. Keep a pair when no allow-list is given, when both channels live on the
//!    same device, or when the unordered device pair appears in the allow-list.
//! 4. Number kept pairs densely and label them `Tx{n}Rx{m}`, where both
//!    counters are 1-based over enabled channels (the transmit counter advances
//!    for every enabled transmit channel, kept or not).

use crate::types::DataSource;
use std::sync::Arc;

/// Per-device channel counts used to build a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceChannels {
    pub rx: usize,
    pub tx: usize,
}

impl DeviceChannels {
    pub fn new(rx: usize, tx: usize) -> Self {
        Self { rx, tx }
    }
}

/// Ordered set of logical data channels over a group of devices
#[derive(Debug, Clone, Default)]
pub struct ChannelTopology {
    sources: Vec<DataSource>,
    /// Global index of each device's first receive channel (plus a final total)
    rx_offsets: Vec<usize>,
    /// Global index of each device's first transmit channel (plus a final total)
    tx_offsets: Vec<usize>,
}

fn cumulative(counts: impl Iterator<Item = usize>) -> Vec<usize> {
    let mut offsets = vec![0];
    let mut total = 0;
    for count in counts {
        total += count;
        offsets.push(total);
    }
    offsets
}

/// Device owning a global index, given cumulative offsets
fn owner(offsets: &[usize], global: usize) -> Option<usize> {
    offsets.windows(2).position(|w| global >= w[0] && global < w[1])
}

fn enabled_mask(total: usize, balance: bool) -> Vec<bool> {
    (0..total).map(|i| !balance || i % 2 == 0).collect()
}

impl ChannelTopology {
    /// Build the topology for a group of devices
    ///
    /// `pairs` is an optional allow-list of device index pairs; order within a
    /// pair does not matter and same-device pairs are always allowed.
    pub fn build(
        device_name: &str,
        devices: &[DeviceChannels],
        balance: bool,
        pairs: Option<&[(usize, usize)]>,
    ) -> Self {
        let rx_offsets = cumulative(devices.iter().map(|d| d.rx));
        let tx_offsets = cumulative(devices.iter().map(|d| d.tx));
        let num_rx = rx_offsets.last().copied().unwrap_or(0);
        let num_tx = tx_offsets.last().copied().unwrap_or(0);

        let rx_enabled = enabled_mask(num_rx, balance);
        let tx_enabled = enabled_mask(num_tx, balance);

        let device: Arc<str> = Arc::from(device_name);
        let mut sources = Vec::new();
        let mut rx_ctr = 1;

        for rx_index in (0..num_rx).filter(|&i| rx_enabled[i]) {
            let mut tx_ctr = 1;
            for tx_index in (0..num_tx).filter(|&i| tx_enabled[i]) {
                // Both indices are in range, so owners always exist
                let rx_device = owner(&rx_offsets, rx_index).unwrap_or(0);
                let tx_device = owner(&tx_offsets, tx_index).unwrap_or(0);

                let allowed = match pairs {
                    None => true,
                    Some(list) => {
                        rx_device == tx_device
                            || list.iter().any(|&(a, b)| {
                                (a, b) == (rx_device, tx_device) || (b, a) == (rx_device, tx_device)
                            })
                    }
                };

                if allowed {
                    sources.push(DataSource {
                        device: Arc::clone(&device),
                        channel: sources.len(),
                        tx_index,
                        rx_index,
                        tx_device,
                        rx_device,
                        label: format!("Tx{}Rx{}", tx_ctr, rx_ctr),
                    });
                }
                tx_ctr += 1;
            }
            rx_ctr += 1;
        }

        tracing::debug!(
            "Topology for {}: {} devices, {} rx, {} tx, {} sources (balance={})",
            device_name,
            devices.len(),
            num_rx,
            num_tx,
            sources.len(),
            balance
        );

        Self {
            sources,
            rx_offsets,
            tx_offsets,
        }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataSource> {
        self.sources.iter()
    }

    pub fn sources(&self) -> &[DataSource] {
        &self.sources
    }

    pub fn get(&self, channel: usize) -> Option<&DataSource> {
        self.sources.get(channel)
    }

    /// Look up a source by its label
    pub fn find(&self, label: &str) -> Option<&DataSource> {
        self.sources.iter().find(|s| s.label == label)
    }

    pub fn num_devices(&self) -> usize {
        self.rx_offsets.len().saturating_sub(1)
    }

    /// Total receive channels across all devices
    pub fn num_rx(&self) -> usize {
        self.rx_offsets.last().copied().unwrap_or(0)
    }

    /// Total transmit channels across all devices
    pub fn num_tx(&self) -> usize {
        self.tx_offsets.last().copied().unwrap_or(0)
    }

    /// Global index of a device-local receive channel
    pub fn absolute_rx(&self, device: usize, local: usize) -> Option<usize> {
        let start = *self.rx_offsets.get(device)?;
        let end = *self.rx_offsets.get(device + 1)?;
        (start + local < end).then_some(start + local)
    }

    /// Global index of a device-local transmit channel
    pub fn absolute_tx(&self, device: usize, local: usize) -> Option<usize> {
        let start = *self.tx_offsets.get(device)?;
        let end = *self.tx_offsets.get(device + 1)?;
        (start + local < end).then_some(start + local)
    }

    /// Device owning a global receive index
    pub fn device_of_rx(&self, global: usize) -> Option<usize> {
        owner(&self.rx_offsets, global)
    }

    /// Device owning a global transmit index
    pub fn device_of_tx(&self, global: usize) -> Option<usize> {
        owner(&self.tx_offsets, global)
    }
}

impl<'a> IntoIterator for &'a ChannelTopology {
    type Item = &'a DataSource;
    type IntoIter = std::slice::Iter<'a, DataSource>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.iter()
    }
}
