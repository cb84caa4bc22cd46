//! Device address book
//!
//! Caches the serial number found for each device name so that later
//! connections can open the device directly instead of running discovery.
//! Stored as JSON in the platform data directory:
//! - **Linux**: `~/.local/share/org.bioview.bioview-rs/devices.json`
//! - **macOS**: `~/Library/Application Support/org.bioview.bioview-rs/devices.json`
//! - **Windows**: `%APPDATA%\org.bioview.bioview-rs\devices.json`

use super::APP_ID;
use crate::error::{BioviewError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Address book filename
pub const ADDRESS_BOOK_FILE: &str = "devices.json";

/// Path of the address book in the platform data directory
pub fn default_path() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID).join(ADDRESS_BOOK_FILE))
}

/// Persistent device name → serial map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressBook {
    #[serde(default)]
    entries: BTreeMap<String, String>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl AddressBook {
    /// An address book that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from a file; a missing file gives an empty book bound to that path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut book = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| {
                BioviewError::Config(format!("Failed to read address book {:?}: {}", path, e))
            })?;
            serde_json::from_str::<AddressBook>(&content).map_err(|e| {
                BioviewError::Config(format!("Failed to parse address book {:?}: {}", path, e))
            })?
        } else {
            AddressBook::default()
        };
        book.path = Some(path.to_path_buf());
        Ok(book)
    }

    /// Load from the platform data directory, falling back to an in-memory book
    pub fn load_default() -> Self {
        match default_path() {
            Some(path) => Self::load(&path).unwrap_or_else(|e| {
                tracing::warn!("Ignoring address book: {}", e);
                Self {
                    path: Some(path),
                    ..Default::default()
                }
            }),
            None => Self::in_memory(),
        }
    }

    /// Cached serial for a device name
    pub fn lookup(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Record the serial of a device; returns true if the entry changed
    pub fn insert(&mut self, name: impl Into<String>, serial: impl Into<String>) -> bool {
        let serial = serial.into();
        let previous = self.entries.insert(name.into(), serial.clone());
        previous.as_deref() != Some(serial.as_str())
    }

    /// Forget a device (e.g. after its cached serial failed to open)
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write the book to its file; in-memory books are left untouched
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BioviewError::Config(format!("Failed to create address book directory: {}", e))
            })?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| {
            BioviewError::Config(format!("Failed to write address book {:?}: {}", path, e))
        })
    }
}
