use std::{fs, path::Path};

use devgraph_api::{
    config::ScanConfig,
    descriptor::DeviceDescriptor,
    error::{InvalidInputError, ReportError, StorageError},
};

pub mod actions;
pub mod cli;
pub mod devices;
pub mod devicetree;
pub mod formats;
pub mod interface;
mod logging;
pub mod plan;
pub mod report;
pub mod system;

#[cfg(test)]
mod testutils;

pub use logging::{file_log::FileLog, multilog::MultiLogger};

/// Devgraph version as provided by environment variables at build time
pub const DEVGRAPH_VERSION: &str = match option_env!("DEVGRAPH_VERSION") {
    Some(v) => v,
    None => env!("CARGO_PKG_VERSION"),
};

/// Reads a scan configuration, or the defaults when `path` is None.
pub fn load_config(path: Option<&Path>) -> Result<ScanConfig, StorageError> {
    let Some(path) = path else {
        return Ok(ScanConfig::default());
    };
    let contents = fs::read_to_string(path).structured(InvalidInputError::LoadConfiguration {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&contents).structured(InvalidInputError::ParseConfiguration)
}

/// Reads a YAML list of device descriptors.
pub fn load_descriptors(path: &Path) -> Result<Vec<DeviceDescriptor>, StorageError> {
    let contents = fs::read_to_string(path).structured(InvalidInputError::LoadDescriptors {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&contents).structured(InvalidInputError::ParseDescriptors)
}
