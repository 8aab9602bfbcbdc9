use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Size of the block device in bytes.
pub fn size(device: impl AsRef<Path>) -> Result<u64, Error> {
    let output = Dependency::Blockdev
        .cmd()
        .arg("--getsize64")
        .arg(device.as_ref())
        .output_and_check()
        .with_context(|| format!("Failed to get size of '{}'", device.as_ref().display()))?;

    output
        .trim()
        .parse()
        .with_context(|| format!("Failed to parse blockdev output '{}'", output.trim()))
}

/// Ejects removable media.
pub fn eject(device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Eject
        .cmd()
        .arg(device.as_ref())
        .run_and_check()
        .with_context(|| format!("Failed to eject '{}'", device.as_ref().display()))
}
