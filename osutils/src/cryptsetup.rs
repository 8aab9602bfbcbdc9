use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Initializes a LUKS header on `device`, reading the passphrase from stdin.
pub fn luks_format(device: impl AsRef<Path>, passphrase: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksFormat")
        .arg("--batch-mode")
        .arg("--key-file=-")
        .arg(device.as_ref())
        .stdin(passphrase)
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to format '{}' as LUKS",
                device.as_ref().display()
            )
        })
}

pub fn luks_open(device: impl AsRef<Path>, map_name: &str, passphrase: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("open")
        .arg("--type")
        .arg("luks")
        .arg("--key-file=-")
        .arg(device.as_ref())
        .arg(map_name)
        .stdin(passphrase)
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to open encrypted device '{}' as '{}'",
                device.as_ref().display(),
                map_name
            )
        })
}

pub fn luks_close(map_name: &str) -> Result<(), Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("close")
        .arg(map_name)
        .run_and_check()
        .with_context(|| format!("Failed to close encrypted volume '{map_name}'"))
}

pub fn luks_uuid(device: impl AsRef<Path>) -> Result<String, Error> {
    Dependency::Cryptsetup
        .cmd()
        .arg("luksUUID")
        .arg(device.as_ref())
        .output_and_check()
        .map(|uuid| uuid.trim().to_string())
        .with_context(|| format!("Failed to read LUKS uuid of '{}'", device.as_ref().display()))
}
