use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Resizes an ext2/3/4 filesystem to `size_kib` kibibytes.
pub fn run(device: impl AsRef<Path>, size_kib: u64) -> Result<(), Error> {
    Dependency::Resize2fs
        .cmd()
        .arg(device.as_ref())
        .arg(format!("{size_kib}K"))
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to resize filesystem on '{}'",
                device.as_ref().display()
            )
        })
}
