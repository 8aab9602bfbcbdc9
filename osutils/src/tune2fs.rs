use std::path::Path;

use anyhow::{bail, Context, Error};

use crate::dependencies::Dependency;

/// Converts an ext filesystem in place to the next generation: ext2 gains
/// a journal, ext3 gains the ext4 on-disk features.
pub fn migrate(device: impl AsRef<Path>, from: &str) -> Result<(), Error> {
    let mut cmd = Dependency::Tune2fs.cmd();
    match from {
        "ext2" => cmd.arg("-j"),
        "ext3" => cmd.arg("-O").arg("extents,uninit_bg,dir_index"),
        _ => bail!("Cannot migrate {from} filesystem"),
    };
    cmd.arg(device.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to migrate {from} filesystem on '{}'",
                device.as_ref().display()
            )
        })
}
