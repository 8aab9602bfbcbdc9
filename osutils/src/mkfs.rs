use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

pub fn run(
    device_path: &Path,
    filesystem: &str,
    label: Option<&str>,
    options: &[String],
) -> Result<(), Error> {
    let mut cmd = Dependency::Mkfs.cmd();
    cmd.arg("--type").arg(filesystem);
    if let Some(label) = label {
        // vfat takes -n, everything else -L
        cmd.arg(if filesystem == "vfat" { "-n" } else { "-L" })
            .arg(label);
    }
    cmd.args(options).arg(device_path);

    cmd.run_and_check().with_context(|| {
        format!(
            "Failed to create {filesystem} filesystem on '{}'",
            device_path.display()
        )
    })
}
