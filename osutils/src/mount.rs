use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

const PROC_MOUNTS: &str = "/proc/mounts";

pub fn mount(
    device: impl AsRef<Path>,
    mount_point: impl AsRef<Path>,
    filesystem: &str,
    options: &[String],
) -> Result<(), Error> {
    let mut cmd = Dependency::Mount.cmd();
    cmd.arg("--types").arg(filesystem);
    if !options.is_empty() {
        cmd.arg("--options").arg(options.join(","));
    }
    cmd.arg(device.as_ref())
        .arg(mount_point.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to mount '{}' at '{}'",
                device.as_ref().display(),
                mount_point.as_ref().display()
            )
        })
}

pub fn umount(target: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Umount
        .cmd()
        .arg(target.as_ref())
        .run_and_check()
        .with_context(|| format!("Failed to unmount '{}'", target.as_ref().display()))
}

/// Mount points of `device`, in mount order.
pub fn mount_points(device: impl AsRef<Path>) -> Result<Vec<PathBuf>, Error> {
    let contents = std::fs::read_to_string(PROC_MOUNTS)
        .with_context(|| format!("Failed to read '{PROC_MOUNTS}'"))?;
    Ok(parse_mount_points(&contents, device.as_ref()))
}

fn parse_mount_points(contents: &str, device: &Path) -> Vec<PathBuf> {
    contents
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            (Path::new(source) == device).then(|| PathBuf::from(target.replace("\\040", " ")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount_points() {
        let contents = indoc::indoc! {r"
            proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
            /dev/sda2 / ext4 rw,relatime 0 0
            /dev/sda1 /boot/efi vfat rw,relatime 0 0
            /dev/sda2 /mnt/with\040space ext4 rw,relatime 0 0
        "};
        assert_eq!(
            parse_mount_points(contents, Path::new("/dev/sda2")),
            vec![PathBuf::from("/"), PathBuf::from("/mnt/with space")]
        );
        assert!(parse_mount_points(contents, Path::new("/dev/sdb")).is_empty());
    }
}
