use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

const PROC_SWAPS: &str = "/proc/swaps";

/// Creates a swap space on the specified device path.
pub fn mkswap(device_path: impl AsRef<Path>, label: Option<&str>) -> Result<(), Error> {
    let mut cmd = Dependency::Mkswap.cmd();
    cmd.arg("--verbose");
    if let Some(label) = label {
        cmd.arg("--label").arg(label);
    }
    cmd.arg(device_path.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to execute mkswap on '{}'",
                device_path.as_ref().display()
            )
        })
}

pub fn swapon(device_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Swapon
        .cmd()
        .arg(device_path.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to execute swapon on '{}'",
                device_path.as_ref().display()
            )
        })
}

pub fn swapoff(device_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Swapoff
        .cmd()
        .arg(device_path.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to execute swapoff on '{}'",
                device_path.as_ref().display()
            )
        })
}

/// Devices currently used as swap.
pub fn active() -> Result<Vec<PathBuf>, Error> {
    let contents = std::fs::read_to_string(PROC_SWAPS)
        .with_context(|| format!("Failed to read '{PROC_SWAPS}'"))?;
    Ok(parse_proc_swaps(&contents))
}

fn parse_proc_swaps(contents: &str) -> Vec<PathBuf> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(PathBuf::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_proc_swaps() {
        let contents = indoc::indoc! {"
            Filename				Type		Size		Used		Priority
            /dev/sda3                               partition	2097148		0		-2
            /dev/dm-1                               partition	4194300		0		-3
        "};
        assert_eq!(
            parse_proc_swaps(contents),
            vec![PathBuf::from("/dev/sda3"), PathBuf::from("/dev/dm-1")]
        );
        assert!(parse_proc_swaps("Filename Type Size Used Priority\n").is_empty());
    }
}
