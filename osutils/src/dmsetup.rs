use std::path::Path;

use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// State of a device-mapper map as reported by `dmsetup info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapState {
    /// A live table is loaded.
    pub live: bool,
    pub suspended: bool,
}

/// Creates a linear map of `sectors` 512-byte sectors over `backing`.
pub fn create_linear(
    name: &str,
    backing: impl AsRef<Path>,
    sectors: u64,
    uuid: Option<&str>,
) -> Result<(), Error> {
    let mut cmd = Dependency::Dmsetup.cmd();
    cmd.arg("create").arg(name);
    if let Some(uuid) = uuid {
        cmd.arg("--uuid").arg(uuid);
    }
    cmd.arg("--table")
        .arg(format!(
            "0 {sectors} linear {} 0",
            backing.as_ref().display()
        ))
        .run_and_check()
        .with_context(|| format!("Failed to create linear map '{name}'"))
}

pub fn remove(name: &str) -> Result<(), Error> {
    Dependency::Dmsetup
        .cmd()
        .arg("remove")
        .arg(name)
        .run_and_check()
        .with_context(|| format!("Failed to remove map '{name}'"))
}

/// Returns None when no map with this name exists.
pub fn state(name: &str) -> Result<Option<MapState>, Error> {
    let output = Dependency::Dmsetup
        .cmd()
        .arg("info")
        .arg("--columns")
        .arg("--noheadings")
        .arg("--options")
        .arg("attr")
        .arg(name)
        .output()
        .with_context(|| format!("Failed to query map '{name}'"))?;

    if !output.success() {
        return Ok(None);
    }

    Ok(parse_attr(output.output().trim()))
}

/// Parses the `attr` column, e.g. `L--w` or `Ls-w`.
fn parse_attr(attr: &str) -> Option<MapState> {
    let mut chars = attr.chars();
    let live = chars.next()? == 'L';
    let suspended = chars.next()? == 's';
    Some(MapState { live, suspended })
}

/// Creates maps for the partitions found on `device`.
pub fn kpartx_add(device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Kpartx
        .cmd()
        .arg("-a")
        .arg("-s")
        .arg(device.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to map partitions of '{}'",
                device.as_ref().display()
            )
        })
}

pub fn kpartx_delete(device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Kpartx
        .cmd()
        .arg("-d")
        .arg(device.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to unmap partitions of '{}'",
                device.as_ref().display()
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attr() {
        assert_eq!(
            parse_attr("L--w"),
            Some(MapState {
                live: true,
                suspended: false
            })
        );
        assert_eq!(
            parse_attr("Ls-w"),
            Some(MapState {
                live: true,
                suspended: true
            })
        );
        assert_eq!(
            parse_attr("-I-w"),
            Some(MapState {
                live: false,
                suspended: false
            })
        );
        assert_eq!(parse_attr(""), None);
    }
}
