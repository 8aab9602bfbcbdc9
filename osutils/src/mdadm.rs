use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;

use crate::dependencies::Dependency;

/// Parameters of a new array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions<'a> {
    /// Level as mdadm spells it, e.g. `raid1` or `container`.
    pub level: &'a str,
    pub members: &'a [PathBuf],
    pub spares: usize,
    pub metadata: &'a str,
    pub bitmap: bool,
}

pub fn create(raid_path: impl AsRef<Path>, options: &CreateOptions) -> Result<(), Error> {
    let raid_path = raid_path.as_ref();
    info!("Creating RAID array '{}'", raid_path.display());

    let active = options.members.len().saturating_sub(options.spares);
    let mut cmd = Dependency::Mdadm.cmd();
    cmd.arg("--create")
        .arg(raid_path)
        .arg("--run")
        .arg(format!("--level={}", options.level))
        .arg(format!("--raid-devices={active}"))
        .arg(format!("--metadata={}", options.metadata));
    if options.spares > 0 {
        cmd.arg(format!("--spare-devices={}", options.spares));
    }
    if options.bitmap {
        cmd.arg("--bitmap=internal");
    }
    cmd.args(options.members)
        .run_and_check()
        .with_context(|| format!("Failed to create RAID array '{}'", raid_path.display()))
}

/// Assembles an existing array from its members.
pub fn assemble(raid_path: impl AsRef<Path>, uuid: &str, members: &[PathBuf]) -> Result<(), Error> {
    let raid_path = raid_path.as_ref();
    debug!("Assembling RAID array '{}'", raid_path.display());

    Dependency::Mdadm
        .cmd()
        .arg("--assemble")
        .arg(raid_path)
        .arg(format!("--uuid={uuid}"))
        .arg("--run")
        .args(members)
        .run_and_check()
        .with_context(|| format!("Failed to assemble RAID array '{}'", raid_path.display()))
}

pub fn stop(raid_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Mdadm
        .cmd()
        .arg("--stop")
        .arg(raid_path.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to stop RAID array {}",
                raid_path.as_ref().display()
            )
        })
}

/// Erases the md superblock of a former member.
pub fn zero_superblock(device: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Mdadm
        .cmd()
        .arg("--zero-superblock")
        .arg(device.as_ref())
        .run_and_check()
        .with_context(|| {
            format!(
                "Failed to erase RAID superblock of '{}'",
                device.as_ref().display()
            )
        })
}

/// Member metadata as reported by `mdadm --examine --export`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub uuid: Option<String>,
    pub level: Option<String>,
    pub devices: Option<u32>,
    pub name: Option<String>,
}

pub fn examine(device: impl AsRef<Path>) -> Result<MemberInfo, Error> {
    let output = Dependency::Mdadm
        .cmd()
        .arg("--examine")
        .arg("--export")
        .arg(device.as_ref())
        .output_and_check()
        .with_context(|| {
            format!(
                "Failed to examine RAID member '{}'",
                device.as_ref().display()
            )
        })?;

    let vars = parse_export(&output);
    Ok(MemberInfo {
        uuid: vars.get("MD_UUID").cloned(),
        level: vars.get("MD_LEVEL").cloned(),
        devices: vars.get("MD_DEVICES").and_then(|d| d.parse().ok()),
        name: vars.get("MD_NAME").cloned(),
    })
}

/// Parses `KEY=value` lines.
fn parse_export(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

/// An assembled array as listed by `mdadm --detail --scan`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ArrayDetail {
    pub raid_path: PathBuf,
    pub uuid: String,
    pub level: Option<String>,
}

pub fn details() -> Result<Vec<ArrayDetail>, Error> {
    let output = Dependency::Mdadm
        .cmd()
        .arg("--detail")
        .arg("--scan")
        .output_and_check()
        .context("Failed to run mdadm detail")?;

    Ok(parse_detail_scan(&output))
}

lazy_static! {
    static ref ARRAY_REGEX: Regex = Regex::new(r"^ARRAY\s+(\S+)").unwrap();
    static ref LEVEL_REGEX: Regex = Regex::new(r"(?:^|\s)level=(\w+)").unwrap();
    static ref UUID_REGEX: Regex = Regex::new(r"(?:^|\s)UUID=([\da-zA-Z:]+)").unwrap();
}

fn parse_detail_scan(output: &str) -> Vec<ArrayDetail> {
    output
        .lines()
        .filter_map(|line| {
            let raid_path = ARRAY_REGEX.captures(line)?.get(1)?.as_str();
            let uuid = UUID_REGEX.captures(line)?.get(1)?.as_str();
            Some(ArrayDetail {
                raid_path: raid_path.into(),
                uuid: uuid.into(),
                level: LEVEL_REGEX
                    .captures(line)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}
