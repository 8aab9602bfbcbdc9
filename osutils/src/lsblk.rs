use anyhow::{Context, Error};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::dependencies::Dependency;

const COLUMNS: &str = "NAME,KNAME,TYPE,MAJ:MIN,SIZE,FSTYPE,FSVER,UUID,LABEL,SERIAL,MODEL,VENDOR,PTTYPE,PKNAME,PARTN,TRAN,RO,RM";

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct LsBlkOutput {
    pub blockdevices: Vec<BlockDevice>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct BlockDevice {
    /// Name as shown by lsblk, the map name for device-mapper nodes.
    pub name: String,
    /// Kernel name, e.g. `dm-0`.
    pub kname: String,
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(rename = "maj:min")]
    pub maj_min: String,
    pub size: u64,
    pub fstype: Option<String>,
    pub fsver: Option<String>,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub serial: Option<String>,
    pub model: Option<String>,
    pub vendor: Option<String>,
    pub pttype: Option<String>,
    #[serde(rename = "pkname")]
    pub parent_kernel_name: Option<String>,
    #[serde(rename = "partn")]
    pub partition_number: Option<u32>,
    #[serde(rename = "tran")]
    pub transport: Option<String>,
    #[serde(rename = "ro")]
    pub read_only: bool,
    #[serde(rename = "rm")]
    pub removable: bool,
}

impl BlockDevice {
    /// Major and minor numbers.
    pub fn numbers(&self) -> Option<(u32, u32)> {
        let (major, minor) = self.maj_min.split_once(':')?;
        Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
    }
}

/// Lists every block device, flattened.
pub fn list() -> Result<Vec<BlockDevice>, Error> {
    let result = Dependency::Lsblk
        .cmd()
        .arg("--json")
        .arg("--list")
        .arg("--bytes")
        .arg("--output")
        .arg(COLUMNS)
        .output_and_check()
        .context("Failed execute lsblk")?;

    let parsed = parse_lsblk_output(result.as_str());
    if parsed.is_err() {
        warn!("lsblk output: {}", result);
    }

    parsed
}

fn parse_lsblk_output(output: &str) -> Result<Vec<BlockDevice>, Error> {
    let parsed: LsBlkOutput =
        serde_json::from_str(output).context("Failed to parse lsblk output")?;

    Ok(parsed.blockdevices)
}
