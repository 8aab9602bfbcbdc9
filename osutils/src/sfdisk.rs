use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::debug;
use serde::Deserialize;

use devgraph_api::error::DiskLabelCommitError;

use crate::dependencies::{Dependency, DependencyError};

#[derive(Debug, PartialEq, Deserialize)]
struct SfdiskOutput {
    partitiontable: SfDisk,
}

#[derive(Debug, PartialEq, Deserialize)]
pub struct SfDisk {
    /// Disk label type, `gpt` or `dos`
    pub label: String,

    /// Disk device path
    pub device: PathBuf,

    /// First usable LBA, absent on dos labels
    #[serde(default)]
    pub firstlba: u64,

    /// Last usable LBA, absent on dos labels
    #[serde(default)]
    pub lastlba: u64,

    /// Sector size
    #[serde(default = "SfDisk::default_sectorsize")]
    pub sectorsize: u64,

    /// List of partitions
    #[serde(default)]
    pub partitions: Vec<SfPartition>,
}

#[derive(Debug, PartialEq, Eq, Deserialize, Clone)]
pub struct SfPartition {
    /// Partition device path
    pub node: PathBuf,

    /// Partition start offset in sectors
    pub start: u64,

    /// Partition size in sectors
    #[serde(rename = "size")]
    pub size_sectors: u64,

    /// Partition type, a GUID on gpt or a hex id on dos
    #[serde(rename = "type")]
    pub partition_type: String,

    #[serde(default)]
    pub bootable: bool,

    /// Partition number in the partition table
    #[serde(skip)]
    pub number: u32,
}

impl SfDisk {
    fn default_sectorsize() -> u64 {
        512
    }

    pub fn get_info<S>(disk_path: S) -> Result<Self, Error>
    where
        S: AsRef<Path>,
    {
        let sfdisk_output_json = Dependency::Sfdisk
            .cmd()
            .arg("-J")
            .arg(disk_path.as_ref())
            .output_and_check()
            .context(format!(
                "Failed to fetch disk information for {}",
                disk_path.as_ref().display()
            ))?;

        SfDisk::parse_sfdisk_output(&sfdisk_output_json).context(format!(
            "Failed to extract disk information for {}",
            disk_path.as_ref().display()
        ))
    }

    fn parse_sfdisk_output(output: &str) -> Result<Self, Error> {
        let mut disk = serde_json::from_str::<SfdiskOutput>(output)
            .context("Failed to parse disk information")?
            .partitiontable;

        disk.partitions.iter_mut().try_for_each(|part| {
            part.number = part
                .node
                .as_os_str()
                .to_string_lossy()
                .rsplit_once(|c: char| !c.is_ascii_digit())
                .map(|(_, n)| n)
                .context(format!(
                    "Failed to extract partition number from {}",
                    part.node.display()
                ))?
                .parse()
                .context(format!(
                    "Failed to parse partition number from {}",
                    part.node.display()
                ))?;
            Ok::<(), Error>(())
        })?;

        Ok(disk)
    }

    pub fn partition(&self, number: u32) -> Option<&SfPartition> {
        self.partitions.iter().find(|p| p.number == number)
    }
}

/// Turns a failure caused by the kernel refusing to reread a partition
/// table in use into a [`DiskLabelCommitError`].
fn commit_error(disk: &Path, error: Box<DependencyError>) -> Error {
    if error.stderr().contains("busy") {
        let disk = disk
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        return Error::new(*error).context(DiskLabelCommitError { disk });
    }
    Error::new(*error)
}

/// Asks the kernel to pick up the partition table of `disk`.
fn reread(disk: &Path) -> Result<(), Error> {
    Dependency::Partx
        .cmd()
        .arg("--update")
        .arg(disk)
        .run_and_check()
        .map_err(|e| commit_error(disk, e))
        .with_context(|| format!("Failed to reread partition table of '{}'", disk.display()))
}

/// Writes an empty partition table of type `label` (`gpt`, `dos`).
pub fn create_label(disk: impl AsRef<Path>, label: &str) -> Result<(), Error> {
    let disk = disk.as_ref();
    debug!("Writing empty {label} label to '{}'", disk.display());
    Dependency::Sfdisk
        .cmd()
        .arg("--no-reread")
        .arg("--wipe")
        .arg("always")
        .arg(disk)
        .stdin(format!("label: {label}\n"))
        .run_and_check()
        .map_err(|e| commit_error(disk, e))
        .with_context(|| format!("Failed to create disklabel on '{}'", disk.display()))?;
    reread(disk)
}

/// A partition to be appended to a disklabel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPartition<'a> {
    pub number: u32,
    /// Start sector, None lets sfdisk pick the first free one.
    pub start: Option<u64>,
    pub size_sectors: u64,
    pub partition_type: &'a str,
    pub bootable: bool,
}

impl NewPartition<'_> {
    fn script_line(&self) -> String {
        let mut line = String::new();
        if let Some(start) = self.start {
            line += &format!("start={start}, ");
        }
        line += &format!("size={}, type={}", self.size_sectors, self.partition_type);
        if self.bootable {
            line += ", bootable";
        }
        line + "\n"
    }
}

pub fn add_partition(disk: impl AsRef<Path>, partition: &NewPartition) -> Result<(), Error> {
    let disk = disk.as_ref();
    Dependency::Sfdisk
        .cmd()
        .arg("--no-reread")
        .arg("-N")
        .arg(partition.number.to_string())
        .arg(disk)
        .stdin(partition.script_line())
        .run_and_check()
        .map_err(|e| commit_error(disk, e))
        .with_context(|| {
            format!(
                "Failed to add partition {} to '{}'",
                partition.number,
                disk.display()
            )
        })?;
    reread(disk)
}

pub fn delete_partition(disk: impl AsRef<Path>, number: u32) -> Result<(), Error> {
    let disk = disk.as_ref();
    Dependency::Sfdisk
        .cmd()
        .arg("--no-reread")
        .arg("--delete")
        .arg(disk)
        .arg(number.to_string())
        .run_and_check()
        .map_err(|e| commit_error(disk, e))
        .with_context(|| {
            format!(
                "Failed to delete partition {number} from '{}'",
                disk.display()
            )
        })?;
    reread(disk)
}

/// Changes the size of partition `number`, keeping its start.
pub fn resize_partition(disk: impl AsRef<Path>, number: u32, size_sectors: u64) -> Result<(), Error> {
    let disk = disk.as_ref();
    Dependency::Sfdisk
        .cmd()
        .arg("--no-reread")
        .arg("-N")
        .arg(number.to_string())
        .arg(disk)
        .stdin(format!(", {size_sectors}\n"))
        .run_and_check()
        .map_err(|e| commit_error(disk, e))
        .with_context(|| {
            format!(
                "Failed to resize partition {number} on '{}'",
                disk.display()
            )
        })?;
    reread(disk)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sfdisk_output() {
        let output = indoc::indoc! {r#"
            {
               "partitiontable": {
                  "label": "dos",
                  "id": "0x6a2f1b5e",
                  "device": "/dev/sda",
                  "unit": "sectors",
                  "sectorsize": 512,
                  "partitions": [
                     {"node": "/dev/sda1", "start": 2048, "size": 1024000, "type": "83", "bootable": true},
                     {"node": "/dev/sda2", "start": 1026048, "size": 4096000, "type": "5"},
                     {"node": "/dev/sda5", "start": 1028096, "size": 2048000, "type": "8e"}
                  ]
               }
            }
        "#};

        let disk = SfDisk::parse_sfdisk_output(output).unwrap();
        assert_eq!(disk.label, "dos");
        assert_eq!(disk.device, PathBuf::from("/dev/sda"));
        assert_eq!(disk.partitions.len(), 3);
        assert!(disk.partitions[0].bootable);
        assert_eq!(disk.partition(5).unwrap().partition_type, "8e");
        assert_eq!(disk.partition(2).unwrap().size_sectors, 4096000);
        assert!(disk.partition(3).is_none());

        assert!(SfDisk::parse_sfdisk_output("{}").is_err());
    }

    #[test]
    fn test_script_line() {
        let partition = NewPartition {
            number: 1,
            start: Some(2048),
            size_sectors: 1024000,
            partition_type: "83",
            bootable: true,
        };
        assert_eq!(
            partition.script_line(),
            "start=2048, size=1024000, type=83, bootable\n"
        );

        let partition = NewPartition {
            start: None,
            bootable: false,
            ..partition
        };
        assert_eq!(partition.script_line(), "size=1024000, type=83\n");
    }
}
