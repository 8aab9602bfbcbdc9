use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize};

use crate::dependencies::{Command, Dependency};

/// Runs LVM commands with a device filter rejecting devices that must stay
/// invisible to LVM (ignored disks and members of inconsistent groups).
#[derive(Debug, Default, Clone)]
pub struct Lvm {
    rejected: Vec<String>,
}

impl Lvm {
    /// Hides the device from every subsequent LVM command.
    pub fn reject(&mut self, device_name: &str) {
        let pattern = format!("r|/{device_name}$|");
        if !self.rejected.contains(&pattern) {
            debug!("Adding '{device_name}' to the LVM reject filter");
            self.rejected.push(pattern);
        }
    }

    pub fn rejected(&self) -> &[String] {
        &self.rejected
    }

    /// Value for `--config`, None when nothing is rejected.
    pub fn config_arg(&self) -> Option<String> {
        if self.rejected.is_empty() {
            return None;
        }
        let filter = self
            .rejected
            .iter()
            .map(|p| format!("\"{p}\""))
            .collect::<Vec<_>>()
            .join(",");
        Some(format!("devices {{ filter=[{filter}] }}"))
    }

    fn cmd(&self, subcommand: &str) -> Command {
        let mut cmd = Dependency::Lvm.cmd();
        cmd.arg(subcommand);
        if let Some(config) = self.config_arg() {
            cmd.arg("--config").arg(config);
        }
        cmd
    }

    pub fn pvcreate(&self, device: &Path) -> Result<(), Error> {
        self.cmd("pvcreate")
            .arg("--force")
            .arg("--yes")
            .arg(device)
            .run_and_check()
            .with_context(|| format!("Failed to create PV on '{}'", device.display()))
    }

    pub fn pvremove(&self, device: &Path) -> Result<(), Error> {
        self.cmd("pvremove")
            .arg("--force")
            .arg("--force")
            .arg("--yes")
            .arg(device)
            .run_and_check()
            .with_context(|| format!("Failed to remove PV from '{}'", device.display()))
    }

    pub fn vgcreate(&self, name: &str, pe_size_kib: u64, pvs: &[PathBuf]) -> Result<(), Error> {
        self.cmd("vgcreate")
            .arg("--physicalextentsize")
            .arg(format!("{pe_size_kib}k"))
            .arg(name)
            .args(pvs)
            .run_and_check()
            .with_context(|| format!("Failed to create volume group '{name}'"))
    }

    pub fn vgremove(&self, name: &str) -> Result<(), Error> {
        self.cmd("vgremove")
            .arg("--force")
            .arg(name)
            .run_and_check()
            .with_context(|| format!("Failed to remove volume group '{name}'"))
    }

    /// Removes missing PVs from the group metadata.
    pub fn vgreduce_missing(&self, name: &str) -> Result<(), Error> {
        self.cmd("vgreduce")
            .arg("--removemissing")
            .arg("--force")
            .arg(name)
            .run_and_check()
            .with_context(|| format!("Failed to reduce volume group '{name}'"))
    }

    pub fn vgreduce(&self, name: &str, pv: &Path) -> Result<(), Error> {
        self.cmd("vgreduce")
            .arg(name)
            .arg(pv)
            .run_and_check()
            .with_context(|| {
                format!(
                    "Failed to remove '{}' from volume group '{name}'",
                    pv.display()
                )
            })
    }

    pub fn vgchange(&self, name: &str, active: bool) -> Result<(), Error> {
        self.cmd("vgchange")
            .arg(if active { "-ay" } else { "-an" })
            .arg(name)
            .run_and_check()
            .with_context(|| format!("Failed to change activation of volume group '{name}'"))
    }

    pub fn lvcreate(&self, vg: &str, lv: &str, size_kib: u64, pvs: &[PathBuf]) -> Result<(), Error> {
        self.cmd("lvcreate")
            .arg("--name")
            .arg(lv)
            .arg("--size")
            .arg(format!("{size_kib}k"))
            .arg("--yes")
            .arg(vg)
            .args(pvs)
            .run_and_check()
            .with_context(|| format!("Failed to create logical volume '{vg}/{lv}'"))
    }

    pub fn lvremove(&self, vg: &str, lv: &str) -> Result<(), Error> {
        self.cmd("lvremove")
            .arg("--force")
            .arg(format!("{vg}/{lv}"))
            .run_and_check()
            .with_context(|| format!("Failed to remove logical volume '{vg}/{lv}'"))
    }

    pub fn lvresize(&self, vg: &str, lv: &str, size_kib: u64) -> Result<(), Error> {
        self.cmd("lvresize")
            .arg("--force")
            .arg("--size")
            .arg(format!("{size_kib}k"))
            .arg(format!("{vg}/{lv}"))
            .run_and_check()
            .with_context(|| format!("Failed to resize logical volume '{vg}/{lv}'"))
    }

    pub fn lvchange(&self, vg: &str, lv: &str, active: bool) -> Result<(), Error> {
        self.cmd("lvchange")
            .arg(if active { "-ay" } else { "-an" })
            .arg(format!("{vg}/{lv}"))
            .run_and_check()
            .with_context(|| format!("Failed to change activation of '{vg}/{lv}'"))
    }

    /// Free bytes per physical volume of the group.
    pub fn pv_free(&self, vg: &str) -> Result<Vec<(PathBuf, u64)>, Error> {
        let output = self
            .report("pvs", "pv_name,pv_free")
            .arg("--select")
            .arg(format!("vg_name={vg}"))
            .output_and_check()
            .with_context(|| format!("Failed to list PVs of '{vg}'"))?;

        parse_report::<PvFreeRow>(&output)?
            .into_iter()
            .map(|row| Ok((PathBuf::from(row.pv_name), parse_number(&row.pv_free)?)))
            .collect()
    }

    /// Volume group metadata seen through the PV on `device`. None when the
    /// device is not a PV.
    pub fn pv_info(&self, device: &Path) -> Result<Option<PvInfo>, Error> {
        let output = self
            .report(
                "pvs",
                "pv_name,vg_name,vg_uuid,pe_start,vg_extent_size,pv_count,vg_size,vg_free,vg_extent_count,vg_free_count",
            )
            .arg(device)
            .output()
            .with_context(|| format!("Failed to query PV '{}'", device.display()))?;
        if !output.success() {
            return Ok(None);
        }

        parse_report::<PvInfoRow>(&output.output())?
            .into_iter()
            .next()
            .filter(|row| !row.vg_name.is_empty())
            .map(PvInfo::try_from)
            .transpose()
    }

    /// Every logical volume of `vg`, internal volumes included.
    pub fn lvs(&self, vg: &str) -> Result<Vec<LvRow>, Error> {
        let output = self
            .report("lvs", "lv_name,lv_uuid,lv_size,lv_attr,origin")
            .arg("--all")
            .arg(vg)
            .output_and_check()
            .with_context(|| format!("Failed to list logical volumes of '{vg}'"))?;

        parse_report::<LvReportRow>(&output)?
            .into_iter()
            .map(|row| {
                Ok(LvRow {
                    size: parse_number(&row.lv_size)?,
                    name: row.lv_name,
                    uuid: row.lv_uuid,
                    attr: row.lv_attr,
                    origin: Some(row.origin).filter(|o| !o.is_empty()),
                })
            })
            .collect()
    }

    fn report(&self, subcommand: &str, columns: &str) -> Command {
        let mut cmd = self.cmd(subcommand);
        cmd.arg("--reportformat")
            .arg("json")
            .arg("--units")
            .arg("b")
            .arg("--nosuffix")
            .arg("--options")
            .arg(columns);
        cmd
    }
}

/// A PV together with the metadata of its volume group, sizes in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvInfo {
    pub vg_name: String,
    pub vg_uuid: String,
    pub pe_start: u64,
    pub extent_size: u64,
    pub pv_count: u32,
    pub vg_size: u64,
    pub vg_free: u64,
    pub extent_count: u64,
    pub free_extents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LvRow {
    pub name: String,
    pub uuid: String,
    pub size: u64,
    pub attr: String,
    pub origin: Option<String>,
}

#[derive(Deserialize)]
struct Report<T> {
    report: Vec<ReportSection<T>>,
}

#[derive(Deserialize)]
struct ReportSection<T> {
    #[serde(default = "Vec::new", alias = "pv", alias = "lv")]
    rows: Vec<T>,
}

#[derive(Deserialize)]
struct PvFreeRow {
    pv_name: String,
    pv_free: String,
}

#[derive(Deserialize)]
struct PvInfoRow {
    vg_name: String,
    vg_uuid: String,
    pe_start: String,
    vg_extent_size: String,
    pv_count: String,
    vg_size: String,
    vg_free: String,
    vg_extent_count: String,
    vg_free_count: String,
}

impl TryFrom<PvInfoRow> for PvInfo {
    type Error = Error;

    fn try_from(row: PvInfoRow) -> Result<Self, Error> {
        Ok(PvInfo {
            pe_start: parse_number(&row.pe_start)?,
            extent_size: parse_number(&row.vg_extent_size)?,
            pv_count: row
                .pv_count
                .trim()
                .parse()
                .with_context(|| format!("Invalid pv_count '{}'", row.pv_count))?,
            vg_size: parse_number(&row.vg_size)?,
            vg_free: parse_number(&row.vg_free)?,
            extent_count: parse_number(&row.vg_extent_count)?,
            free_extents: parse_number(&row.vg_free_count)?,
            vg_name: row.vg_name,
            vg_uuid: row.vg_uuid,
        })
    }
}

#[derive(Deserialize)]
struct LvReportRow {
    lv_name: String,
    lv_uuid: String,
    lv_size: String,
    lv_attr: String,
    #[serde(default)]
    origin: String,
}

fn parse_number(value: &str) -> Result<u64, Error> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid number '{value}' in LVM report"))
}

fn parse_report<T: DeserializeOwned>(output: &str) -> Result<Vec<T>, Error> {
    let report: Report<T> = serde_json::from_str(output).context("Failed to parse LVM report")?;
    Ok(report.report.into_iter().flat_map(|r| r.rows).collect())
}
