use std::path::PathBuf;

use anyhow::{Context, Error};
use log::debug;

use crate::dependencies::Dependency;

/// A firmware RAID member as reported by `dmraid -r`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidMember {
    pub device: PathBuf,
    /// Metadata format, e.g. `isw` or `nvidia`.
    pub format: String,
    pub set: String,
}

/// Activates the named RAID set.
pub fn activate(set: &str) -> Result<(), Error> {
    debug!("Activating firmware RAID set '{set}'");
    Dependency::Dmraid
        .cmd()
        .arg("-ay")
        .arg("-Z")
        .arg(set)
        .run_and_check()
        .with_context(|| format!("Failed to activate RAID set '{set}'"))
}

pub fn deactivate(set: &str) -> Result<(), Error> {
    Dependency::Dmraid
        .cmd()
        .arg("-an")
        .arg(set)
        .run_and_check()
        .with_context(|| format!("Failed to deactivate RAID set '{set}'"))
}

/// Lists every firmware RAID member. No members is not an error.
pub fn members() -> Result<Vec<RaidMember>, Error> {
    let output = Dependency::Dmraid
        .cmd()
        .arg("-r")
        .arg("-c")
        .arg("-c")
        .arg("-c")
        .output()
        .context("Failed to list RAID members")?;

    // dmraid exits non-zero when it finds no members
    if !output.success() {
        return Ok(Vec::new());
    }

    Ok(parse_members(&output.output()))
}

/// Parses colon separated `device:format:set:...` lines.
fn parse_members(output: &str) -> Vec<RaidMember> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().split(':');
            let device = fields.next().filter(|d| d.starts_with('/'))?;
            let format = fields.next()?;
            let set = fields.next().filter(|s| !s.is_empty())?;
            Some(RaidMember {
                device: device.into(),
                format: format.into(),
                set: set.into(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_members() {
        let output = indoc::indoc! {"
            /dev/sdb:isw:isw_cdjaedghjj_Volume0:GROUP:ok:976773166:0
            /dev/sdc:isw:isw_cdjaedghjj_Volume0:GROUP:ok:976773166:0
            no raid disks
        "};

        let members = parse_members(output);
        assert_eq!(members.len(), 2);
        assert_eq!(
            members[0],
            RaidMember {
                device: PathBuf::from("/dev/sdb"),
                format: "isw".into(),
                set: "isw_cdjaedghjj_Volume0".into(),
            }
        );
        assert!(parse_members("").is_empty());
    }
}
