use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::{MDADM_CONF_PATH, MULTIPATH_BINDINGS_PATH, MULTIPATH_CONF_PATH};

/// Settings that steer device tree population.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScanConfig {
    /// Only these disks (and what is built on them) are used. An empty list
    /// allows every disk.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusive_disks: Vec<String>,

    /// Disks that are never used.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_disks: Vec<String>,

    /// Disks the caller intends to clear. When non-empty, only these disks
    /// are candidates for disklabel reinitialization.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clear_part_disks: Vec<String>,

    /// Devices that must never be modified, as names, `/dev` paths,
    /// `UUID=` or `LABEL=` specs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub protected_dev_specs: Vec<String>,

    /// Answer yes to every initialization question without asking.
    #[serde(default)]
    pub zero_mbr: bool,

    /// Put a fresh disklabel on every scanned disk.
    #[serde(default)]
    pub reinitialize_disks: bool,

    /// Disk image files exposed as disks, keyed by the disk name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub disk_images: BTreeMap<String, PathBuf>,

    /// Known LUKS passphrases keyed by LUKS uuid.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub luks_passphrases: BTreeMap<String, String>,

    #[serde(default = "default_mdadm_conf_path")]
    pub mdadm_conf_path: PathBuf,

    #[serde(default = "default_multipath_conf_path")]
    pub multipath_conf_path: PathBuf,

    #[serde(default = "default_multipath_bindings_path")]
    pub multipath_bindings_path: PathBuf,
}

fn default_mdadm_conf_path() -> PathBuf {
    MDADM_CONF_PATH.into()
}

fn default_multipath_conf_path() -> PathBuf {
    MULTIPATH_CONF_PATH.into()
}

fn default_multipath_bindings_path() -> PathBuf {
    MULTIPATH_BINDINGS_PATH.into()
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclusive_disks: Vec::new(),
            ignored_disks: Vec::new(),
            clear_part_disks: Vec::new(),
            protected_dev_specs: Vec::new(),
            zero_mbr: false,
            reinitialize_disks: false,
            disk_images: BTreeMap::new(),
            luks_passphrases: BTreeMap::new(),
            mdadm_conf_path: default_mdadm_conf_path(),
            multipath_conf_path: default_multipath_conf_path(),
            multipath_bindings_path: default_multipath_bindings_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use maplit::btreemap;

    use super::*;

    #[test]
    fn test_parse_config() {
        let config: ScanConfig = serde_yaml::from_str(indoc! {r#"
            exclusiveDisks: [sda, mpatha]
            ignoredDisks: [sdz]
            protectedDevSpecs: ["LABEL=install"]
            zeroMbr: true
            diskImages:
              image0: /var/tmp/image0.img
            luksPassphrases:
              1234-abcd: secret
        "#})
        .unwrap();

        assert_eq!(config.exclusive_disks, vec!["sda", "mpatha"]);
        assert_eq!(config.ignored_disks, vec!["sdz"]);
        assert!(config.zero_mbr);
        assert!(!config.reinitialize_disks);
        assert_eq!(
            config.disk_images,
            btreemap! { "image0".to_string() => PathBuf::from("/var/tmp/image0.img") }
        );
        assert_eq!(config.luks_passphrases["1234-abcd"], "secret");
        assert_eq!(config.mdadm_conf_path, PathBuf::from("/etc/mdadm.conf"));
        assert_eq!(
            config.multipath_conf_path,
            PathBuf::from("/etc/multipath.conf")
        );
    }

    #[test]
    fn test_empty_config_is_default() {
        let config: ScanConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, ScanConfig::default());
        assert!(serde_yaml::from_str::<ScanConfig>("clearPart: [sda]").is_err());
    }
}
