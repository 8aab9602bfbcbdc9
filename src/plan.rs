//! Action requests.
//!
//! A plan file is a YAML list of [`ActionRequest`]s naming devices by the
//! specs [`DeviceTree::resolve_device`] understands. Applying a plan builds
//! the new devices it asks for and queues the matching actions, in the
//! order the requests are listed.

use std::{fs, path::Path};

use log::{debug, info};
use serde::{Deserialize, Serialize};

use devgraph_api::{
    constants::LVM_PE_SIZE,
    error::{DeviceError, InvalidInputError, ReportError, StorageError, StorageResultExt},
    Size,
};

use crate::{
    actions::ActionSpec,
    devices::{
        lvm, md,
        partition::{next_number, partition_name},
        DeviceId, DeviceKind, LogicalVolumeInfo, MdInfo, MdLevel, PartitionInfo,
        VolumeGroupInfo,
    },
    devicetree::DeviceTree,
    formats::{Format, FormatKind},
    system::{BlockLayer, PartitionType},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestedPartitionType {
    #[default]
    Primary,
    Extended,
    Logical,
}

impl From<RequestedPartitionType> for PartitionType {
    fn from(value: RequestedPartitionType) -> Self {
        match value {
            RequestedPartitionType::Primary => PartitionType::Normal,
            RequestedPartitionType::Extended => PartitionType::Extended,
            RequestedPartitionType::Logical => PartitionType::Logical,
        }
    }
}

/// A format to put on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FormatRequest {
    /// Filesystem type, or one of `swap`, `lvmpv`, `mdmember`, `luks`,
    /// `biosboot`, `prepboot`, `efi`.
    #[serde(rename = "type")]
    pub format_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

impl FormatRequest {
    pub fn to_format(&self) -> Format {
        let mut format = match self.format_type.as_str() {
            "swap" => Format::new(FormatKind::Swap),
            "lvmpv" => Format::lvmpv(),
            "mdmember" => Format::mdmember(),
            "luks" => Format::luks(None),
            "biosboot" => Format::new(FormatKind::BiosBoot),
            "prepboot" => Format::new(FormatKind::PrepBoot),
            "efi" => Format::new(FormatKind::Efi),
            fs_type => Format::filesystem(fs_type),
        };
        format.label = self.label.clone();
        format.options = self.options.clone();
        match self.mountpoint {
            Some(ref mountpoint) => format.with_mountpoint(mountpoint),
            None => format,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", deny_unknown_fields)]
pub enum ActionRequest {
    #[serde(rename_all = "camelCase")]
    CreatePartition {
        disk: String,
        size: Size,
        #[serde(default)]
        partition_type: RequestedPartitionType,
        #[serde(default)]
        bootable: bool,
        #[serde(default)]
        grow: bool,
    },

    #[serde(rename_all = "camelCase")]
    CreateVolumeGroup {
        name: String,
        physical_volumes: Vec<String>,
        #[serde(default)]
        pe_size: Option<Size>,
    },

    #[serde(rename_all = "camelCase")]
    CreateLogicalVolume {
        volume_group: String,
        name: String,
        size: Size,
        #[serde(default)]
        single_pv: bool,
    },

    #[serde(rename_all = "camelCase")]
    CreateRaidArray {
        name: String,
        level: String,
        members: Vec<String>,
        #[serde(default)]
        spares: usize,
    },

    /// Formats `device` as LUKS and adds the mapping on top of it.
    #[serde(rename_all = "camelCase")]
    CreateLuks {
        device: String,
        #[serde(default)]
        passphrase: Option<String>,
    },

    DestroyDevice {
        device: String,
    },

    CreateFormat {
        device: String,
        format: FormatRequest,
    },

    DestroyFormat {
        device: String,
    },

    ResizeDevice {
        device: String,
        size: Size,
    },

    ResizeFormat {
        device: String,
        size: Size,
    },

    MigrateFormat {
        device: String,
    },
}

/// Reads a YAML list of action requests.
pub fn load_requests(path: &Path) -> Result<Vec<ActionRequest>, StorageError> {
    let contents = fs::read_to_string(path).structured(InvalidInputError::LoadActions {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&contents).structured(InvalidInputError::ParseActions)
}

/// Queues every request on `tree`. Returns the ids of the registered
/// actions.
pub fn apply<S: BlockLayer>(
    tree: &mut DeviceTree<S>,
    requests: &[ActionRequest],
) -> Result<Vec<u32>, StorageError> {
    let mut ids = Vec::new();
    for (index, request) in requests.iter().enumerate() {
        debug!("Applying request {index}: {request:?}");
        ids.extend(apply_request(tree, request).message(format!("Failed to apply request {index}"))?);
    }
    info!("Queued {} actions from {} requests", ids.len(), requests.len());
    Ok(ids)
}

fn resolve<S: BlockLayer>(tree: &DeviceTree<S>, name: &str) -> Result<DeviceId, StorageError> {
    tree.resolve_device(name)
        .structured(InvalidInputError::UnknownDevice {
            name: name.to_string(),
        })
}

fn apply_request<S: BlockLayer>(
    tree: &mut DeviceTree<S>,
    request: &ActionRequest,
) -> Result<Vec<u32>, StorageError> {
    Ok(match request {
        ActionRequest::CreatePartition {
            disk,
            size,
            partition_type,
            bootable,
            grow,
        } => {
            let disk = resolve(tree, disk)?;
            let partition_type = PartitionType::from(*partition_type);
            let used: Vec<u32> = tree
                .members()
                .iter()
                .filter(|member| tree.devices()[**member].parents.first() == Some(&disk))
                .filter_map(|member| tree.devices()[*member].as_partition())
                .map(|part| part.number)
                .collect();
            let number = next_number(&used, partition_type);
            let info = PartitionInfo {
                number,
                partition_type,
                bootable: *bootable,
            };
            let name = partition_name(&tree.devices()[disk].name, number);
            let devices = tree.devices_mut();
            let id = devices.add_with_parents(name, DeviceKind::Partition(info), vec![disk]);
            devices[id].target_size = *size;
            devices[id].grow = *grow;
            vec![tree.schedule(id, ActionSpec::CreateDevice)?]
        }

        ActionRequest::CreateVolumeGroup {
            name,
            physical_volumes,
            pe_size,
        } => {
            let pvs = physical_volumes
                .iter()
                .map(|pv| resolve(tree, pv))
                .collect::<Result<Vec<_>, _>>()?;
            let devices = tree.devices_mut();
            let vg = devices.add(
                name.clone(),
                DeviceKind::VolumeGroup(VolumeGroupInfo {
                    pe_size: pe_size.unwrap_or(LVM_PE_SIZE),
                    ..Default::default()
                }),
            );
            for pv in pvs {
                lvm::vg_add_pv(devices, vg, pv)?;
            }
            vec![tree.schedule(vg, ActionSpec::CreateDevice)?]
        }

        ActionRequest::CreateLogicalVolume {
            volume_group,
            name,
            size,
            single_pv,
        } => {
            let vg = resolve(tree, volume_group)?;
            let info = LogicalVolumeInfo {
                single_pv: *single_pv,
                ..LogicalVolumeInfo::new(name.clone())
            };
            let lv = lvm::add_logical_volume(tree.devices_mut(), vg, info, *size, false)?;
            vec![tree.schedule(lv, ActionSpec::CreateDevice)?]
        }

        ActionRequest::CreateRaidArray {
            name,
            level,
            members,
            spares,
        } => {
            let level: MdLevel = level.parse().structured(DeviceError::InvalidConfiguration {
                name: name.clone(),
                reason: format!("unknown RAID level '{level}'"),
            })?;
            let members = members
                .iter()
                .map(|member| resolve(tree, member))
                .collect::<Result<Vec<_>, _>>()?;
            let total = members.len();
            let Some(active) = total.checked_sub(*spares).filter(|active| *active > 0) else {
                return Err(StorageError::new(DeviceError::InvalidConfiguration {
                    name: name.clone(),
                    reason: format!("{spares} spares leave no active member"),
                }));
            };
            let array = md::new_array(
                tree.devices_mut(),
                name,
                MdInfo::new(level, active, total),
                members,
                false,
            )?;
            vec![tree.schedule(array, ActionSpec::CreateDevice)?]
        }

        ActionRequest::CreateLuks { device, passphrase } => {
            let device = resolve(tree, device)?;
            let format = tree.schedule(
                device,
                ActionSpec::CreateFormat(Format::luks(passphrase.clone())),
            )?;
            let name = format!("luks-{}", tree.devices()[device].name);
            let mapping = tree
                .devices_mut()
                .add_with_parents(name, DeviceKind::Luks, vec![device]);
            vec![format, tree.schedule(mapping, ActionSpec::CreateDevice)?]
        }

        ActionRequest::DestroyDevice { device } => {
            let device = resolve(tree, device)?;
            vec![tree.schedule(device, ActionSpec::DestroyDevice)?]
        }

        ActionRequest::CreateFormat { device, format } => {
            let device = resolve(tree, device)?;
            vec![tree.schedule(device, ActionSpec::CreateFormat(format.to_format()))?]
        }

        ActionRequest::DestroyFormat { device } => {
            let device = resolve(tree, device)?;
            vec![tree.schedule(device, ActionSpec::DestroyFormat)?]
        }

        ActionRequest::ResizeDevice { device, size } => {
            let device = resolve(tree, device)?;
            vec![tree.schedule(device, ActionSpec::ResizeDevice(*size))?]
        }

        ActionRequest::ResizeFormat { device, size } => {
            let device = resolve(tree, device)?;
            vec![tree.schedule(device, ActionSpec::ResizeFormat(*size))?]
        }

        ActionRequest::MigrateFormat { device } => {
            let device = resolve(tree, device)?;
            vec![tree.schedule(device, ActionSpec::MigrateFormat)?]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use indoc::indoc;

    use devgraph_api::{
        descriptor::{DeviceDescriptor, DiskLabelType},
        error::ErrorKind,
    };

    use crate::testutils::{disk, formatted, partition, populated_tree};

    fn gpt_disk(name: &str) -> DeviceDescriptor {
        let mut desc = disk(name, Size::from_gib(20));
        desc.partition_table = Some(DiskLabelType::Gpt);
        desc
    }

    #[test]
    fn test_parse_requests() {
        let requests: Vec<ActionRequest> = serde_yaml::from_str(indoc! {r#"
            - action: createPartition
              disk: sda
              size: 1G
              bootable: true
            - action: createFormat
              device: sda1
              format:
                type: ext4
                mountpoint: /boot
            - action: createRaidArray
              name: md0
              level: raid1
              members: [sdb1, sdc1]
            - action: resizeFormat
              device: /dev/sdd1
              size: 512M
        "#})
        .unwrap();

        assert_eq!(
            requests[0],
            ActionRequest::CreatePartition {
                disk: "sda".into(),
                size: Size::from_gib(1),
                partition_type: RequestedPartitionType::Primary,
                bootable: true,
                grow: false,
            }
        );
        let ActionRequest::CreateFormat { ref format, .. } = requests[1] else {
            panic!("unexpected request {:?}", requests[1]);
        };
        assert_eq!(format.format_type, "ext4");
        assert_eq!(format.mountpoint.as_deref(), Some("/boot"));
        assert_eq!(
            requests[3],
            ActionRequest::ResizeFormat {
                device: "/dev/sdd1".into(),
                size: Size::from_mib(512),
            }
        );

        serde_yaml::from_str::<Vec<ActionRequest>>(indoc! {r#"
            - action: explode
              device: sda
        "#})
        .unwrap_err();
    }

    #[test]
    fn test_format_request() {
        let request = FormatRequest {
            format_type: "xfs".into(),
            label: Some("data".into()),
            mountpoint: Some("/srv".into()),
            options: vec!["-K".into()],
        };
        let format = request.to_format();
        assert_eq!(format.type_name(), Some("xfs"));
        assert_eq!(format.label.as_deref(), Some("data"));
        assert_eq!(format.mountpoint.as_deref(), Some(Path::new("/srv")));
        assert!(!format.exists);

        let swap = FormatRequest {
            format_type: "swap".into(),
            label: None,
            mountpoint: None,
            options: Vec::new(),
        };
        assert!(swap.to_format().is_swap());
    }

    #[test]
    fn test_apply_lvm_stack() {
        let mut tree = populated_tree(vec![gpt_disk("sda"), gpt_disk("sdb")]);
        let requests: Vec<ActionRequest> = serde_yaml::from_str(indoc! {r#"
            - action: createPartition
              disk: sda
              size: 10G
            - action: createPartition
              disk: sdb
              size: 10G
            - action: createFormat
              device: sda1
              format: { type: lvmpv }
            - action: createFormat
              device: sdb1
              format: { type: lvmpv }
            - action: createVolumeGroup
              name: data
              physicalVolumes: [sda1, sdb1]
            - action: createLogicalVolume
              volumeGroup: data
              name: root
              size: 8G
            - action: createFormat
              device: /dev/data/root
              format: { type: xfs, mountpoint: / }
        "#})
        .unwrap();

        let ids = apply(&mut tree, &requests).unwrap();
        assert_eq!(ids, (0..7).collect::<Vec<u32>>());

        let vg = tree.by_name("data").unwrap();
        let lv = tree.by_name("data-root").unwrap();
        assert_eq!(tree.devices()[vg].parents.len(), 2);
        assert_eq!(tree.devices()[vg].as_volume_group().unwrap().pv_count, 2);
        assert_eq!(tree.devices()[lv].target_size, Size::from_gib(8));
        assert_eq!(tree.devices()[lv].format.type_name(), Some("xfs"));

        tree.process_actions(true).unwrap();
        let order: Vec<String> = tree.actions().iter().map(|a| a.to_string()).collect();
        let position = |label: &str| order.iter().position(|a| a.contains(label)).unwrap();
        assert!(position("Create Format lvmpv on partition sda1") < position("lvmvg data"));
        assert!(position("Create Format lvmpv on partition sdb1") < position("lvmvg data"));
        assert!(position("lvmvg data") < position("Create Device lvmlv data-root"));
        assert!(position("Create Device lvmlv data-root") < position("Create Format xfs"));
    }

    #[test]
    fn test_apply_numbers_partitions() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            formatted(partition("sda", 1, Size::from_gib(1)), "ext4"),
        ]);
        let requests = vec![
            ActionRequest::CreatePartition {
                disk: "sda".into(),
                size: Size::from_gib(2),
                partition_type: RequestedPartitionType::Primary,
                bootable: false,
                grow: true,
            },
            ActionRequest::CreatePartition {
                disk: "/dev/sda".into(),
                size: Size::from_gib(2),
                partition_type: RequestedPartitionType::Primary,
                bootable: false,
                grow: false,
            },
        ];
        apply(&mut tree, &requests).unwrap();
        let sda2 = tree.by_name("sda2").unwrap();
        assert!(tree.devices()[sda2].grow);
        assert_eq!(tree.devices()[sda2].as_partition().unwrap().number, 2);
        assert!(tree.by_name("sda3").is_some());
    }

    #[test]
    fn test_apply_luks() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            partition("sda", 1, Size::from_gib(4)),
        ]);
        let ids = apply(
            &mut tree,
            &[ActionRequest::CreateLuks {
                device: "sda1".into(),
                passphrase: Some("secret".into()),
            }],
        )
        .unwrap();
        assert_eq!(ids.len(), 2);
        let sda1 = tree.by_name("sda1").unwrap();
        assert!(tree.devices()[sda1].format.is_luks());
        let mapping = tree.by_name("luks-sda1").unwrap();
        assert_eq!(tree.devices()[mapping].parents, vec![sda1]);
    }

    #[test]
    fn test_apply_errors() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);

        let err = apply(
            &mut tree,
            &[ActionRequest::DestroyDevice {
                device: "sdz".into(),
            }],
        )
        .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::UnknownDevice { name: "sdz".into() })
        );

        let err = apply(
            &mut tree,
            &[ActionRequest::CreateRaidArray {
                name: "md0".into(),
                level: "raid7".into(),
                members: vec!["sda".into()],
                spares: 0,
            }],
        )
        .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Device(DeviceError::InvalidConfiguration { .. })
        ));
        assert!(tree.actions().is_empty());
    }

    #[test]
    fn test_load_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yaml");
        fs::write(&path, "- action: destroyFormat\n  device: sda\n").unwrap();
        assert_eq!(
            load_requests(&path).unwrap(),
            vec![ActionRequest::DestroyFormat {
                device: "sda".into()
            }]
        );

        let err = load_requests(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::InvalidInput(InvalidInputError::LoadActions { .. })
        ));
        fs::write(&path, "action: [").unwrap();
        let err = load_requests(&path).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::InvalidInput(InvalidInputError::ParseActions)
        );
    }
}
