//! Printable views of a device tree.

use std::path::PathBuf;

use serde::Serialize;

use devgraph_api::Size;

use crate::{devices::DeviceId, devicetree::DeviceTree, system::BlockLayer};

/// One device of the tree as the CLI prints it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReport {
    pub id: DeviceId,
    pub name: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub path: PathBuf,
    pub size: Size,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mountpoint: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub protected: bool,
}

/// The tree members in insertion order.
pub fn device_reports<S: BlockLayer>(tree: &DeviceTree<S>) -> Vec<DeviceReport> {
    let devices = tree.devices();
    tree.members()
        .iter()
        .map(|id| {
            let device = &devices[*id];
            DeviceReport {
                id: *id,
                name: device.name.clone(),
                device_type: device.type_name().to_string(),
                path: devices.path(*id),
                size: tree.size(*id),
                exists: device.exists,
                format: device.format.type_name().map(String::from),
                mountpoint: device.format.mountpoint.clone(),
                parents: device
                    .parents
                    .iter()
                    .map(|parent| devices[*parent].name.clone())
                    .collect(),
                protected: device.protected,
            }
        })
        .collect()
}

/// One line per device, followed by the ignored disks if any.
pub fn render_text<S: BlockLayer>(tree: &DeviceTree<S>) -> String {
    let mut lines: Vec<String> = tree
        .members()
        .iter()
        .map(|id| tree.devices().describe(*id))
        .collect();
    if !tree.ignored_disks().is_empty() {
        lines.push(format!("ignored: {}", tree.ignored_disks().join(", ")));
    }
    lines.join("\n")
}
