use std::{cmp::Reverse, collections::BinaryHeap, path::PathBuf};

use log::{debug, info, warn};
use petgraph::{
    algo::{tarjan_scc, toposort},
    graph::{DiGraph, NodeIndex},
    Direction,
};

use devgraph_api::{
    error::{ActionError, DeviceError, DeviceTreeError, ReportError, StorageError},
    Size,
};

use crate::{
    devices::{
        partition::{self, partition_name},
        DeviceId,
    },
    devicetree::DeviceTree,
    system::BlockLayer,
};

use super::{Action, ActionKind, ActionObject, ActionSpec, Replaced, ResizeDirection};

/// Criteria for [`DeviceTree::find_actions`]. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionFilter {
    pub device: Option<DeviceId>,
    pub kind: Option<ActionKind>,
    pub object: Option<ActionObject>,
    pub path: Option<PathBuf>,
}

impl<S: BlockLayer> DeviceTree<S> {
    /// Registered actions in their current order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Builds and registers an action. Returns its id.
    pub fn schedule(&mut self, device: DeviceId, spec: ActionSpec) -> Result<u32, StorageError> {
        let action = self.build_action(device, spec)?;
        let id = action.id;
        if let Err(e) = self.register_action(action.clone()) {
            self.revert(&action);
            return Err(e);
        }
        Ok(id)
    }

    /// Creates the action and applies it to the device: the graph then
    /// shows the state after the action has run.
    pub fn build_action(&mut self, device: DeviceId, spec: ActionSpec) -> Result<Action, StorageError> {
        let name = self.devices[device].name.clone();
        let mut action = Action::new(
            self.next_action_id,
            &self.devices,
            device,
            spec.kind(),
            spec.object(),
        );

        match spec {
            ActionSpec::CreateDevice => {
                if self.devices[device].exists {
                    return Err(StorageError::new(ActionError::DeviceExists { name }));
                }
            }
            ActionSpec::DestroyDevice => {
                if self.devices[device].exists {
                    self.devices.teardown(device, &mut self.system, false)?;
                }
            }
            ActionSpec::CreateFormat(format) => {
                action.format_name = format.display_name().to_string();
                action.migration_target = format.migration_target();
                let path = self.devices.path(device);
                let current = &self.devices[device].format;
                if current.exists {
                    current
                        .teardown(&mut self.system, &path)
                        .structured(DeviceError::Teardown { name })?;
                }
                let replaced = std::mem::replace(&mut self.devices[device].format, format);
                action.replaced = Replaced::Format(replaced);
            }
            ActionSpec::DestroyFormat => {
                let path = self.devices.path(device);
                let current = &self.devices[device].format;
                if current.exists {
                    current
                        .teardown(&mut self.system, &path)
                        .structured(DeviceError::Teardown { name })?;
                }
                let replaced = std::mem::take(&mut self.devices[device].format);
                action.replaced = Replaced::Format(replaced);
            }
            ActionSpec::ResizeDevice(size) => {
                if !self.devices.resizable(device) {
                    return Err(StorageError::new(ActionError::NotResizable { name }));
                }
                let current = self.devices[device].current_size;
                action.direction = Some(direction(current, size, &name)?);
                let previous = self.devices[device].target_size;
                self.devices.set_size(device, size)?;
                action.replaced = Replaced::TargetSize(previous);
            }
            ActionSpec::ResizeFormat(size) => {
                let format = &mut self.devices[device].format;
                if !format.resizable() {
                    return Err(StorageError::new(ActionError::NotResizable { name }));
                }
                action.direction = Some(direction(format.current_size, size, &name)?);
                action.replaced = Replaced::FormatTargetSize(format.target_size);
                format.target_size = size;
            }
            ActionSpec::MigrateFormat => {
                let format = &mut self.devices[device].format;
                if !format.migratable() {
                    return Err(StorageError::new(ActionError::NotMigratable { name }));
                }
                format.migrate = true;
            }
        }

        self.next_action_id += 1;
        Ok(action)
    }

    /// Adds a built action to the queue, updating tree membership for
    /// device creation and removal.
    pub fn register_action(&mut self, action: Action) -> Result<(), StorageError> {
        let device = action.device;
        let in_tree = self.contains(device);
        match (action.kind, action.object) {
            (ActionKind::Create, ActionObject::Device) => {
                // At most one record per path.
                if in_tree {
                    self.remove_device(device, false, true)?;
                }
                let path = self.devices.path(device);
                let stale: Vec<DeviceId> = self
                    .members
                    .iter()
                    .copied()
                    .filter(|member| self.devices.path(*member) == path)
                    .collect();
                for member in stale {
                    debug!("Replacing {} at '{}'", self.devices[member], path.display());
                    self.remove_device(member, false, true)?;
                }
                self.add_device(device)?;
            }
            _ if !in_tree => {
                return Err(StorageError::new(DeviceTreeError::NotInTree {
                    name: self.devices[device].name.clone(),
                }));
            }
            (ActionKind::Destroy, ActionObject::Device) => {
                self.remove_device(device, false, true)?;
            }
            (ActionKind::Create, ActionObject::Format) => {
                let format = &self.devices[device].format;
                if let (true, Some(mountpoint)) = (format.is_filesystem(), &format.mountpoint) {
                    let claimed = self.actions.iter().any(|other| {
                        other.is_create()
                            && other.is_format()
                            && other.device != device
                            && self.devices[other.device].format.mountpoint.as_ref()
                                == Some(mountpoint)
                    });
                    if claimed {
                        return Err(StorageError::new(DeviceTreeError::MountpointConflict {
                            mountpoint: mountpoint.display().to_string(),
                        }));
                    }
                }
            }
            _ => (),
        }

        debug!("Registered action: {action}");
        self.actions.push(action);
        Ok(())
    }

    /// Unregisters action `id` and undoes what it did to the tree.
    pub fn cancel_action(&mut self, id: u32) -> Result<(), StorageError> {
        let Some(position) = self.actions.iter().position(|action| action.id == id) else {
            return Err(StorageError::internal("Canceled action is not registered"));
        };
        let action = self.actions[position].clone();
        match (action.kind, action.object) {
            (ActionKind::Create, ActionObject::Device) => {
                self.remove_device(action.device, false, true)?
            }
            (ActionKind::Destroy, ActionObject::Device) => {
                let device = &self.devices[action.device];
                let logical = device
                    .as_partition()
                    .filter(|part| part.is_logical())
                    .map(|part| part.number)
                    .zip(device.parents.first().copied());
                if let Some((number, disk)) = logical {
                    partition::restore_logicals(&mut self.devices, &self.members, disk, number);
                }
                self.add_device(action.device)?
            }
            _ => (),
        }
        self.revert(&action);
        self.actions.remove(position);
        debug!("Canceled action: {action}");
        Ok(())
    }

    /// Restores the device state an action replaced.
    fn revert(&mut self, action: &Action) {
        let device = &mut self.devices[action.device];
        match action.replaced {
            Replaced::Format(ref format) => device.format = format.clone(),
            Replaced::TargetSize(size) => device.target_size = size,
            Replaced::FormatTargetSize(size) => device.format.target_size = size,
            Replaced::Nothing if action.is_migrate() => device.format.migrate = false,
            Replaced::Nothing => (),
        }
    }

    /// Registered actions matching every criterion of `filter`.
    pub fn find_actions(&self, filter: &ActionFilter) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|action| filter.device.map_or(true, |device| action.device == device))
            .filter(|action| filter.kind.map_or(true, |kind| action.kind == kind))
            .filter(|action| filter.object.map_or(true, |object| action.object == object))
            .filter(|action| {
                filter
                    .path
                    .as_deref()
                    .map_or(true, |path| self.devices.path(action.device) == path)
            })
            .collect()
    }

    /// Drops actions made redundant by later ones until nothing changes.
    #[tracing::instrument(skip_all)]
    pub fn prune_actions(&mut self) {
        loop {
            let before = self.actions.len();
            let ids: Vec<u32> = self.actions.iter().rev().map(|action| action.id).collect();
            for id in ids {
                let Some(action) = self.actions.iter().find(|action| action.id == id).cloned()
                else {
                    debug!("Action {id} already pruned");
                    continue;
                };
                let exists = self.devices[action.device].exists;
                self.actions.retain(|other| {
                    let obsolete = action.obsoletes(other, exists);
                    if obsolete {
                        debug!("Removing action '{other}', obsoleted by '{action}'");
                    }
                    !obsolete
                });
            }
            if self.actions.len() == before {
                break;
            }
        }
    }

    /// Orders the actions by kind priority and by the requirements between
    /// them. Ties keep registration order. Fails when the two orders
    /// contradict each other.
    #[tracing::instrument(skip_all)]
    pub fn sort_actions(&mut self) -> Result<(), StorageError> {
        if self.actions.is_empty() {
            return Ok(());
        }

        let mut graph: DiGraph<usize, ()> = DiGraph::with_capacity(self.actions.len(), 0);
        let nodes: Vec<NodeIndex> = (0..self.actions.len()).map(|i| graph.add_node(i)).collect();
        for (i, action) in self.actions.iter().enumerate() {
            for (j, other) in self.actions.iter().enumerate() {
                if i == j {
                    continue;
                }
                if action.kind.priority() > other.kind.priority()
                    || other.requires(action, &self.devices)
                {
                    graph.update_edge(nodes[i], nodes[j], ());
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let actions = tarjan_scc(&graph)
                .into_iter()
                .find(|component| component.contains(&cycle.node_id()))
                .unwrap_or_else(|| vec![cycle.node_id()])
                .into_iter()
                .map(|node| self.actions[graph[node]].to_string())
                .collect();
            return Err(StorageError::new(ActionError::DependencyCycle { actions }));
        }

        // Kahn's algorithm, always taking the earliest registered action.
        let mut in_degree: Vec<usize> = nodes
            .iter()
            .map(|node| graph.neighbors_directed(*node, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.actions.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for next in graph.neighbors_directed(nodes[i], Direction::Outgoing) {
                let j = graph[next];
                in_degree[j] -= 1;
                if in_degree[j] == 0 {
                    ready.push(Reverse(j));
                }
            }
        }

        let mut actions: Vec<Option<Action>> = self.actions.drain(..).map(Some).collect();
        self.actions = order.into_iter().filter_map(|i| actions[i].take()).collect();
        Ok(())
    }

    /// Prunes, sorts and runs every registered action. With `dry_run` the
    /// actions are only logged.
    #[tracing::instrument(skip_all)]
    pub fn process_actions(&mut self, dry_run: bool) -> Result<(), StorageError> {
        let mountpoints = self.mountpoints();
        let mut fixups = self.members.clone();
        fixups.extend(
            self.actions
                .iter()
                .filter(|action| action.is_destroy() && action.is_device())
                .map(|action| action.device),
        );
        for device in fixups {
            self.devices.pre_commit_fixup(device, &mountpoints);
        }

        // Extended partitions added along with their logical partitions.
        let extended: Vec<DeviceId> = self
            .members
            .iter()
            .copied()
            .filter(|member| {
                let device = &self.devices[*member];
                device.is_extended()
                    && !device.exists
                    && !self.actions.iter().any(|action| {
                        action.device == *member && action.is_create() && action.is_device()
                    })
            })
            .collect();
        for device in extended {
            let action = Action::new(
                self.next_action_id,
                &self.devices,
                device,
                ActionKind::Create,
                ActionObject::Device,
            );
            self.next_action_id += 1;
            debug!("Adding action: {action}");
            self.actions.push(action);
        }

        self.log_actions("Registered");
        self.prune_actions();
        self.log_actions("Pruned");
        self.sort_actions()?;
        self.log_actions("Sorted");

        for index in 0..self.actions.len() {
            let action = self.actions[index].clone();
            info!("Executing action: {action}");
            if dry_run {
                continue;
            }

            if let Err(e) = self.execute_action(&action) {
                if !e.is_disklabel_commit() {
                    return Err(e).structured(ActionError::Execute {
                        action: action.to_string(),
                        device: action.device_name.clone(),
                    });
                }
                // An earlier action probably activated LVM or MD on the disk.
                warn!("Partition table commit failed, retrying '{action}' after teardown: {e:?}");
                self.teardown_all();
                self.execute_action(&action)
                    .structured(ActionError::Execute {
                        action: action.to_string(),
                        device: action.device_name.clone(),
                    })?;
            }

            if let Err(e) = self.system.settle() {
                warn!("Failed to settle after '{action}': {e:?}");
            }
            self.refresh_partitions();
        }
        Ok(())
    }

    fn log_actions(&self, stage: &str) {
        for action in &self.actions {
            debug!("{stage} action: {action}");
        }
    }

    fn execute_action(&mut self, action: &Action) -> Result<(), StorageError> {
        let id = action.device;
        let name = self.devices[id].name.clone();
        let ui = self.ui.as_deref();
        match (action.kind, action.object) {
            (ActionKind::Create, ActionObject::Device) => {
                self.devices.create(id, &mut self.system, ui)
            }
            (ActionKind::Destroy, ActionObject::Device) => self.devices.destroy(id, &mut self.system),
            (ActionKind::Resize, ActionObject::Device) => {
                self.devices.resize(id, &mut self.system, ui)
            }
            (ActionKind::Create, ActionObject::Format) => {
                self.devices.setup(id, &mut self.system, false)?;
                let path = self.devices.path(id);
                let format = &mut self.devices[id].format;
                let format_name = format.display_name().to_string();
                format
                    .create(&mut self.system, &path)
                    .structured(DeviceError::Format {
                        name,
                        format: format_name,
                        operation: "create".into(),
                    })?;
                if let Err(e) = self.system.settle() {
                    debug!("Failed to settle after creating format on '{}': {e:?}", path.display());
                }
                Ok(())
            }
            (ActionKind::Destroy, ActionObject::Format) => {
                let Replaced::Format(ref replaced) = action.replaced else {
                    return Ok(());
                };
                if !replaced.exists || !self.devices[id].exists {
                    debug!("No format to destroy on '{name}'");
                    return Ok(());
                }
                self.devices.setup(id, &mut self.system, true)?;
                let path = self.devices.path(id);
                let mut format = replaced.clone();
                format
                    .destroy(&mut self.system, &path)
                    .structured(DeviceError::Format {
                        name,
                        format: replaced.display_name().to_string(),
                        operation: "destroy".into(),
                    })?;
                if let Err(e) = self.system.settle() {
                    debug!("Failed to settle after destroying format on '{}': {e:?}", path.display());
                }
                self.devices.teardown(id, &mut self.system, false)
            }
            (ActionKind::Resize, ActionObject::Format) => {
                self.devices.setup(id, &mut self.system, true)?;
                let path = self.devices.path(id);
                let format = &mut self.devices[id].format;
                let format_name = format.display_name().to_string();
                format
                    .do_resize(&mut self.system, &path)
                    .structured(DeviceError::Format {
                        name,
                        format: format_name,
                        operation: "resize".into(),
                    })
            }
            (ActionKind::Migrate, _) => {
                self.devices.setup(id, &mut self.system, true)?;
                let path = self.devices.path(id);
                let format = &mut self.devices[id].format;
                let format_name = format.display_name().to_string();
                format
                    .do_migrate(&mut self.system, &path)
                    .structured(DeviceError::Format {
                        name,
                        format: format_name,
                        operation: "migrate".into(),
                    })
            }
        }
    }

    /// Partition names follow their numbers, which change as partitions
    /// come and go. Sizes follow the disk geometry.
    fn refresh_partitions(&mut self) {
        for member in self.members.clone() {
            let device = &self.devices[member];
            let (Some(part), Some(disk), true) =
                (device.as_partition(), device.parents.first(), device.exists)
            else {
                continue;
            };
            let name = partition_name(&self.devices[*disk].name, part.number);
            if name != device.name {
                debug!("Partition '{}' is now '{name}'", device.name);
                self.devices[member].name = name;
            }
            if let Some(size) = partition::geometry_size(&self.devices, member, &self.system) {
                self.devices[member].current_size = size;
            }
        }
        for action in &mut self.actions {
            action.device_name = self.devices[action.device].name.clone();
        }
    }
}

fn direction(current: Size, target: Size, name: &str) -> Result<ResizeDirection, StorageError> {
    if target == current {
        return Err(StorageError::new(ActionError::UnchangedSize {
            name: name.to_string(),
        }));
    }
    Ok(if target > current {
        ResizeDirection::Grow
    } else {
        ResizeDirection::Shrink
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    use devgraph_api::{
        descriptor::{DeviceDescriptor, DiskLabelType, DmTarget},
        error::ErrorKind,
    };

    use crate::{
        devices::{
            partition::next_number, DeviceKind, LogicalVolumeInfo, PartitionInfo, VolumeGroupInfo,
        },
        formats::Format,
        system::{simulated::Failure, PartitionType},
        testutils::{disk, dm, formatted, lv, lvm_pv, partition, populated_tree},
    };

    fn gpt_disk(name: &str) -> DeviceDescriptor {
        let mut desc = disk(name, Size::from_gib(10));
        desc.partition_table = Some(DiskLabelType::Gpt);
        desc
    }

    fn new_partition<S: BlockLayer>(
        tree: &mut DeviceTree<S>,
        disk: &str,
        info: PartitionInfo,
        size: Size,
    ) -> DeviceId {
        let disk = tree.by_name(disk).unwrap();
        let name = partition_name(&tree.devices()[disk].name, info.number);
        let id = tree
            .devices_mut()
            .add_with_parents(name, DeviceKind::Partition(info), vec![disk]);
        tree.devices_mut()[id].target_size = size;
        id
    }

    fn labels<S: BlockLayer>(tree: &DeviceTree<S>) -> Vec<String> {
        tree.actions().iter().map(|action| action.to_string()).collect()
    }

    #[test]
    fn test_create_then_destroy_prunes_both() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda1, ActionSpec::CreateFormat(Format::filesystem("ext4")))
            .unwrap();
        assert!(tree.contains(sda1));
        tree.schedule(sda1, ActionSpec::DestroyDevice).unwrap();
        assert!(!tree.contains(sda1));

        tree.prune_actions();
        assert!(tree
            .find_actions(&ActionFilter {
                device: Some(sda1),
                ..Default::default()
            })
            .is_empty());
    }

    #[test]
    fn test_register_replaces_stale_path() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            formatted(partition("sda", 1, Size::from_gib(1)), "ext4"),
        ]);
        let old = tree.by_name("sda1").unwrap();
        let new = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(2));
        tree.schedule(new, ActionSpec::CreateDevice).unwrap();

        assert!(!tree.contains(old));
        assert!(tree.contains(new));
        assert_eq!(tree.by_name("sda1"), Some(new));
    }

    #[test]
    fn test_cancel_restores_tree() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            formatted(partition("sda", 1, Size::from_gib(1)), "ext4"),
        ]);
        let sda1 = tree.by_name("sda1").unwrap();
        let original = tree.devices()[sda1].format.clone();

        let destroy_format = tree.schedule(sda1, ActionSpec::DestroyFormat).unwrap();
        assert_eq!(tree.devices()[sda1].format.type_name(), None);
        let destroy = tree.schedule(sda1, ActionSpec::DestroyDevice).unwrap();
        assert!(!tree.contains(sda1));

        tree.cancel_action(destroy).unwrap();
        assert!(tree.contains(sda1));
        tree.cancel_action(destroy_format).unwrap();
        assert_eq!(tree.devices()[sda1].format, original);
        assert!(tree.actions().is_empty());

        let resize = tree
            .schedule(sda1, ActionSpec::ResizeFormat(Size::from_mib(512)))
            .unwrap();
        assert_eq!(tree.devices()[sda1].format.target_size, Size::from_mib(512));
        tree.cancel_action(resize).unwrap();
        assert_eq!(tree.devices()[sda1].format.target_size, original.target_size);
    }

    #[test]
    fn test_cancel_logical_destroy_restores_numbers() {
        let mut sda = gpt_disk("sda");
        sda.partition_table = Some(DiskLabelType::Msdos);
        let mut sda4 = partition("sda", 4, Size::from_gib(6));
        if let Some(ref mut info) = sda4.partition {
            info.extended = true;
        }
        let mut tree = populated_tree(vec![
            sda,
            sda4,
            partition("sda", 5, Size::from_gib(2)),
            partition("sda", 6, Size::from_gib(2)),
        ]);
        let sda5 = tree.by_name("sda5").unwrap();
        let sda6 = tree.by_name("sda6").unwrap();

        let destroy = tree.schedule(sda5, ActionSpec::DestroyDevice).unwrap();
        assert!(!tree.contains(sda5));
        assert_eq!(tree.devices()[sda6].name, "sda5");
        assert_eq!(tree.by_name("sda5"), Some(sda6));

        tree.cancel_action(destroy).unwrap();
        assert!(tree.contains(sda5));
        assert_eq!(tree.devices()[sda5].name, "sda5");
        assert_eq!(tree.devices()[sda6].name, "sda6");
        assert_eq!(tree.devices()[sda6].as_partition().unwrap().number, 6);
        assert_eq!(tree.by_name("sda6"), Some(sda6));
        assert_eq!(tree.by_path("/dev/sda5"), Some(sda5));
        assert!(tree.actions().is_empty());
    }

    #[test]
    fn test_partition_size_follows_geometry() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_mib(1000));
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.process_actions(false).unwrap();
        assert_eq!(tree.size(sda1), Size::from_mib(1000));

        // The disk ended up with a different geometry than requested.
        tree.system_mut()
            .resize_partition(Path::new("/dev/sda"), 1, Size::from_mib(999))
            .unwrap();
        assert_eq!(tree.size(sda1), Size::from_mib(999));

        tree.actions.clear();
        tree.schedule(sda1, ActionSpec::ResizeDevice(Size::from_mib(800)))
            .unwrap();
        tree.process_actions(false).unwrap();
        assert_eq!(tree.devices()[sda1].current_size, Size::from_mib(800));
        assert_eq!(tree.devices().size(sda1), Size::from_mib(800));

        tree.system_mut()
            .resize_partition(Path::new("/dev/sda"), 1, Size::from_mib(799))
            .unwrap();
        assert_eq!(tree.size(sda1), Size::from_mib(799));
    }

    #[test]
    fn test_build_rejections() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            formatted(partition("sda", 1, Size::from_gib(1)), "xfs"),
            formatted(partition("sda", 2, Size::from_gib(1)), "ext4"),
        ]);
        let sda1 = tree.by_name("sda1").unwrap();
        let sda2 = tree.by_name("sda2").unwrap();

        let err = tree.schedule(sda1, ActionSpec::CreateDevice).unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Action(ActionError::DeviceExists {
                name: "sda1".into()
            })
        );
        let err = tree
            .schedule(sda1, ActionSpec::ResizeFormat(Size::from_mib(100)))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Action(ActionError::NotResizable { .. })
        ));
        let err = tree.schedule(sda1, ActionSpec::MigrateFormat).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Action(ActionError::NotMigratable { .. })
        ));
        let err = tree
            .schedule(sda1, ActionSpec::ResizeDevice(Size::from_gib(2)))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Action(ActionError::NotResizable { .. })
        ));
        let size = tree.devices()[sda2].current_size;
        let err = tree
            .schedule(sda2, ActionSpec::ResizeDevice(size))
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Action(ActionError::UnchangedSize { .. })
        ));
        assert!(tree.actions().is_empty());
        assert_eq!(tree.next_action_id, 0);
    }

    #[test]
    fn test_mountpoint_conflict() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        let sda2 = new_partition(&mut tree, "sda", PartitionInfo::primary(2), Size::from_gib(1));
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda2, ActionSpec::CreateDevice).unwrap();
        tree.schedule(
            sda1,
            ActionSpec::CreateFormat(Format::filesystem("ext4").with_mountpoint("/home")),
        )
        .unwrap();

        let err = tree
            .schedule(
                sda2,
                ActionSpec::CreateFormat(Format::filesystem("xfs").with_mountpoint("/home")),
            )
            .unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::DeviceTree(DeviceTreeError::MountpointConflict {
                mountpoint: "/home".into()
            })
        );
        // The rejected format was taken back off the device.
        assert_eq!(tree.devices()[sda2].format.type_name(), None);
    }

    #[test]
    fn test_sort_orders_by_kind_and_dependencies() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            formatted(partition("sda", 1, Size::from_gib(1)), "ext4"),
        ]);
        let old = tree.by_name("sda1").unwrap();
        let sda2 = new_partition(&mut tree, "sda", PartitionInfo::primary(2), Size::from_gib(4));
        let sda3 = new_partition(&mut tree, "sda", PartitionInfo::primary(3), Size::from_gib(4));
        let vg = tree.devices_mut().add_with_parents(
            "data",
            DeviceKind::VolumeGroup(VolumeGroupInfo::default()),
            vec![sda2, sda3],
        );
        let lv = tree.devices_mut().add_with_parents(
            "data-root",
            DeviceKind::LogicalVolume(LogicalVolumeInfo::new("root")),
            vec![vg],
        );
        tree.devices_mut()[lv].target_size = Size::from_gib(2);

        // Registered in an order the queue has to fix.
        tree.schedule(sda3, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda2, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda3, ActionSpec::CreateFormat(Format::lvmpv())).unwrap();
        tree.schedule(sda2, ActionSpec::CreateFormat(Format::lvmpv())).unwrap();
        tree.schedule(vg, ActionSpec::CreateDevice).unwrap();
        tree.schedule(lv, ActionSpec::CreateDevice).unwrap();
        tree.schedule(lv, ActionSpec::CreateFormat(Format::filesystem("xfs")))
            .unwrap();
        tree.schedule(old, ActionSpec::DestroyFormat).unwrap();
        tree.schedule(old, ActionSpec::DestroyDevice).unwrap();
        tree.sort_actions().unwrap();

        let position = |device: DeviceId, kind: ActionKind, object: ActionObject| {
            tree.actions()
                .iter()
                .position(|a| a.device == device && a.kind == kind && a.object == object)
                .unwrap()
        };
        use ActionKind::*;
        use ActionObject::{Device as Dev, Format as Fmt};
        assert_eq!(position(old, Destroy, Fmt), 0);
        assert_eq!(position(old, Destroy, Dev), 1);
        assert!(position(sda2, Create, Dev) < position(sda3, Create, Dev));
        assert!(position(sda2, Create, Fmt) < position(vg, Create, Dev));
        assert!(position(sda3, Create, Fmt) < position(vg, Create, Dev));
        assert!(position(vg, Create, Dev) < position(lv, Create, Dev));
        assert!(position(lv, Create, Dev) < position(lv, Create, Fmt));
    }

    #[test]
    fn test_sort_destroys_dependents_first() {
        let lvs = vec![lv("root", Size::from_gib(4), "-wi-a-----")];
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            lvm_pv(partition("sda", 1, Size::from_gib(9)), "data", "vg-uuid", 1, lvs),
            dm("dm-0", "data-root", DmTarget::Lvm, &["sda1"]),
        ]);
        let pv = tree.by_name("sda1").unwrap();
        let vg = tree.by_name("data").unwrap();
        let root = tree.by_name("data-root").unwrap();

        tree.schedule(root, ActionSpec::DestroyDevice).unwrap();
        tree.schedule(vg, ActionSpec::DestroyDevice).unwrap();
        tree.schedule(pv, ActionSpec::DestroyDevice).unwrap();
        // Queued against their dependencies.
        tree.actions.reverse();
        assert_eq!(tree.actions()[0].device, pv);

        tree.sort_actions().unwrap();
        let order: Vec<DeviceId> = tree.actions().iter().map(|a| a.device).collect();
        assert_eq!(order, vec![root, vg, pv]);
    }

    #[test]
    fn test_sort_is_stable() {
        let mut tree = populated_tree(vec![gpt_disk("sda"), gpt_disk("sdb")]);
        let sdb1 = new_partition(&mut tree, "sdb", PartitionInfo::primary(1), Size::from_gib(1));
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        tree.schedule(sdb1, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.sort_actions().unwrap();
        let order: Vec<DeviceId> = tree.actions().iter().map(|a| a.device).collect();
        assert_eq!(order, vec![sdb1, sda1]);
    }

    #[test]
    fn test_contradicting_requirements_are_a_cycle() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            partition("sda", 1, Size::from_gib(4)),
        ]);
        let sda1 = tree.by_name("sda1").unwrap();
        let vg = tree.devices_mut().add_with_parents(
            "data",
            DeviceKind::VolumeGroup(VolumeGroupInfo::default()),
            vec![sda1],
        );
        let lv = tree.devices_mut().add_with_parents(
            "data-root",
            DeviceKind::LogicalVolume(LogicalVolumeInfo::new("root")),
            vec![vg],
        );

        // Growing the PV wants the filesystem shrink done first, and the
        // filesystem shrink wants the PV grown first.
        let mut grow = Action::new(7, tree.devices(), sda1, ActionKind::Resize, ActionObject::Device);
        grow.direction = Some(ResizeDirection::Grow);
        let mut shrink = Action::new(8, tree.devices(), lv, ActionKind::Resize, ActionObject::Format);
        shrink.direction = Some(ResizeDirection::Shrink);
        tree.actions.push(grow);
        tree.actions.push(shrink);

        let err = tree.sort_actions().unwrap_err();
        let ErrorKind::Action(ActionError::DependencyCycle { actions }) = err.kind() else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(actions.len(), 2);
        // Nothing was reordered or dropped.
        let ids: Vec<u32> = tree.actions().iter().map(|action| action.id).collect();
        assert_eq!(ids, vec![7, 8]);
    }

    #[test]
    fn test_process_actions_executes_in_order() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        tree.schedule(sda1, ActionSpec::CreateFormat(Format::filesystem("ext4")))
            .unwrap_err();
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda1, ActionSpec::CreateFormat(Format::filesystem("ext4")))
            .unwrap();
        tree.system_mut().clear_calls();

        tree.process_actions(false).unwrap();
        let calls = tree.system().calls();
        let add = calls
            .iter()
            .position(|call| call.starts_with("add_partition /dev/sda 1"))
            .unwrap();
        let mkfs = calls
            .iter()
            .position(|call| call == "mkfs /dev/sda1 ext4")
            .unwrap();
        assert!(add < mkfs);
        assert!(tree.devices()[sda1].exists);
        assert!(tree.devices()[sda1].format.exists);
        assert_eq!(
            labels(&tree),
            vec![
                "[1] Create Device partition sda1 (id 1)",
                "[2] Create Format ext4 on partition sda1 (id 1)",
            ]
        );
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.system_mut().clear_calls();
        tree.process_actions(true).unwrap();
        assert!(tree.system().calls().is_empty());
        assert!(!tree.devices()[sda1].exists);
    }

    #[test]
    fn test_disklabel_commit_retried_once() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.system_mut().fail_next(
            "add_partition",
            Failure::DiskLabelCommit { disk: "sda".into() },
        );
        tree.process_actions(false).unwrap();
        assert!(tree.devices()[sda1].exists);
        let attempts = tree
            .system()
            .calls()
            .iter()
            .filter(|call| call.starts_with("add_partition"))
            .count();
        assert_eq!(attempts, 2);

        // A second conflict on the retry is fatal.
        let sda2 = new_partition(&mut tree, "sda", PartitionInfo::primary(2), Size::from_gib(1));
        tree.schedule(sda2, ActionSpec::CreateDevice).unwrap();
        tree.prune_actions();
        tree.actions.retain(|action| action.device == sda2);
        for _ in 0..2 {
            tree.system_mut().fail_next(
                "add_partition",
                Failure::DiskLabelCommit { disk: "sda".into() },
            );
        }
        let err = tree.process_actions(false).unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Action(ActionError::Execute { .. })
        ));
        assert!(err.is_disklabel_commit());
    }

    #[test]
    fn test_other_failures_abort() {
        let mut tree = populated_tree(vec![gpt_disk("sda")]);
        let sda1 = new_partition(&mut tree, "sda", PartitionInfo::primary(1), Size::from_gib(1));
        tree.schedule(sda1, ActionSpec::CreateDevice).unwrap();
        tree.schedule(sda1, ActionSpec::CreateFormat(Format::filesystem("ext4")))
            .unwrap();
        tree.system_mut().fail_next("add_partition", Failure::Command);
        let err = tree.process_actions(false).unwrap_err();
        assert!(!err.is_disklabel_commit());
        assert!(!tree
            .system()
            .calls()
            .iter()
            .any(|call| call.starts_with("mkfs")));
    }

    #[test]
    fn test_implicit_extended_partition() {
        let mut sda = gpt_disk("sda");
        sda.partition_table = Some(DiskLabelType::Msdos);
        let mut tree = populated_tree(vec![sda]);
        let extended = new_partition(&mut tree, "sda", PartitionInfo::extended(1), Size::from_gib(4));
        tree.add_device(extended).unwrap();
        let number = next_number(&[1], PartitionType::Logical);
        let logical = new_partition(&mut tree, "sda", PartitionInfo::logical(number), Size::from_gib(1));
        tree.schedule(logical, ActionSpec::CreateDevice).unwrap();

        tree.process_actions(true).unwrap();
        let creates = tree.find_actions(&ActionFilter {
            kind: Some(ActionKind::Create),
            object: Some(ActionObject::Device),
            ..Default::default()
        });
        assert_eq!(creates.len(), 2);
        assert_eq!(creates[0].device, extended);
        assert_eq!(creates[1].device, logical);
    }

    #[test]
    fn test_find_actions_by_path() {
        let mut tree = populated_tree(vec![
            gpt_disk("sda"),
            formatted(partition("sda", 1, Size::from_gib(1)), "ext4"),
        ]);
        let sda1 = tree.by_name("sda1").unwrap();
        tree.schedule(sda1, ActionSpec::DestroyFormat).unwrap();
        let found = tree.find_actions(&ActionFilter {
            path: Some("/dev/sda1".into()),
            ..Default::default()
        });
        assert_eq!(found.len(), 1);
        assert_eq!(tree.devices().path(found[0].device), Path::new("/dev/sda1"));
        assert!(tree
            .find_actions(&ActionFilter {
                kind: Some(ActionKind::Create),
                ..Default::default()
            })
            .is_empty());
    }
}
