//! Queued mutations of the device graph and the rules that order them.

use std::fmt::Display;

use strum_macros::{Display as StrumDisplay, EnumString};

use devgraph_api::Size;

use crate::{
    devices::{DeviceId, DeviceKind, Devices},
    formats::Format,
};

mod queue;

pub use queue::ActionFilter;

/// What an action does to its object. The discriminant is the priority used
/// when sorting: higher priorities run first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ActionKind {
    Destroy = 1000,
    Resize = 500,
    Migrate = 250,
    Create = 100,
}

impl ActionKind {
    pub fn priority(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ActionObject {
    Format = 1,
    Device = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
pub enum ResizeDirection {
    Shrink,
    Grow,
}

/// A mutation requested for a device, before it is turned into an
/// [`Action`].
#[derive(Debug, Clone, PartialEq)]
pub enum ActionSpec {
    CreateDevice,
    DestroyDevice,
    CreateFormat(Format),
    DestroyFormat,
    ResizeDevice(Size),
    ResizeFormat(Size),
    MigrateFormat,
}

impl ActionSpec {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionSpec::CreateDevice | ActionSpec::CreateFormat(_) => ActionKind::Create,
            ActionSpec::DestroyDevice | ActionSpec::DestroyFormat => ActionKind::Destroy,
            ActionSpec::ResizeDevice(_) | ActionSpec::ResizeFormat(_) => ActionKind::Resize,
            ActionSpec::MigrateFormat => ActionKind::Migrate,
        }
    }

    pub fn object(&self) -> ActionObject {
        match self {
            ActionSpec::CreateDevice | ActionSpec::DestroyDevice | ActionSpec::ResizeDevice(_) => {
                ActionObject::Device
            }
            _ => ActionObject::Format,
        }
    }
}

/// State an action replaced, put back when the action is canceled.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Replaced {
    Nothing,
    Format(Format),
    TargetSize(Size),
    FormatTargetSize(Size),
}

/// A registered mutation of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub id: u32,
    pub device: DeviceId,
    pub kind: ActionKind,
    pub object: ActionObject,
    /// Set for resizes only.
    pub direction: Option<ResizeDirection>,
    pub(crate) replaced: Replaced,

    // Labels for display, kept current while actions execute.
    pub(crate) device_type: &'static str,
    pub(crate) device_name: String,
    pub(crate) format_name: String,
    pub(crate) migration_target: Option<&'static str>,
}

impl Action {
    pub(crate) fn new(
        id: u32,
        devices: &Devices,
        device: DeviceId,
        kind: ActionKind,
        object: ActionObject,
    ) -> Self {
        let target = &devices[device];
        Self {
            id,
            device,
            kind,
            object,
            direction: None,
            replaced: Replaced::Nothing,
            device_type: target.type_name(),
            device_name: target.name.clone(),
            format_name: target.format.display_name().to_string(),
            migration_target: target.format.migration_target(),
        }
    }

    pub fn is_create(&self) -> bool {
        self.kind == ActionKind::Create
    }

    pub fn is_destroy(&self) -> bool {
        self.kind == ActionKind::Destroy
    }

    pub fn is_resize(&self) -> bool {
        self.kind == ActionKind::Resize
    }

    pub fn is_migrate(&self) -> bool {
        self.kind == ActionKind::Migrate
    }

    pub fn is_device(&self) -> bool {
        self.object == ActionObject::Device
    }

    pub fn is_format(&self) -> bool {
        self.object == ActionObject::Format
    }

    pub fn is_shrink(&self) -> bool {
        self.direction == Some(ResizeDirection::Shrink)
    }

    pub fn is_grow(&self) -> bool {
        self.direction == Some(ResizeDirection::Grow)
    }

    /// Name of the device when the action was registered or last executed.
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Whether this action must run after `other`.
    pub fn requires(&self, other: &Action, devices: &Devices) -> bool {
        let same_device = self.device == other.device;
        match (self.kind, self.object) {
            (ActionKind::Create, ActionObject::Device) => {
                if devices.depends_on(self.device, other.device) {
                    return true;
                }
                if !(other.is_create() && other.is_device()) {
                    return false;
                }
                // Partitions are created in ascending order.
                if let (Some((disk, number)), Some((other_disk, other_number))) =
                    (placement(devices, self.device), placement(devices, other.device))
                {
                    return disk == other_disk && number > other_number;
                }
                // Volumes restricted to one PV are allocated first.
                match (&devices[self.device].kind, &devices[other.device].kind) {
                    (DeviceKind::LogicalVolume(lv), DeviceKind::LogicalVolume(other_lv)) => {
                        devices[self.device].parents == devices[other.device].parents
                            && other_lv.single_pv
                            && !lv.single_pv
                    }
                    _ => false,
                }
            }
            (ActionKind::Destroy, ActionObject::Device) => {
                if other.is_destroy() && devices.depends_on(other.device, self.device) {
                    return true;
                }
                if other.is_destroy() && other.is_device() {
                    // Partitions are removed in descending order.
                    if let (Some((disk, number)), Some((other_disk, other_number))) =
                        (placement(devices, self.device), placement(devices, other.device))
                    {
                        return disk == other_disk && number < other_number;
                    }
                }
                other.is_destroy() && other.is_format() && same_device
            }
            (ActionKind::Resize, ActionObject::Device) => {
                other.is_resize()
                    && ((same_device
                        && self.direction == other.direction
                        && other.is_format()
                        && self.is_shrink())
                        || (other.is_grow() && devices.depends_on(self.device, other.device))
                        || (other.is_shrink() && devices.depends_on(other.device, self.device)))
            }
            (ActionKind::Create, ActionObject::Format) => {
                (devices.depends_on(self.device, other.device)
                    && !(other.is_destroy() && other.is_device()))
                    || (other.is_device()
                        && (other.is_create() || other.is_resize())
                        && same_device)
            }
            (ActionKind::Destroy, ActionObject::Format) => {
                other.is_destroy() && devices.depends_on(other.device, self.device)
            }
            (ActionKind::Resize, ActionObject::Format) => {
                other.is_resize()
                    && ((same_device
                        && self.direction == other.direction
                        && other.is_device()
                        && self.is_grow())
                        || (other.is_shrink() && devices.depends_on(other.device, self.device))
                        || (other.is_grow() && devices.depends_on(self.device, other.device)))
            }
            (ActionKind::Migrate, _) => false,
        }
    }

    /// Whether this action makes `other` redundant. `exists` tells whether
    /// the device of this action exists on the system. An action can
    /// obsolete itself.
    pub fn obsoletes(&self, other: &Action, exists: bool) -> bool {
        if self.device != other.device {
            return false;
        }
        match (self.kind, self.object) {
            (ActionKind::Destroy, ActionObject::Device) if !exists => self.id >= other.id,
            (ActionKind::Destroy, ActionObject::Device) => {
                self.id > other.id && !(other.is_destroy() && other.is_format())
            }
            (ActionKind::Create, ActionObject::Format) => other.is_format() && self.id > other.id,
            (ActionKind::Destroy, ActionObject::Format) => {
                other.is_format() && (self.id > other.id || (self.id == other.id && !exists))
            }
            _ => self.kind == other.kind && self.object == other.object && self.id > other.id,
        }
    }
}

/// Disk and number of a partition.
fn placement(devices: &Devices, id: DeviceId) -> Option<(DeviceId, u32)> {
    let device = &devices[id];
    let number = device.as_partition()?.number;
    Some((*device.parents.first()?, number))
}

impl Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {} {}", self.id, self.kind, self.object)?;
        if let Some(direction) = self.direction {
            write!(f, " ({direction})")?;
        }
        if self.is_format() {
            write!(f, " {} on", self.format_name)?;
        }
        if let (true, Some(target)) = (self.is_migrate(), self.migration_target) {
            write!(f, " to {target}")?;
        }
        write!(
            f,
            " {} {} (id {})",
            self.device_type, self.device_name, self.device
        )
    }
}
