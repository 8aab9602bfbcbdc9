//! Collaborators the engine reports progress to and defers decisions to.

use std::collections::BTreeMap;

use log::{debug, info};

use devgraph_api::Size;

/// A window shown while a long operation runs.
pub trait ProgressWindow {
    /// Signals progress of unknown extent.
    fn pulse(&mut self) {}

    /// Sets the number of completed steps.
    fn set(&mut self, _amount: u64) {}

    /// Closes the window.
    fn pop(self: Box<Self>);
}

/// User feedback during create and resize. Purely informational.
pub trait ProgressInterface {
    fn wait_window(&self, title: &str, text: &str) -> Box<dyn ProgressWindow>;

    fn progress_window(&self, title: &str, text: &str, total: u64) -> Box<dyn ProgressWindow>;
}

/// Reports progress through the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInterface;

struct LogWindow {
    title: String,
    total: Option<u64>,
}

impl ProgressWindow for LogWindow {
    fn pulse(&mut self) {
        debug!("{}: still working", self.title);
    }

    fn set(&mut self, amount: u64) {
        match self.total {
            Some(total) => debug!("{}: {amount}/{total}", self.title),
            None => debug!("{}: {amount}", self.title),
        }
    }

    fn pop(self: Box<Self>) {
        debug!("{}: done", self.title);
    }
}

impl ProgressInterface for LogInterface {
    fn wait_window(&self, title: &str, text: &str) -> Box<dyn ProgressWindow> {
        info!("{title}: {text}");
        Box::new(LogWindow {
            title: title.to_string(),
            total: None,
        })
    }

    fn progress_window(&self, title: &str, text: &str, total: u64) -> Box<dyn ProgressWindow> {
        info!("{title}: {text}");
        Box::new(LogWindow {
            title: title.to_string(),
            total: Some(total),
        })
    }
}

/// Decisions population defers to the user or a caller-supplied policy.
pub trait Policy {
    /// Whether a disk with an unreadable or missing disklabel may be
    /// initialized. `path_hint` is a stable name for the disk.
    fn initialize_disk(&self, path_hint: &str, description: &str, size: Size) -> bool;

    /// Whether a volume group with missing physical volumes may be
    /// destroyed and its remaining physical volumes reinitialized.
    fn reinitialize_inconsistent_lvm(&self, pv_paths: &[String], vg_name: &str) -> bool;

    /// Passphrase for the LUKS device with `uuid`, if one can be obtained.
    fn luks_passphrase(&self, device: &str, uuid: Option<&str>) -> Option<String>;
}

/// Fixed answers for unattended runs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchPolicy {
    pub initialize_disks: bool,
    pub reinitialize_lvm: bool,
    /// Passphrases keyed by LUKS uuid.
    pub passphrases: BTreeMap<String, String>,
}

impl BatchPolicy {
    /// Never initializes anything and knows no passphrases.
    pub fn cleanup() -> Self {
        Self::default()
    }
}

impl Policy for BatchPolicy {
    fn initialize_disk(&self, path_hint: &str, description: &str, size: Size) -> bool {
        debug!(
            "Answering {} to initializing '{path_hint}' ({description}, {size})",
            self.initialize_disks
        );
        self.initialize_disks
    }

    fn reinitialize_inconsistent_lvm(&self, pv_paths: &[String], vg_name: &str) -> bool {
        debug!(
            "Answering {} to reinitializing '{vg_name}' on [{}]",
            self.reinitialize_lvm,
            pv_paths.join(", ")
        );
        self.reinitialize_lvm
    }

    fn luks_passphrase(&self, _device: &str, uuid: Option<&str>) -> Option<String> {
        uuid.and_then(|uuid| self.passphrases.get(uuid)).cloned()
    }
}
