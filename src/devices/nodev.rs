//! Devices without a block node: NFS exports and pseudo filesystems.

use anyhow::{Context, Error};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NfsInfo {
    pub host: String,
    pub export: String,
}

impl NfsInfo {
    /// Parses a `host:/export` spec.
    pub fn from_spec(spec: &str) -> Result<Self, Error> {
        let (host, export) = spec
            .split_once(':')
            .with_context(|| format!("NFS spec '{spec}' is not of the form host:/export"))?;
        Ok(Self {
            host: host.to_string(),
            export: export.to_string(),
        })
    }

    pub fn spec(&self) -> String {
        format!("{}:{}", self.host, self.export)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::devices::{DeviceKind, Devices};

    #[test]
    fn test_nfs_spec() {
        let info = NfsInfo::from_spec("server.example.com:/srv/root").unwrap();
        assert_eq!(info.host, "server.example.com");
        assert_eq!(info.export, "/srv/root");
        assert!(NfsInfo::from_spec("server").is_err());

        let mut devices = Devices::new();
        let nfs = devices.add(info.spec(), DeviceKind::Nfs(info));
        assert_eq!(devices[nfs].type_name(), "nfs");
        assert_eq!(devices.path(nfs).display().to_string(), "server.example.com:/srv/root");
        assert_eq!(devices.packages(nfs), vec!["dracut-network"]);
    }

    #[test]
    fn test_pseudo_filesystems() {
        let mut devices = Devices::new();
        let tmpfs = devices.add("tmpfs", DeviceKind::NoDevice);
        devices[tmpfs].exists = true;
        let mut system = crate::system::simulated::SimulatedSystem::default();
        assert!(!devices.status(tmpfs, &system));
        devices.setup(tmpfs, &mut system, false).unwrap();
        assert!(system.calls().is_empty());
        assert_eq!(devices.path(tmpfs).display().to_string(), "tmpfs");
    }
}
