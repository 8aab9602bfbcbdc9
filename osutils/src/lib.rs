pub mod blockdev;
pub mod cryptsetup;
pub mod dependencies;
pub mod dmraid;
pub mod dmsetup;
pub mod files;
pub mod losetup;
pub mod lsblk;
pub mod lvm;
pub mod mdadm;
pub mod mkfs;
pub mod mount;
pub mod multipath;
pub mod resize2fs;
pub mod sfdisk;
pub mod swap;
pub mod tune2fs;
pub mod udevadm;
pub mod wipefs;
