use const_format::formatcp;

use crate::primitives::size::Size;

// Persisted state

/// Directory holding system configuration that population rewrites.
pub const ETC_DIRECTORY: &str = "/etc";

/// mdadm configuration, appended with array hints during population.
pub const MDADM_CONF_PATH: &str = formatcp!("{ETC_DIRECTORY}/mdadm.conf");

/// multipath configuration, rewritten on every population pass.
pub const MULTIPATH_CONF_PATH: &str = formatcp!("{ETC_DIRECTORY}/multipath.conf");

/// multipath alias bindings.
pub const MULTIPATH_BINDINGS_PATH: &str = formatcp!("{ETC_DIRECTORY}/multipath/bindings");

/// Suffix of configuration backups taken before population.
pub const CONFIG_BACKUP_SUFFIX: &str = ".devgraph-bak";

// Device node layout

pub const DEV_DIRECTORY: &str = "/dev";

pub const DEV_MAPPER_DIRECTORY: &str = formatcp!("{DEV_DIRECTORY}/mapper");

/// sysfs location of virtual block devices such as MD arrays.
pub const SYSFS_VIRTUAL_BLOCK: &str = "/devices/virtual/block";

// Size constants

/// Space reserved for the LUKS header on an unprobed mapping.
pub const LUKS_METADATA_SIZE: Size = Size::from_mib(2);

/// Default LVM physical extent size.
pub const LVM_PE_SIZE: Size = Size::from_mib(32);

/// Default MD chunk size.
pub const MD_CHUNK_SIZE: Size = Size::from_kib(512);

/// Space reserved for the MD superblock on each member.
pub const MD_SUPERBLOCK_SIZE: Size = Size::from_mib(2);

/// MD arrays smaller than this get no write-intent bitmap.
pub const MD_BITMAP_MIN_SIZE: Size = Size::from_mib(1000);

/// Default size of a new partition when none is requested.
pub const DEFAULT_PARTITION_SIZE: Size = Size::from_mib(500);

/// Smallest vfat filesystem on a bootable partition that is treated as an
/// EFI system partition.
pub const EFI_MIN_SIZE: Size = Size::from_mib(50);

/// Largest vfat filesystem on a bootable partition that is treated as an
/// EFI system partition.
pub const EFI_MAX_SIZE: Size = Size::from_mib(256);

// Metadata

pub const MD_DEFAULT_METADATA: &str = "1.1";

/// Metadata version readable by bootloaders.
pub const MD_BOOT_METADATA: &str = "1.0";

pub const BOOT_MOUNT_POINT: &str = "/boot";

pub const EFI_MOUNT_POINT: &str = "/boot/efi";

/// Prefix of device-mapper uuids created for disk images.
pub const DM_INTERNAL_UUID_PREFIX: &str = "DEVGRAPH-";

/// Prefix of LUKS mapping names.
pub const LUKS_MAP_PREFIX: &str = "luks-";

/// Device-mapper maps belonging to a running live image.
pub const LIVE_DM_NAMES: [&str; 3] = ["live-rw", "live-base", "live-osimg-min"];

/// Format types reported for firmware RAID members.
pub const DMRAID_MEMBER_TYPES: [&str; 10] = [
    "adaptec_raid_member",
    "ddf_raid_member",
    "highpoint_raid_member",
    "isw_raid_member",
    "jmicron_raid_member",
    "lsi_mega_raid_member",
    "nvidia_raid_member",
    "promise_fasttrack_raid_member",
    "silicon_medley_raid_member",
    "via_raid_member",
];

/// LVM attribute characters of internal volumes never exposed as devices.
pub const LVM_INTERNAL_LV_ATTRS: [char; 4] = ['I', 'i', 'l', 'v'];

/// Placeholder passphrase used in cleanup mode for already opened mappings.
pub const CLEANUP_LUKS_PASSPHRASE: &str = "cleanup";
