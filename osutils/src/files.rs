use std::{
    fs::{File, OpenOptions, Permissions},
    io::Write,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Error};
use log::debug;

/// Creates a file and all parent directories if they don't exist
pub fn create_file<S>(path: S) -> Result<File, Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    File::create(path.as_ref()).context(format!(
        "Could not create file: {}",
        path.as_ref().display()
    ))
}

/// Creates all directories in a path if they don't exist
pub fn create_dirs<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::create_dir_all(path.as_ref()).context(format!(
        "Could not create path: {}",
        path.as_ref().display()
    ))
}

/// Writes to a file, replacing its contents
pub fn write_file<S>(path: S, mode: u32, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let mut file = create_file(path.as_ref())?;
    std::fs::set_permissions(path.as_ref(), Permissions::from_mode(mode)).context(format!(
        "Could not set permissions {:#o} for file {}",
        mode,
        path.as_ref().display()
    ))?;

    file.write_all(contents).context(format!(
        "Could not write to file: {}",
        path.as_ref().display()
    ))
}

/// Appends to a file, creating it if needed
pub fn append_file<S>(path: S, contents: &[u8]) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    if let Some(parent) = path.as_ref().parent() {
        create_dirs(parent)?;
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())
        .and_then(|mut file| file.write_all(contents))
        .context(format!(
            "Could not append to file: {}",
            path.as_ref().display()
        ))
}

/// Creates a sparse file of `size` bytes filled with zeros
pub fn create_zero_file<S>(path: S, size: u64) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.is_absolute() {
        bail!("Path is not absolute: {}", path.display());
    }

    create_file(path)?
        .set_len(size)
        .context(format!("Could not size file: {}", path.display()))
}

pub fn remove_file<S>(path: S) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    std::fs::remove_file(path.as_ref()).context(format!(
        "Failed to remove file: {}",
        path.as_ref().display()
    ))
}

fn backup_path(path: &Path, suffix: &str) -> PathBuf {
    let mut backup = path.as_os_str().to_owned();
    backup.push(suffix);
    PathBuf::from(backup)
}

/// Copies `path` next to itself with `suffix` appended. Returns false when
/// there was nothing to back up.
pub fn backup_file<S>(path: S, suffix: &str) -> Result<bool, Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Ok(false);
    }

    let backup = backup_path(path, suffix);
    debug!("Backing up '{}' to '{}'", path.display(), backup.display());
    std::fs::copy(path, &backup).context(format!(
        "Failed to back up {} to {}",
        path.display(),
        backup.display()
    ))?;
    Ok(true)
}

/// Undoes [`backup_file`]: moves the backup over `path`, or removes `path`
/// when no backup was taken.
pub fn restore_file<S>(path: S, suffix: &str, backed_up: bool) -> Result<(), Error>
where
    S: AsRef<Path>,
{
    let path = path.as_ref();
    if backed_up {
        let backup = backup_path(path, suffix);
        std::fs::rename(&backup, path).context(format!(
            "Failed to restore {} from {}",
            path.display(),
            backup.display()
        ))
    } else if path.exists() {
        remove_file(path)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::tempdir;

    #[test]
    fn test_write_and_append() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc/mdadm.conf");

        write_file(&path, 0o644, b"# header\n").unwrap();
        append_file(&path, b"ARRAY /dev/md0 UUID=abcd\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "# header\nARRAY /dev/md0 UUID=abcd\n"
        );
        assert_eq!(
            std::fs::metadata(&path).unwrap().permissions().mode() & 0o777,
            0o644
        );
    }

    #[test]
    fn test_create_zero_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk.img");

        create_zero_file(&path, 1 << 20).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1 << 20);

        assert!(create_zero_file("relative.img", 512).is_err());
    }

    #[test]
    fn test_backup_and_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("multipath.conf");

        // Nothing to back up, restore removes what was written since
        assert!(!backup_file(&path, ".bak").unwrap());
        std::fs::write(&path, "new").unwrap();
        restore_file(&path, ".bak", false).unwrap();
        assert!(!path.exists());

        std::fs::write(&path, "original").unwrap();
        assert!(backup_file(&path, ".bak").unwrap());
        std::fs::write(&path, "rewritten").unwrap();
        restore_file(&path, ".bak", true).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
        assert!(!dir.path().join("multipath.conf.bak").exists());
    }
}
