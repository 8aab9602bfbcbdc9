use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};

use crate::dependencies::Dependency;

/// Attaches `file` to the first free loop device and returns its kernel
/// name, e.g. `loop0`.
pub fn attach(file: impl AsRef<Path>) -> Result<String, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--find")
        .arg("--show")
        .arg(file.as_ref())
        .output_and_check()
        .with_context(|| format!("Failed to attach '{}'", file.as_ref().display()))?;

    match Path::new(output.trim()).file_name() {
        Some(name) => Ok(name.to_string_lossy().into()),
        None => bail!("Unexpected losetup output '{}'", output.trim()),
    }
}

pub fn detach(name: &str) -> Result<(), Error> {
    Dependency::Losetup
        .cmd()
        .arg("--detach")
        .arg(PathBuf::from("/dev").join(name))
        .run_and_check()
        .with_context(|| format!("Failed to detach '{name}'"))
}

/// Kernel name of the loop device `file` is attached to, if any.
pub fn find(file: impl AsRef<Path>) -> Result<Option<String>, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--associated")
        .arg(file.as_ref())
        .output_and_check()
        .with_context(|| {
            format!(
                "Failed to look up loop device of '{}'",
                file.as_ref().display()
            )
        })?;
    Ok(parse_associated(&output))
}

/// Parses `/dev/loop0: [2049]:1234 (/var/tmp/disk.img)`.
fn parse_associated(output: &str) -> Option<String> {
    let device = output.lines().next()?.split(':').next()?;
    Path::new(device.trim())
        .file_name()
        .map(|name| name.to_string_lossy().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_associated() {
        assert_eq!(
            parse_associated("/dev/loop3: [2049]:1234 (/var/tmp/disk.img)\n"),
            Some("loop3".to_string())
        );
        assert_eq!(parse_associated(""), None);
    }
}
