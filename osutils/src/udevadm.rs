use anyhow::{Context, Error};

use crate::dependencies::Dependency;

/// Waits for the udev event queue to drain, bounded by udevadm's own
/// timeout.
pub fn settle() -> Result<(), Error> {
    Dependency::Udevadm
        .cmd()
        .arg("settle")
        .arg("--timeout=300")
        .run_and_check()
        .context("Failed settle udev setup")
}

#[cfg(all(test, feature = "functional-test"))]
mod functional_test {
    use super::*;

    #[test]
    fn test_settle() {
        settle().unwrap();
    }
}
