use std::{collections::BTreeMap, fmt::Write as _};

use anyhow::{Context, Error};
use lazy_static::lazy_static;
use regex::Regex;

use crate::dependencies::Dependency;

const CONFIG_HEADER: &str = "\
# multipath.conf written by devgraph

defaults {
\tuser_friendly_names yes
}
blacklist {
\tdevnode \"^(ram|raw|loop|fd|md|dm-|sr|scd|st)[0-9]*\"
\tdevnode \"^hd[a-z]\"
\tdevnode \"^dcssblk[0-9]*\"
\tdevice {
\t\tvendor \"DGC\"
\t\tproduct \"LUNZ\"
\t}
\tdevice {
\t\tvendor \"IBM\"
\t\tproduct \"S/390.*\"
\t}
\t# don't count normal SATA devices as multipaths
\tdevice {
\t\tvendor  \"ATA\"
\t}
\t# don't count 3ware devices as multipaths
\tdevice {
\t\tvendor  \"3ware\"
\t}
\tdevice {
\t\tvendor  \"AMCC\"
\t}
\t# nor highpoint devices
\tdevice {
\t\tvendor  \"HPT\"
\t}
";

/// A device excluded from multipath assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlacklistEntry {
    Wwid(String),
    Device { vendor: String, model: String },
}

/// A `multipath { ... }` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipathEntry {
    pub wwid: String,
    pub alias: String,
    pub mode: String,
    pub uid: u32,
    pub gid: u32,
}

impl MultipathEntry {
    pub fn new(wwid: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            wwid: wwid.into(),
            alias: alias.into(),
            mode: "0600".into(),
            uid: 0,
            gid: 0,
        }
    }
}

/// Renders `multipath.conf` and the bindings file.
#[derive(Debug, Default, Clone)]
pub struct ConfigWriter {
    blacklist: Vec<BlacklistEntry>,
    multipaths: Vec<MultipathEntry>,
}

impl ConfigWriter {
    pub fn blacklist(&mut self, entry: BlacklistEntry) {
        self.blacklist.push(entry);
    }

    pub fn add_multipath(&mut self, entry: MultipathEntry) {
        self.multipaths.push(entry);
    }

    pub fn render(&self) -> String {
        let mut conf = String::from(CONFIG_HEADER);
        for entry in &self.blacklist {
            match entry {
                BlacklistEntry::Wwid(wwid) => {
                    let _ = writeln!(conf, "\twwid \"{wwid}\"");
                }
                BlacklistEntry::Device { vendor, model } => {
                    let _ = writeln!(conf, "\tdevice {{\n\t\tvendor {vendor}\n\t\tproduct {model}\n\t}}");
                }
            }
        }

        if !self.multipaths.is_empty() {
            conf += "\twwid \"*\"\n}\nblacklist_exceptions {\n";
            for mpath in &self.multipaths {
                let _ = writeln!(conf, "\twwid \"{}\"", mpath.wwid);
            }
        }
        conf += "}\nmultipaths {\n";
        for mpath in &self.multipaths {
            let _ = writeln!(
                conf,
                "\tmultipath {{\n\t\twwid \"{}\"\n\t\talias {}\n\t\tmode {}\n\t\tuid {}\n\t\tgid {}\n\t}}",
                mpath.wwid, mpath.alias, mpath.mode, mpath.uid, mpath.gid
            );
        }
        conf += "}\n";
        conf
    }

    pub fn render_bindings(&self) -> String {
        let mut bindings = String::from("# created by devgraph\n");
        for mpath in &self.multipaths {
            let _ = writeln!(bindings, "{} {}", mpath.alias, mpath.wwid);
        }
        bindings
    }
}

/// Builds the map for `name` from its paths.
pub fn activate(name: &str) -> Result<(), Error> {
    Dependency::Multipath
        .cmd()
        .arg(name)
        .run_and_check()
        .with_context(|| format!("Failed to set up multipath device '{name}'"))
}

pub fn flush(name: &str) -> Result<(), Error> {
    Dependency::Multipath
        .cmd()
        .arg("-f")
        .arg(name)
        .run_and_check()
        .with_context(|| format!("Failed to flush multipath device '{name}'"))
}

/// Multipath names mapped to their member device names, combining the
/// dry-run view with the assembled one. Single-path maps are dropped.
pub fn topology() -> Result<BTreeMap<String, Vec<String>>, Error> {
    let mut topology = BTreeMap::new();
    for flag in ["-d", "-ll"] {
        let output = Dependency::Multipath
            .cmd()
            .arg(flag)
            .output()
            .context("Failed to query multipath topology")?;
        topology.extend(parse_topology(&output.output()));
    }
    topology.retain(|_, members: &mut Vec<String>| members.len() > 1);
    Ok(topology)
}

lazy_static! {
    static ref POLICY_REGEX: Regex = Regex::new(r"^[|+` -]+policy").unwrap();
    static ref DEVICE_REGEX: Regex =
        Regex::new(r"^[|+` -]+[0-9]+:[0-9]+:[0-9]+:[0-9]+ ([a-zA-Z0-9!/]+)").unwrap();
    static ref CREATE_REGEX: Regex = Regex::new(r"^(create: )?(mpath\w+)").unwrap();
}

fn parse_topology(output: &str) -> BTreeMap<String, Vec<String>> {
    let mut mpaths = BTreeMap::new();
    let mut name: Option<String> = None;
    let mut devices = Vec::new();

    for line in output.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(mpath) = CREATE_REGEX.captures(line).and_then(|c| c.get(2)) {
            if let Some(previous) = name.take() {
                if !devices.is_empty() {
                    mpaths.insert(previous, std::mem::take(&mut devices));
                }
            }
            devices.clear();
            name = Some(mpath.as_str().to_string());
        } else if line.trim_start().starts_with("size=") || POLICY_REGEX.is_match(line) {
            continue;
        } else if let Some(device) = DEVICE_REGEX.captures(line).and_then(|c| c.get(1)) {
            devices.push(device.as_str().replace('!', "/"));
        }
    }

    if let Some(name) = name {
        if !devices.is_empty() {
            mpaths.insert(name, devices);
        }
    }

    mpaths
}
