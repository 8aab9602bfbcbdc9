use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use crate::DEVGRAPH_VERSION;

#[derive(Parser, Debug)]
#[clap(version = DEVGRAPH_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Also write every log record as a JSON line to this file
    #[arg(global = true, long)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// How the resulting device tree is printed
#[derive(ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OutputFormat {
    #[default]
    Text,
    Yaml,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Populate a device tree from a descriptor file and print it
    Scan {
        /// YAML list of device descriptors
        #[clap(short, long)]
        descriptors: PathBuf,

        /// Scan configuration
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Only tear down what is found; never ask to initialize anything
        #[clap(long)]
        cleanup: bool,

        #[clap(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },

    /// Queue the requested actions on a scanned tree and print them in
    /// execution order
    Plan {
        /// YAML list of device descriptors
        #[clap(short, long)]
        descriptors: PathBuf,

        /// YAML list of action requests
        #[clap(short, long)]
        actions: PathBuf,

        /// Scan configuration
        #[clap(short, long)]
        config: Option<PathBuf>,

        /// Run the actions against the simulated system and print its calls
        #[clap(long)]
        execute: bool,
    },

    /// Populate a device tree from the running system and print it
    #[clap(name = "host-scan")]
    HostScan {
        /// Scan configuration
        #[clap(short, long)]
        config: Option<PathBuf>,

        #[clap(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

impl std::fmt::Display for Commands {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Commands::Scan { .. } => "scan",
            Commands::Plan { .. } => "plan",
            Commands::HostScan { .. } => "host-scan",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_plan() {
        let cli = Cli::parse_from([
            "devgraph",
            "-v",
            "debug",
            "plan",
            "--descriptors",
            "devices.yaml",
            "--actions",
            "plan.yaml",
            "--execute",
        ]);
        assert_eq!(cli.verbosity, LevelFilter::Debug);
        assert!(cli.log_file.is_none());
        let Commands::Plan {
            descriptors,
            actions,
            config,
            execute,
        } = cli.command
        else {
            panic!("expected the plan command");
        };
        assert_eq!(descriptors, PathBuf::from("devices.yaml"));
        assert_eq!(actions, PathBuf::from("plan.yaml"));
        assert!(config.is_none());
        assert!(execute);
    }

    #[test]
    fn test_parse_scan() {
        let cli = Cli::parse_from([
            "devgraph",
            "scan",
            "-d",
            "devices.yaml",
            "--cleanup",
            "--output",
            "yaml",
            "--log-file",
            "/tmp/devgraph.log",
        ]);
        assert_eq!(cli.log_file, Some(PathBuf::from("/tmp/devgraph.log")));
        assert_eq!(cli.command.to_string(), "scan");
        assert!(matches!(
            cli.command,
            Commands::Scan {
                cleanup: true,
                output: OutputFormat::Yaml,
                ..
            }
        ));

        assert!(Cli::try_parse_from(["devgraph", "scan"]).is_err());
        assert!(matches!(
            Cli::parse_from(["devgraph", "host-scan"]).command,
            Commands::HostScan {
                config: None,
                output: OutputFormat::Text
            }
        ));
    }
}
