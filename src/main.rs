use std::{panic, process::ExitCode};

use anyhow::{Context, Error};
use clap::Parser;
use log::{error, info, LevelFilter};

use devgraph::{
    cli::{Cli, Commands, OutputFormat},
    devicetree::DeviceTree,
    interface::{BatchPolicy, LogInterface},
    plan, report,
    system::{host::HostSystem, simulated::SimulatedSystem, BlockLayer},
    FileLog, MultiLogger,
};
use devgraph_api::error::{InternalError, ReportError, StorageError, StorageResultExt};

fn print_tree<S: BlockLayer>(tree: &DeviceTree<S>, output: OutputFormat) -> Result<(), StorageError> {
    match output {
        OutputFormat::Text => println!("{}", report::render_text(tree)),
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&report::device_reports(tree))
                .structured(InternalError::Internal("Failed to serialize device tree"))?;
            print!("{yaml}");
        }
    }
    Ok(())
}

fn run_devgraph(args: &Cli) -> Result<(), StorageError> {
    info!("Devgraph version: {}", devgraph::DEVGRAPH_VERSION);

    let res = panic::catch_unwind(|| match &args.command {
        Commands::Scan {
            descriptors,
            config,
            cleanup,
            output,
        } => {
            let config = devgraph::load_config(config.as_deref())?;
            let system = SimulatedSystem::new(devgraph::load_descriptors(descriptors)?);
            let mut tree = DeviceTree::new(system, config, Box::new(BatchPolicy::cleanup()));
            tree.populate(*cleanup)
                .message("Failed to populate device tree")?;
            print_tree(&tree, *output)
        }

        Commands::Plan {
            descriptors,
            actions,
            config,
            execute,
        } => {
            let config = devgraph::load_config(config.as_deref())?;
            let requests = plan::load_requests(actions)?;
            let system = SimulatedSystem::new(devgraph::load_descriptors(descriptors)?);
            let mut tree = DeviceTree::new(system, config, Box::new(BatchPolicy::cleanup()))
                .with_ui(Box::new(LogInterface));
            tree.populate(false)
                .message("Failed to populate device tree")?;
            tree.system_mut().clear_calls();

            plan::apply(&mut tree, &requests)?;
            tree.process_actions(!*execute)
                .message("Failed to process actions")?;
            for action in tree.actions() {
                println!("{action}");
            }
            if *execute {
                println!();
                for call in tree.system().calls() {
                    println!("{call}");
                }
            }
            Ok(())
        }

        Commands::HostScan { config, output } => {
            let config = devgraph::load_config(config.as_deref())?;
            let mut tree = DeviceTree::new(
                HostSystem::new(),
                config,
                Box::new(BatchPolicy::cleanup()),
            );
            tree.populate(true)
                .message("Failed to populate device tree")?;
            print_tree(&tree, *output)
        }
    });

    match res {
        Err(e) => Err(StorageError::new(InternalError::Panic(format!("{e:?}")))),
        Ok(r) => r.message(format!("Failed to execute '{}' command", args.command)),
    }
}

fn setup_logging(args: &Cli) -> Result<(), Error> {
    let mut multilogger = MultiLogger::new()
        // Add regular env_logger to output to stderr
        .with_logger(Box::new(
            env_logger::builder()
                .format_timestamp(None)
                .filter_level(args.verbosity)
                .build(),
        ))
        .with_max_level(args.verbosity);

    if let Some(ref path) = args.log_file {
        multilogger.add_logger(FileLog::new(path).with_max_level(args.verbosity).into_logger());
    }

    multilogger.init().context("Logger already registered")
}

fn setup_tracing(args: &Cli) -> Result<(), Error> {
    use tracing_subscriber::{filter, fmt::format::FmtSpan, layer::SubscriberExt, Layer};

    if args.verbosity < LevelFilter::Debug {
        return Ok(());
    }

    // Timings of the instrumented engine entry points, as JSON on stderr.
    let layer = tracing_subscriber::fmt::layer()
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .with_filter(filter::LevelFilter::INFO);

    tracing::subscriber::set_global_default(tracing_subscriber::Registry::default().with(layer))
        .context("Failed to set global default subscriber")
}

fn main() -> ExitCode {
    // Parse args
    let args = Cli::parse();

    // Initialize the loggers
    if let Err(e) = setup_logging(&args) {
        eprintln!("Failed to initialize logging: {e:?}");
        return ExitCode::from(1);
    }

    if let Err(e) = setup_tracing(&args) {
        error!("Failed to initialize tracing: {e:?}");
        return ExitCode::from(1);
    }

    if let Err(e) = run_devgraph(&args) {
        error!("Devgraph failed: {e:?}");
        return ExitCode::from(2);
    }
    ExitCode::SUCCESS
}
