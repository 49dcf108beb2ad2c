//! daq binary - crate run controller
//!
//! Usage:
//!   cargo run --bin daq
//!   cargo run --bin daq -- --config crate.toml
//!   cargo run --bin daq -- --fdir /data --prefix exp --thresh 25

use clap::Parser;
use pixie_daq::common::{ControlFlags, DaqArgs};
use pixie_daq::config::CrateConfig;
use pixie_daq::controller::{CommandExit, RunController};
use pixie_daq::hardware::EmulatedInterface;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pixie_daq=info".parse()?))
        .init();

    let args = DaqArgs::parse();

    let mut config = match &args.config_file {
        Some(path) => CrateConfig::load(path)?,
        None => CrateConfig::default(),
    };
    if let Some(directory) = &args.output_dir {
        config.output.directory = directory.clone();
    }
    if let Some(prefix) = &args.prefix {
        config.output.prefix = prefix.clone();
    }
    if let Some(percent) = args.thresh {
        anyhow::ensure!(
            (0.0..=100.0).contains(&percent),
            "threshold percentage must be within 0..=100"
        );
        config.fifo.thresh_percent = percent;
    }
    config.validate()?;

    info!(
        modules = config.modules.count,
        channels = config.modules.channels,
        endpoint = %config.broadcast.endpoint,
        thresh_words = config.fifo.thresh_words(),
        "crate configuration"
    );

    let interface = Box::new(EmulatedInterface::new(&config));
    let mut controller = RunController::new(config, interface);

    {
        let flags = &controller.shared().flags;
        ControlFlags::set(&flags.quiet, args.quiet);
        ControlFlags::set(&flags.debug, args.debug);
        ControlFlags::set(&flags.boot_fast, args.fast_boot);
    }

    controller.initialize()?;
    println!("Crate booted. Type 'help' for the command list.");

    match controller.run().await? {
        CommandExit::Clean => Ok(()),
        CommandExit::Fault => std::process::exit(1),
    }
}
