use crate::prelude::*;
use crate::stress::{self, StressArgs};
use clap::{Parser, Subcommand};
use iotrace_shared::VersionInfo;

#[derive(Parser, Debug)]
#[command(name = "iotrace")]
#[command(version, about = "Capture block I/O events into per-CPU trace buffers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the event format version descriptor
    Version,
    /// Run a synthetic capture session and verify the delivered event stream
    Stress(StressArgs),
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => print!("{}", VersionInfo::current()),
        Commands::Stress(args) => stress::run(args)?,
    }
    Ok(())
}
