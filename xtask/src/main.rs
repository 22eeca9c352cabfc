use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::Command;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Tasks for the project", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the project
    Build {
        /// Include the Bluetooth LE transport
        #[arg(long)]
        ble: bool,
    },
    /// Run the test suite
    Test,
    /// Flash a package onto the simulated device
    Simulate {
        firmware: PathBuf,
        /// Extra arguments passed to `dfu simulate`
        #[arg(last = true)]
        extra: Vec<String>,
    },
}

fn cargo(args: &[&str], what: &str) -> Result<()> {
    println!("{what}...");
    let status = Command::new("cargo").args(args).status()?;
    if !status.success() {
        anyhow::bail!("{what} failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Build { ble } => {
            if *ble {
                cargo(&["build", "--features", "dfu-cli/ble"], "Building project")
            } else {
                cargo(&["build"], "Building project")
            }
        }
        Commands::Test => cargo(&["test", "--workspace"], "Running tests"),
        Commands::Simulate { firmware, extra } => {
            let firmware = firmware.to_string_lossy();
            let mut args = vec!["run", "-p", "dfu-cli", "--", "simulate", firmware.as_ref()];
            args.extend(extra.iter().map(String::as_str));
            cargo(&args, "Running simulation")
        }
    }
}
