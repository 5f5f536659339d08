use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rwl::commands::{self, util::BrokenPipeGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rwl")]
#[command(about = "Workload resources for a supply-chain cluster", long_about = None)]
#[command(version)]
struct Cli {
	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Apply configuration to a new or existing workload
	Apply(commands::apply::ApplyArgs),
}

/// Initialize tracing with logfmt output format
fn init_logger(debug: bool) {
	let level = if debug { "debug" } else { "info" };
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

	tracing_subscriber::registry()
		.with(filter)
		.with(tracing_logfmt::layer())
		.init();
}

fn main() -> Result<ExitCode> {
	let cli = Cli::parse();

	let stdout = BrokenPipeGuard::new(std::io::stdout());

	match cli.command {
		Commands::Apply(args) => {
			init_logger(args.debug);
			commands::apply::run(args, stdout)
		}
	}
}
