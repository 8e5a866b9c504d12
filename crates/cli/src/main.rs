use clap::Parser;
use courier_cli::cli::Cli;
use courier_cli::{commands, config, logging};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	let settings = match config::load(cli.config.as_deref(), &cli.overrides()) {
		Ok(settings) => settings,
		Err(err) => {
			error!(target = "courier", error = %err, "invalid configuration");
			eprintln!("error: {err:#}");
			std::process::exit(2);
		}
	};

	if let Err(err) = commands::dispatch(cli.command, settings).await {
		error!(target = "courier", error = %err, "command failed");
		eprintln!("error: {err:#}");
		std::process::exit(1);
	}
}
