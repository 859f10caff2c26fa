mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    install_tracing(cli.global.debug);

    let result = match cli.command {
        Commands::Create(args) => commands::create::execute(args, &cli.global).await,
        Commands::Rm(args) => commands::rm::execute(args, &cli.global).await,
        Commands::Get(args) => commands::get::execute(args, &cli.global),
        Commands::Count => commands::count::execute(&cli.global),
        Commands::List => commands::list::execute(&cli.global),
        Commands::Images(args) => commands::images::execute(args, &cli.global),
        Commands::Sweep => commands::sweep::execute(&cli.global).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Stderr logging; stdout is reserved for command output.
fn install_tracing(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
