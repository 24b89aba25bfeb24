mod generate;
mod logging;
mod show;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "global-mosaic")]
#[command(about = "Global imagery mosaic PMTiles generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Render coverage and imagery tiles of a collection into an archive
    Generate(Box<generate::Args>),
    /// Inspect a local archive
    Show(show::Args),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let error_log = match &cli.command {
        Commands::Generate(args) => args.error_log(),
        Commands::Show(_) => None,
    };
    logging::init(error_log)?;

    match cli.command {
        Commands::Generate(args) => generate::run(*args).await,
        Commands::Show(args) => show::run(&args),
    }
}
