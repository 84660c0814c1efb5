mod cmd;
mod logger;

use clap::{ArgAction, Parser, Subcommand};
use pebridge::bootstrap;

#[derive(Parser)]
#[command(name = "pebridge", version, about = "Builtin module loader")]
struct Cli {
    /// More log output, repeat for more
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(flatten)]
    opts: cmd::LoaderOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Load(cmd::load::Cmd),
    Exports(cmd::exports::Cmd),
    Run(cmd::run::Cmd),
}

fn main() {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let result = match &cli.command {
        Commands::Load(cmd) => cmd.execute(&cli.opts),
        Commands::Exports(cmd) => cmd.execute(&cli.opts),
        Commands::Run(cmd) => cmd.execute(&cli.opts),
    };
    if let Err(e) = result {
        bootstrap::fatal(e);
    }
}
