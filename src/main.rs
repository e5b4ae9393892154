mod cli;
mod commands;

use clap::Parser;

use cli::{Cli, Commands};
use commands::{eval_model, run_fit, run_select};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Fit { config, overrides } => {
            run_fit(&config, &overrides, cli.verbose)?;
        }
        Commands::Select {
            config,
            overrides,
            format,
        } => {
            run_select(&config, &overrides, cli.verbose, &format)?;
        }
        Commands::Eval { model, u, v } => {
            psf_field::logging::init_logging(cli.verbose);
            eval_model(&model, u, v)?;
        }
    }

    Ok(())
}
