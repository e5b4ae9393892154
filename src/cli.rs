use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "psf-field")]
#[command(about = "Fit a spatially varying PSF model across a focal plane", long_about = None)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Select stars, fit the PSF model and write the outputs
    Fit {
        /// YAML configuration file
        config: String,

        /// Configuration overrides as key.path=value
        overrides: Vec<String>,
    },

    /// Run only the star selector and list the selected stars
    Select {
        /// YAML configuration file
        config: String,

        /// Configuration overrides as key.path=value
        overrides: Vec<String>,

        /// Output format (table, json, csv)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Print the interpolated PSF shape at a focal-plane position
    Eval {
        /// Model file written by `fit`
        model: String,

        /// Focal-plane u coordinate
        #[arg(allow_hyphen_values = true)]
        u: f64,

        /// Focal-plane v coordinate
        #[arg(allow_hyphen_values = true)]
        v: f64,
    },
}
