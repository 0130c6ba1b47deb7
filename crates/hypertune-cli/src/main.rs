//! Hypertune CLI - Hypernetwork Management
//!
//! Lists, inspects, creates and looks up hypernetwork files.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

/// Hypertune - cross-attention hypernetworks
#[derive(Parser)]
#[command(name = "hypertune")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Hypernetwork directory (defaults to the user data directory)
    #[arg(short, long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available hypernetworks
    List,

    /// Show hypernetwork details
    Info { name: String },

    /// Create a new, untrained hypernetwork
    Create {
        name: String,

        /// Attention context widths to create blocks for
        #[arg(short, long, value_delimiter = ',', default_value = "320,640,768,1280")]
        sizes: Vec<usize>,

        /// Layer multiplier sequence, starting and ending with 1
        #[arg(short, long, value_delimiter = ',')]
        multipliers: Option<Vec<f64>>,

        /// Replace an existing file of the same name
        #[arg(long)]
        overwrite: bool,
    },

    /// Find the closest hypernetwork name for a search term
    Find { term: String },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_ansi(!cli.no_color)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let registry = commands::open_registry(cli.dir);

    match cli.command {
        Commands::List => commands::hypernetwork::list(&registry),
        Commands::Info { name } => commands::hypernetwork::info(&registry, &name)?,
        Commands::Create {
            name,
            sizes,
            multipliers,
            overwrite,
        } => commands::hypernetwork::create(
            &registry,
            &name,
            &sizes,
            multipliers.as_deref(),
            overwrite,
        )?,
        Commands::Find { term } => commands::hypernetwork::find(&registry, &term),
    }

    Ok(())
}
