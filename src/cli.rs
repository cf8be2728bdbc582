use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "imagetiles")]
#[command(author, version, about = "Image metadata store for the tiling service")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Database file (overrides database.path from the config)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply pending schema migrations
    Migrate,

    /// Show applied and pending schema migrations
    Status,

    /// Print the schema snapshot derived from the migration ledger
    Snapshot {
        /// Rewrite the cached snapshot from the ledger
        #[arg(long)]
        refresh: bool,
    },

    /// Register a new image file
    Create {
        /// Image filename (at most 50 characters)
        #[arg(long)]
        filename: String,

        /// Owning project
        #[arg(long)]
        project: String,

        /// Width in pixels
        #[arg(long, allow_negative_numbers = true)]
        width: i32,

        /// Height in pixels
        #[arg(long, allow_negative_numbers = true)]
        height: i32,

        /// Free-form description
        #[arg(long)]
        description: Option<String>,
    },

    /// Show one image file
    Get {
        /// Image file ID
        id: String,
    },

    /// Change fields of an image file
    Update(UpdateArgs),

    /// Delete an image file
    Delete {
        /// Image file ID
        id: String,
    },

    /// List image files
    List {
        /// Only show files owned by this project
        #[arg(long)]
        project: Option<String>,
    },

    /// List projects that own image files
    Projects,

    /// Validate configuration file
    Validate {
        /// Config file to validate (falls back to --config)
        file: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Image file ID
    pub id: String,

    #[arg(long)]
    pub filename: Option<String>,

    #[arg(long)]
    pub project: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    pub width: Option<i32>,

    #[arg(long, allow_negative_numbers = true)]
    pub height: Option<i32>,

    #[arg(long, conflicts_with = "clear_description")]
    pub description: Option<String>,

    /// Remove the description
    #[arg(long)]
    pub clear_description: bool,
}
