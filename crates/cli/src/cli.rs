use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};

/// Bulk cache loading driver.
///
/// Runs loads against a synthetic in-memory object model so thread pool,
/// stripe and task sizing can be tried out without a database.
#[derive(Parser, Debug)]
#[command(name = "preload-cli", about = "Bulk cache loading driver")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load Contract records and the Products they reference, then print the monitor as JSON
    Run(RunArgs),
    /// Parse a plan file and list what it would load
    CheckPlan {
        /// Plan TOML with [[top_level]] and [[dependent]] entries
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Number of synthetic Contract records
    #[arg(long, default_value = "100000")]
    pub owners: i64,

    /// Number of distinct Products referenced by the contracts
    #[arg(long, default_value = "30000")]
    pub products: i64,

    /// Loader config TOML (env overrides apply on top)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Worker threads per database
    #[arg(long)]
    pub threads: Option<usize>,

    /// Dependent keys per spawned task
    #[arg(long)]
    pub task_size: Option<usize>,

    /// Owner records per dependent stripe
    #[arg(long)]
    pub stripe_size: Option<usize>,

    /// Business dates to load (contracts become dated); repeatable
    #[arg(long = "business-date")]
    pub business_dates: Vec<NaiveDate>,

    /// Plan TOML to run instead of the built-in Contract -> Product plan
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Print only the summary instead of the full monitor
    #[arg(long)]
    pub summary: bool,
}
