use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "converge")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "Plan and apply declarative infrastructure definitions", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to ./converge.toml, then ~/.config/converge/config.toml)
    #[arg(long, global = true, env = "CONVERGE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show what apply would change
    Plan(PlanArgs),

    /// Make remote objects match the definitions
    Apply(ApplyArgs),

    /// Check the definitions without planning
    Validate {
        /// Definition file or directory
        #[arg(default_value = ".")]
        dir: PathBuf,
    },

    /// Compare stored state with remote objects and flag drift
    Refresh,

    /// Inspect the state file
    #[command(subcommand)]
    State(StateCommand),

    /// Inspect or break the state lock
    #[command(subcommand)]
    Lock(LockCommand),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// ============================================================================
// Plan / Apply
// ============================================================================

#[derive(Parser)]
pub struct PlanArgs {
    /// Definition file or directory
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Save the plan for a later `apply --plan`
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    /// Plan the deletion of every managed resource
    #[arg(long)]
    pub destroy: bool,

    /// Check for drift before planning
    #[arg(long)]
    pub refresh: bool,
}

#[derive(Parser)]
pub struct ApplyArgs {
    /// Definition file or directory
    #[arg(default_value = ".")]
    pub dir: PathBuf,

    /// Apply a plan saved with `plan --out` instead of planning again
    #[arg(short, long, conflicts_with_all = ["destroy", "refresh"])]
    pub plan: Option<PathBuf>,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,

    /// Delete every managed resource
    #[arg(long)]
    pub destroy: bool,

    /// Check for drift before planning
    #[arg(long)]
    pub refresh: bool,

    /// Maximum concurrent provider calls
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Keep running independent actions after a failure
    #[arg(long)]
    pub keep_going: bool,
}

// ============================================================================
// State / Lock
// ============================================================================

#[derive(Subcommand)]
pub enum StateCommand {
    /// List managed resources
    List,

    /// Show the stored record of one resource
    Show {
        /// Resource key, e.g. network.vpc1
        key: String,
    },
}

#[derive(Subcommand)]
pub enum LockCommand {
    /// Show who holds the state lock
    Status,

    /// Remove a lock left behind by a crashed run
    ForceUnlock {
        /// Owner id as shown by `lock status`
        owner: String,

        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}
