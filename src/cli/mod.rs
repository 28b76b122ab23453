pub mod onboard;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "Habitory", about = "Habit tracking with streaks and completions")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Onboard,
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Sign in as the given user id.
    Login { user_id: String },
    Logout,
    Whoami,
    Status,
    Doctor,
    /// Run the HTTP API in the foreground.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    Habits {
        #[command(subcommand)]
        command: HabitCommands,
    },
    Stats {
        #[arg(long, default_value = "weekly")]
        timeframe: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Recompute stored streaks from completion history.
    Reconcile,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommands {
    Set { key: String, value: String },
    Get { key: String },
}

#[derive(Debug, Subcommand)]
pub enum HabitCommands {
    List {
        /// all|daily|weekly|monthly
        #[arg(long, default_value = "all")]
        frequency: String,
        /// all|completed|pending
        #[arg(long, default_value = "all")]
        status: String,
    },
    Add {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, default_value = "daily")]
        frequency: String,
        #[arg(long)]
        color: Option<String>,
    },
    Edit {
        id: String,
        #[arg(long)]
        title: Option<String>,
        /// Pass an empty string to clear.
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        frequency: Option<String>,
        /// Pass an empty string to clear.
        #[arg(long)]
        color: Option<String>,
    },
    Delete {
        id: String,
    },
    /// Mark today's completion, or undo it if already done.
    Toggle {
        id: String,
    },
    /// Show today's completion state for the given habits.
    Check {
        ids: Vec<String>,
    },
    History {
        id: String,
    },
    /// Keep a live view of the board until Ctrl+C.
    Watch {
        #[arg(long, default_value = "all")]
        frequency: String,
        #[arg(long, default_value = "all")]
        status: String,
    },
}
