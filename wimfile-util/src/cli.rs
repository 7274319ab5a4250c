use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "wimfile-util")]
#[command(about = "WIM archive inspection utility", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Display header information about a WIM file
    Info {
        /// Path to the WIM file
        #[arg(value_name = "WIM_FILE")]
        wim_path: PathBuf,
    },

    /// List the streams stored in a WIM file
    List {
        /// Path to the WIM file
        #[arg(value_name = "WIM_FILE")]
        wim_path: PathBuf,

        /// Also list per-image metadata streams
        #[arg(short, long)]
        metadata: bool,
    },

    /// Verify the integrity table of a WIM file
    Verify {
        /// Path to the WIM file
        #[arg(value_name = "WIM_FILE")]
        wim_path: PathBuf,

        /// Suppress the progress bar
        #[arg(short, long)]
        quiet: bool,
    },
}
