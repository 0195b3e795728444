use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "intake")]
#[command(about = "Queue a folder for upload, skipping duplicate files", long_about = None)]
pub struct Cli {
    /// Log at debug level unless TRACING_LEVEL says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Scan a folder, hash duplicate candidates and report the queue
    Scan {
        dir: PathBuf,
        /// Append the measured run timings to this CSV file
        #[arg(long)]
        timings_csv: Option<PathBuf>,
    },
    /// Show directory statistics and the time estimate without hashing
    Estimate { dir: PathBuf },
    /// Scan a folder and copy ready files into a content-addressed directory
    Upload {
        dir: PathBuf,
        #[arg(long)]
        dest: PathBuf,
    },
    /// Inspect or reset hardware calibration
    Calibration {
        #[command(subcommand)]
        action: CalibrationAction,
    },
    /// Print configuration values
    PrintConfig,
}

#[derive(Debug, Subcommand)]
pub enum CalibrationAction {
    /// List stored samples and the current factor
    Show,
    /// Forget all samples and fall back to the baseline
    Reset,
}
