use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coordfs", version, about = "coordfs client CLI")]
pub struct Cli {
    /// File-system config (YAML)
    #[arg(short, long)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a directory and any missing parents
    Mkdir { domain: String, path: String },
    /// List a directory
    Ls {
        domain: String,
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Upload a local file
    Put {
        source: PathBuf,
        domain: String,
        path: String,
        /// Keep the content lock after the upload
        #[arg(long)]
        keep_lock: bool,
    },
    /// Download a file to a local path
    Get {
        domain: String,
        path: String,
        target: PathBuf,
    },
    /// Delete a file or directory
    Rm {
        domain: String,
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Find files by name pattern (full-match regex)
    Find {
        domain: String,
        pattern: String,
        #[arg(long, default_value = "/")]
        path: String,
        /// Pattern for the parent directory path
        #[arg(long)]
        dir: Option<String>,
    },
    /// Print the inode record
    Stat { domain: String, path: String },
}
