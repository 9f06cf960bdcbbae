//! Command-line arguments. Flags override the config file.

use std::path::PathBuf;

use clap::Parser;

/// Send a file between two in-process beamdrop endpoints.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// File to send. Without it, `--size` random-looking bytes are generated
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Size of the generated payload in bytes
    #[arg(short, long, default_value_t = 1024 * 1024)]
    pub size: u64,

    /// Room code the host claims
    #[arg(short, long)]
    pub room: Option<String>,

    /// Config file path (default: ~/.config/beamdrop/config.json)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for streaming-mode backing files; omit to buffer in memory
    #[arg(long)]
    pub storage_root: Option<PathBuf>,

    /// Directory the guest's session snapshot is written to (default: ~/.config/beamdrop/state)
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// Chunk size in bytes
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Print the collected log entries as JSON when done
    #[arg(long, default_value = "false")]
    pub dump_logs: bool,
}
