use std::path::PathBuf;

use clap::Parser;

/// Demo cluster: starts every node in-process and drives transactions
/// through node 0.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Number of nodes; node `i` listens on localhost:3000+i.
    #[arg(long, default_value_t = 4)]
    pub nodes: u32,

    /// Deltas applied through node 0, one transaction each.
    #[arg(long, value_delimiter = ',', default_values_t = [1, 1, 1])]
    pub deltas: Vec<i64>,

    /// Directory for write-ahead logs and snapshots.
    #[arg(long, default_value = "./logs")]
    pub log_dir: PathBuf,
}
