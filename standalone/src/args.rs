use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(version, about = "Run a workload on an in-process grid", long_about = None)]
pub struct Args {
    /// Name of the workload to run (vertex-degree, word-count, pi).
    #[arg(short, long, default_value = "vertex-degree")]
    pub workload: String,

    /// Input file of line-oriented workloads.
    #[arg(short, long)]
    pub input: Option<PathBuf>,

    /// Number of worker nodes to start.
    #[arg(short = 'n', long, default_value = "4")]
    pub workers: usize,

    /// Lines of input per task.
    #[arg(short, long, default_value = "1000")]
    pub chunk_lines: usize,

    /// Tasks of sampling workloads.
    #[arg(short, long, default_value = "100")]
    pub rounds: u64,

    /// Samples per task of sampling workloads.
    #[arg(short, long, default_value = "10000")]
    pub samples: u64,

    /// Give up on the job after this many seconds.
    #[arg(short, long, default_value = "60")]
    pub timeout: u64,

    /// Cluster id jobs are tagged with.
    #[arg(long, default_value = "local")]
    pub cluster: String,
}
