use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "judger", about = "Online judge evaluation fleet")]
pub struct Opts {
    #[command(subcommand)]
    pub cmd: SubCmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum SubCmd {
    /// Run the manager node: task intake, executor table and dispatcher
    #[command(name = "manager")]
    Manager(ManagerSubCmd),

    /// Run an executor node: judgment intake and heartbeat reporter
    #[command(name = "executor")]
    Executor(ExecutorSubCmd),

    /// Run the evaluation pipeline for a single judgment. Spawned by the
    /// executor as a child process, not meant to be invoked by hand.
    #[command(name = "validate", hide = true)]
    Validate(ValidateSubCmd),
}

#[derive(Args, Debug, Clone)]
pub struct ManagerSubCmd {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 10010)]
    pub port: u16,

    /// Enable debug-level logging
    #[arg(long)]
    pub debug: bool,

    /// Number of runtime worker threads
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ExecutorSubCmd {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 10011)]
    pub port: u16,

    /// Enable debug-level logging
    #[arg(long)]
    pub debug: bool,

    /// Number of runtime worker threads
    #[arg(long, default_value_t = 1)]
    pub workers: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateSubCmd {
    /// Judgment this pipeline run reports against
    pub judgment_id: i64,

    /// Working directory holding the template with the submission overlaid
    pub working_dir: PathBuf,

    /// Autograder unit test to run after the build
    #[arg(long)]
    pub unit_test: Option<String>,

    /// Function requirements to extract, as a JSON array
    #[arg(long)]
    pub function_requirements: Option<String>,

    /// Enable debug-level logging
    #[arg(long)]
    pub debug: bool,
}
