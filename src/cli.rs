//! Command-line interface definition for Weave

use clap::Parser;
use std::path::PathBuf;

/// Desktop image-generation orchestrator
#[derive(Parser, Debug, Default)]
#[command(name = "weave", version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "WEAVE_CONFIG")]
    pub config: Option<String>,

    /// Bind address for the HTTP listener (overrides config)
    #[arg(long, env = "WEAVE_BIND")]
    pub bind: Option<String>,

    /// Path to the compute worker binary (overrides config)
    #[arg(long, env = "WEAVE_WORKER")]
    pub worker: Option<PathBuf>,

    /// Run without a compute worker (chat only)
    #[arg(long)]
    pub no_worker: bool,

    /// Ollama host URL (overrides config)
    #[arg(long, env = "WEAVE_OLLAMA_HOST")]
    pub ollama_host: Option<String>,

    /// Model name (overrides config)
    #[arg(long, env = "WEAVE_MODEL")]
    pub model: Option<String>,
}

impl Cli {
    /// Parses CLI arguments from the process environment.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
