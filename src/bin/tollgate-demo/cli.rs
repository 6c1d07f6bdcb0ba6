//! CLI definition for tollgate-demo.

use clap::Parser;
use std::path::PathBuf;

/// Demo discussion server with an L402 toll on replies.
#[derive(Parser, Debug)]
#[command(name = "tollgate-demo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 8402)]
    pub port: u16,

    /// Macaroon HMAC secret. The default is for local play only.
    #[arg(long, default_value = "tollgate-demo-secret")]
    pub secret: String,

    /// Path to a TOML configuration file; flags override it.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Base toll in sats for a first reply.
    #[arg(long)]
    pub base_sats: Option<u64>,

    /// Log level for the demo process.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
