use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "skyflowd", version, about = "skyflow control-plane daemon")]
pub struct SkyflowD {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Override the listen port.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Override the database path.
    #[arg(long)]
    pub database: Option<PathBuf>,
}
