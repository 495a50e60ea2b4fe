use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, PartialEq)]
#[command(
    about,
    version,
    after_help = "Use the RUST_LOG environment variable to control logging, e.g. RUST_LOG=debug or RUST_LOG=tileforge=debug."
)]
pub struct Args {
    /// Host name or IP address to listen on.
    pub host: String,

    #[command(subcommand)]
    pub config: ConfigArgs,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigArgs {
    /// Load configuration from a JSON file.
    Json {
        /// Path to the configuration file.
        path: PathBuf,
    },
    /// Watch configuration in a key-value cluster registry.
    Etcd {
        /// Registry host to connect to.
        host: String,
    },
}
