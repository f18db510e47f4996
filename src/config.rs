//! CLI arguments and configuration defaults for the server and client binaries.

use clap::{Parser, Subcommand};
use shadow_rs::formatcp;
use std::path::PathBuf;

use crate::build;

pub const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const DEFAULT_STORAGE_DIR: &str = "received_files";
pub const DEFAULT_MAX_CONTENT_LENGTH: u64 = 16 * 1024 * 1024;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_BASE_URL: &str = "http://localhost:5000";
pub const SERVER_LOG_FILE: &str = "server.log";
pub const CLIENT_LOG_FILE: &str = "client.log";
pub const DOWNLOAD_CHUNK_SIZE: usize = 8192;
pub const SHUTDOWN_GRACE_SECS: u64 = 10;

/// CLI arguments and environment configuration for the transfer server.
#[derive(Parser, Debug)]
#[command(name = "transfer-server", version = VERSION_INFO, about = "HTTP file transfer server")]
pub struct ServerArgs {
    #[arg(
        short = 's',
        long,
        env = "TRANSFER_STORAGE_DIR",
        default_value = DEFAULT_STORAGE_DIR,
        help = "Directory where uploaded files are stored"
    )]
    pub storage_dir: PathBuf,
    #[arg(
        short = 'm',
        long,
        env = "TRANSFER_MAX_CONTENT_LENGTH",
        default_value_t = DEFAULT_MAX_CONTENT_LENGTH,
        help = "Max request body size in bytes"
    )]
    pub max_content_length: u64,
    #[arg(
        short = 'b',
        long,
        env = "TRANSFER_BIND",
        default_value = DEFAULT_BIND,
        help = "Bind address"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "TRANSFER_PORT",
        default_value_t = DEFAULT_PORT,
        help = "HTTP port"
    )]
    pub port: u16,
    #[arg(
        long,
        env = "TRANSFER_SERVER_LOG",
        default_value = SERVER_LOG_FILE,
        help = "Append-only log file"
    )]
    pub log_file: PathBuf,
}

/// CLI arguments for the transfer client.
#[derive(Parser, Debug)]
#[command(name = "transfer-client", version = VERSION_INFO, about = "HTTP file transfer client")]
pub struct ClientArgs {
    #[arg(
        short = 'u',
        long,
        env = "TRANSFER_BASE_URL",
        default_value = DEFAULT_BASE_URL,
        help = "Base URL of the transfer server"
    )]
    pub base_url: String,
    #[arg(
        long,
        env = "TRANSFER_CLIENT_LOG",
        default_value = CLIENT_LOG_FILE,
        help = "Append-only log file"
    )]
    pub log_file: PathBuf,
    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Upload a local file.
    Upload {
        /// Path of the file to send.
        path: PathBuf,
    },
    /// Download a stored file by name.
    Download {
        /// Name of the file on the server.
        name: String,
        /// Where to save it (defaults to ./<name>).
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
    },
}
