//! Transfer client binary: one upload or one download per invocation.
//!
//! The result is printed as JSON on stdout; the exit status reflects whether
//! the transfer succeeded.

use clap::Parser;
use std::process::ExitCode;

use http_file_transfer::client::TransferClient;
use http_file_transfer::config::{ClientArgs, ClientCommand};
use http_file_transfer::logging;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = ClientArgs::parse();
    logging::init_logging(&args.log_file)?;

    let client = TransferClient::new(args.base_url)?;
    let result = match args.command {
        ClientCommand::Upload { path } => client.upload(&path).await,
        ClientCommand::Download { name, output } => client.download(&name, output.as_deref()).await,
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
