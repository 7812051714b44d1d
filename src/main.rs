use std::process::ExitCode;

use clap::Parser;

use ble_bridge::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match ble_bridge::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            ExitCode::from(1)
        }
    }
}
