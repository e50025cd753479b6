use anyhow::Result;
use buildpilot::cli::Cli;
use buildpilot::output;
use clap::Parser;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting buildpilot");
    cli.execute().await?;

    Ok(())
}
