//! Main entry point for the arable agent CLI.

use arable_agents::{cli, discovery::AgentCatalog, runtime, settings::Settings, telemetry};
use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let settings = Settings::load_from(args.config.as_deref())?;
    telemetry::init(&settings.logging)?;

    let catalog = AgentCatalog::builtin();
    let orchestrator = runtime::build_orchestrator(&settings, &catalog)?;

    let output = match args.command {
        cli::Commands::Agents => runtime::list_agents(&orchestrator)?,
        cli::Commands::Run { agent, input } => {
            runtime::run_task(&orchestrator, &agent, &input).await?
        }
        cli::Commands::Workflow { file } => runtime::run_workflow(&orchestrator, &file).await?,
    };
    println!("{}", output);

    orchestrator.registry().shutdown_all();
    Ok(())
}
