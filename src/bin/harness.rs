//! Thin binary: load the definition and registry, merge configuration,
//! run one agent, report the outcome.

use agent_harness::cli::{self, HarnessCli};
use agent_harness::{
    AgentDefinition, ClaudeCliBridge, ConfigError, RunConfig, RunContext, Runner, StepRegistry,
};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = HarnessCli::parse();
    let code = match run(args).await {
        Ok(result) => {
            if result.success {
                println!("{}", result.render_summary());
            } else {
                eprintln!("{}", result.reason);
            }
            cli::exit_code(&result)
        }
        Err(e) => {
            eprintln!("{e:#}");
            if e.downcast_ref::<ConfigError>().is_some() {
                cli::EXIT_CONFIG
            } else {
                cli::EXIT_FAILURE
            }
        }
    };
    std::process::exit(code);
}

async fn run(args: HarnessCli) -> anyhow::Result<agent_harness::AgentResult> {
    let cwd = std::env::current_dir().context("working directory unavailable")?;

    let definition_path = cwd.join("agents").join(format!("{}.json", args.agent));
    let definition = AgentDefinition::from_path(&definition_path)?;
    let registry = StepRegistry::from_path(&cwd.join(&definition.prompts.registry))?;

    let config = RunConfig::layered(&[RunConfig::from_definition(&definition), args.overlay()]);
    let runner = Runner::new(definition, registry, config, Arc::new(ClaudeCliBridge::new()));

    let ctx = RunContext::new(cwd);
    let cancellation = ctx.cancellation.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancellation.cancel();
        }
    });

    Ok(runner.run(ctx).await)
}
