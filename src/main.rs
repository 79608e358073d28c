use std::io::Read;

use conductor::config::Config;
use conductor::{GenerateOptions, GenerateRequest, Orchestrator};

/// Reads a prompt from the arguments (or stdin when none are given), runs it
/// through the orchestrator, and prints the JSON response on stdout.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let prompt = if args.is_empty() {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        args.join(" ")
    };

    tracing::info!("conductor starting");

    let config = Config::load()?;
    let orchestrator = Orchestrator::from_config(&config).await?;

    for (id, healthy) in orchestrator.probe_health().await {
        if !healthy {
            tracing::warn!(provider = %id, "provider unhealthy at startup");
        }
    }

    let response = orchestrator
        .generate(GenerateRequest::new(prompt), GenerateOptions::default())
        .await;
    println!("{}", response.to_json());

    tracing::debug!(
        providers = %serde_json::to_string(&orchestrator.registry().snapshot())?,
        "provider telemetry"
    );

    orchestrator.shutdown().await;
    tracing::info!("conductor shutting down");
    Ok(())
}
