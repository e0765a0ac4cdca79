use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cabin_agent::{
    telemetry, AgentConfig, AgentNotifier, Args, Console, Scenario, SimulatedFeed, TerminalDisplay,
};
use cabin_coordination::{EventBus, EventSink, FanoutSink, Orchestrator, OrchestratorConfig};
use clap::Parser;
use tracing::{debug, info};

const RECORDER_GRACE: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load(&args)?;
    let log_path = telemetry::init(&config.log_dir)?;
    info!(log = %log_path.display(), "Cabin guard agent starting");

    let feed = SimulatedFeed::new(&config.feed);
    let notifier = Arc::new(AgentNotifier::new(&config)?);
    let bus = EventBus::new().shared();
    let recorder = telemetry::record_events(&bus);
    let sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TerminalDisplay::stdout()), bus];
    let (handle, join) = Orchestrator::spawn(
        OrchestratorConfig {
            settings: config.escalation.clone(),
            timings: config.timings.clone(),
        },
        notifier,
        Arc::new(feed.clone()),
        Arc::new(FanoutSink::new(sinks)),
    );

    let console = Console::new(handle.clone(), feed);
    let driven = async {
        match &args.scenario {
            Some(path) => console.run_scenario(&Scenario::load(path)?).await,
            None => console.run_interactive().await,
        }
    };

    tokio::select! {
        result = driven => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupt received; shutting down"),
    }

    if let Err(e) = handle.exit().await {
        debug!("Exit not delivered: {e}");
    }
    join.await.context("Orchestrator task failed")?;
    // Handles keep the bus alive through the detection reporter
    drop(console);
    drop(handle);
    match tokio::time::timeout(RECORDER_GRACE, recorder).await {
        Ok(Ok(recorded)) => debug!(recorded, "Event recorder finished"),
        _ => debug!("Event recorder did not finish"),
    }
    info!("Cabin guard agent stopped");
    Ok(())
}
