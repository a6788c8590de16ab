use std::path::PathBuf;

use aevatar_kernel::KernelBuilder;
use aevatar_protocol::{AgentEvent, Direction, HandlerFailed};
use aevatar_runtime::{AgentBehavior, DecodedEvent, HandlerTableBuilder, RuntimeConfig, TypeRegistry};
use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "aevatard")]
#[command(about = "Aevatar local kernel demo daemon")]
struct Cli {
    /// Persist agents under this directory; in-memory when omitted.
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, default_value_t = 3)]
    workers: usize,
    #[arg(long, default_value_t = 10)]
    max_units: u32,
    #[arg(long, default_value_t = 100)]
    snapshot_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Assign {
    job: String,
    units: u32,
}

impl AgentEvent for Assign {
    fn type_tag() -> &'static str {
        "aevatard.Assign"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Completed {
    job: String,
    units: u32,
}

impl AgentEvent for Completed {
    fn type_tag() -> &'static str {
        "aevatard.Completed"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Report {
    job: String,
    units: u32,
}

impl AgentEvent for Report {
    fn type_tag() -> &'static str {
        "aevatard.Report"
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WorkerState {
    jobs: u64,
    units: u64,
}

struct Worker {
    max_units: u32,
}

impl AgentBehavior for Worker {
    type State = WorkerState;
    type Config = ();

    fn agent_type() -> &'static str {
        "aevatard.Worker"
    }

    fn description(&self) -> String {
        format!("worker accepting jobs up to {} units", self.max_units)
    }

    fn register_handlers(handlers: &mut HandlerTableBuilder<Self>) {
        handlers.on::<Assign, _>("work", |agent, assign, ctx| {
            Box::pin(async move {
                anyhow::ensure!(
                    assign.units <= agent.behavior().max_units,
                    "job {} needs {} units, limit is {}",
                    assign.job,
                    assign.units,
                    agent.behavior().max_units
                );
                agent.raise_event(&Completed {
                    job: assign.job.clone(),
                    units: assign.units,
                })?;
                let report = Report {
                    job: assign.job,
                    units: assign.units,
                };
                agent.publish(&report, Direction::Up, &ctx.cancel).await?;
                anyhow::Ok(())
            })
        });
    }

    fn register_event_types(registry: &TypeRegistry) {
        registry.register::<Completed>();
    }

    fn transition_state(state: &mut WorkerState, event: &DecodedEvent) -> Result<()> {
        if let Some(done) = event.downcast_ref::<Completed>() {
            state.jobs += 1;
            state.units += u64::from(done.units);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SupervisorState {
    reported_units: u64,
    failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tallied {
    units: u32,
}

impl AgentEvent for Tallied {
    fn type_tag() -> &'static str {
        "aevatard.Tallied"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureNoted;

impl AgentEvent for FailureNoted {
    fn type_tag() -> &'static str {
        "aevatard.FailureNoted"
    }
}

struct Supervisor;

impl AgentBehavior for Supervisor {
    type State = SupervisorState;
    type Config = ();

    fn agent_type() -> &'static str {
        "aevatard.Supervisor"
    }

    fn register_handlers(handlers: &mut HandlerTableBuilder<Self>) {
        handlers
            .on::<Report, _>("tally", |agent, report, ctx| {
                Box::pin(async move {
                    info!(
                        worker = %ctx.publisher_id,
                        job = %report.job,
                        units = report.units,
                        "report received"
                    );
                    agent.raise_event(&Tallied {
                        units: report.units,
                    })?;
                    anyhow::Ok(())
                })
            })
            .on::<HandlerFailed, _>("note_failure", |agent, failed, _ctx| {
                Box::pin(async move {
                    warn!(
                        worker = %failed.agent_id,
                        handler = %failed.handler,
                        message = %failed.message,
                        "worker failed"
                    );
                    agent.raise_event(&FailureNoted)?;
                    anyhow::Ok(())
                })
            });
    }

    fn register_event_types(registry: &TypeRegistry) {
        registry.register::<Tallied>().register::<FailureNoted>();
    }

    fn transition_state(state: &mut SupervisorState, event: &DecodedEvent) -> Result<()> {
        if let Some(tallied) = event.downcast_ref::<Tallied>() {
            state.reported_units += u64::from(tallied.units);
        } else if event.is::<FailureNoted>() {
            state.failures += 1;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();

    let mut builder = KernelBuilder::new()
        .runtime_config(RuntimeConfig::new().snapshot_interval(cli.snapshot_interval));
    if let Some(root) = &cli.root {
        builder = builder.root(root);
    }
    let runtime = builder.build();

    let mut events = runtime.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(envelope) = events.recv().await {
            let rendered = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_owned());
            info!(event = %rendered, "event.published");
        }
    });

    let supervisor = runtime.spawn("supervisor", Supervisor).await?;
    for index in 0..cli.workers {
        let worker = runtime
            .spawn(
                format!("worker-{index}"),
                Worker {
                    max_units: cli.max_units,
                },
            )
            .await?;
        runtime.link(&supervisor, &worker).await?;
    }

    for (job, units) in [("index", 4), ("compact", 8), ("rebuild", cli.max_units + 5)] {
        let id = supervisor
            .publish(
                Assign {
                    job: job.to_owned(),
                    units,
                },
                Direction::Down,
            )
            .await?;
        info!(event_id = %id, job, units, "job assigned");
    }
    runtime.wait_idle().await;

    let state = supervisor.state().await?;
    let metrics = supervisor.metrics().await?;
    info!(
        reported_units = state.reported_units,
        failures = state.failures,
        version = supervisor.version().await?,
        handled = metrics.handled,
        "supervisor settled"
    );

    runtime.shutdown().await?;
    event_task.abort();
    if let Err(error) = event_task.await {
        if !error.is_cancelled() {
            warn!(%error, "event task stopped");
        }
    }

    Ok(())
}
