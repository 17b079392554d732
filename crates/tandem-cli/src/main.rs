//! Tandem scenario runner.
//!
//! Runs the built-in sync-channel scenarios end to end, each with its own
//! server and client endpoints, and prints what every endpoint saw.

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use tandem_core::{CallResult, Event, Pumping, Scenario};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum ScenarioArg {
    /// Server asks the client, no pumping
    Simple,
    /// Server asks the client while pumping
    SimplePumping,
    /// Client asks, server answers 42
    Answer,
    /// Server answers with a failure
    Rejected,
    /// Pumped Double with a nested call back to the client
    Nested,
    /// Client without a server
    NoServer,
    /// Server answers from a posted task
    Delayed,
    /// Both endpoints on one listener thread
    SharedLoop,
    /// Every scenario above, in order
    All,
}

impl ScenarioArg {
    fn scenarios(self) -> Vec<Scenario> {
        match self {
            ScenarioArg::Simple => vec![Scenario::Simple(Pumping::Disabled)],
            ScenarioArg::SimplePumping => vec![Scenario::Simple(Pumping::Enabled)],
            ScenarioArg::Answer => vec![Scenario::Answer],
            ScenarioArg::Rejected => vec![Scenario::Rejected],
            ScenarioArg::Nested => vec![Scenario::Nested],
            ScenarioArg::NoServer => vec![Scenario::NoServer],
            ScenarioArg::Delayed => vec![Scenario::Delayed],
            ScenarioArg::SharedLoop => vec![Scenario::SharedLoop],
            ScenarioArg::All => Scenario::all(),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(about = "Run synchronous channel scenarios between two endpoints")]
struct Args {
    /// Scenario to run
    #[arg(value_enum, default_value = "all")]
    scenario: ScenarioArg,

    /// Run each scenario this many times
    #[arg(short, long, default_value = "1")]
    repeat: u32,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .init();

    if args.repeat == 0 {
        bail!("--repeat must be at least 1");
    }

    for scenario in args.scenario.scenarios() {
        for round in 1..=args.repeat {
            info!("Running {} ({}/{})", scenario.name(), round, args.repeat);
            let events = scenario.run()?;
            for event in &events {
                println!("{:<14} {}", scenario.name(), describe(event));
            }
        }
    }

    Ok(())
}

fn describe(event: &Event) -> String {
    match event {
        Event::Answered { endpoint, request } => format!("{} answered {}", endpoint, request),
        Event::Returned {
            endpoint,
            request,
            result,
        } => match result {
            CallResult::Value(value) => format!("{} got {} = {}", endpoint, request, value),
            CallResult::Rejected => format!("{} got {} rejected", endpoint, request),
            CallResult::Closed => format!("{} got {} failed: channel closed", endpoint, request),
            CallResult::Shutdown => format!("{} got {} failed: shut down", endpoint, request),
        },
    }
}
