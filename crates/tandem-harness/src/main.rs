//! Tandem scenario runner.
//!
//! # Usage
//!
//! ```bash
//! # List the scenario catalogue
//! tandem list
//!
//! # Run one scenario
//! tandem run parallel-update
//!
//! # Run every scenario with a longer probe delay
//! tandem --probe-delay-ms 250 run-all
//!
//! # Alternate for a number of rounds
//! tandem ping-pong --rounds 10
//! ```

#![allow(clippy::print_stdout, reason = "Command-line output")]

use std::{process::ExitCode, time::Duration};

use clap::{Parser, Subcommand};
use tandem_core::{DEFAULT_PROBE_DELAY, HarnessConfig};
use tandem_harness::{DEFAULT_PING_PONG_ROUNDS, Scenario, ScenarioOutcome, scenarios};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Deterministic two-transaction race scenarios
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(about = "Replay two-transaction races in an exact interleaving")]
#[command(version)]
struct Args {
    /// Delay before a blocking probe releases the peer, in milliseconds
    #[arg(long, global = true, default_value_t = DEFAULT_PROBE_DELAY.as_millis() as u64)]
    probe_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every scenario
    List,

    /// Run one scenario
    Run {
        /// Scenario to run
        #[arg(value_enum)]
        scenario: Scenario,
    },

    /// Run every scenario in catalogue order
    RunAll,

    /// Alternate two parties for a number of rounds
    PingPong {
        /// Rounds per party
        #[arg(short, long, default_value_t = DEFAULT_PING_PONG_ROUNDS)]
        rounds: usize,
    },
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = HarnessConfig::default().with_probe_delay(Duration::from_millis(args.probe_delay_ms));
    tracing::debug!(probe_delay_ms = args.probe_delay_ms, "Harness configured");

    let outcomes = match args.command {
        Command::List => {
            for scenario in Scenario::ALL {
                println!("{:<22} {}", scenario.name(), scenario.description());
            }
            return Ok(ExitCode::SUCCESS);
        },
        Command::Run { scenario } => vec![scenario.run(&config)?],
        Command::RunAll => Scenario::ALL.into_iter().map(|s| s.run(&config)).collect::<Result<Vec<_>, _>>()?,
        Command::PingPong { rounds } => vec![scenarios::ping_pong(rounds, &config)?],
    };

    Ok(report(&outcomes))
}

fn report(outcomes: &[ScenarioOutcome]) -> ExitCode {
    for outcome in outcomes {
        print!("{outcome}");
    }

    let failed = outcomes.iter().filter(|o| !o.passed()).count();
    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        println!("{failed} of {} scenarios failed", outcomes.len());
        ExitCode::FAILURE
    }
}
