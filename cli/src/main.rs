use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ganglion::{
    config::{DeliveryPolicy, ProcessConfig, Protocol, WeightSplit},
    observer::TracingObserver,
    Scenario, SimConfig, SimOutcome, Simulation, Topology,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ganglion")]
#[command(about = "Runs distributed snapshot and termination protocols over loopback TCP")]
struct Cli {
    /// Print the outcome as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a scenario file: `{"topology": {...}, "config": {...}}`
    Run { file: PathBuf },
    /// Run on a generated topology
    Generate(Generate),
}

#[derive(Clone, Copy, ValueEnum)]
enum Shape {
    Ring,
    BidirectionalRing,
    Complete,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Snapshot,
    Quiescence,
}

#[derive(Clone, Copy, ValueEnum)]
enum SplitArg {
    Even,
    SkipReturnEdge,
}

#[derive(Args)]
struct Generate {
    #[arg(value_enum, default_value = "ring")]
    shape: Shape,
    #[arg(short = 'n', long, default_value_t = 3)]
    size: u32,
    #[arg(long, value_enum, default_value = "snapshot")]
    protocol: ProtocolArg,
    #[arg(long, default_value_t = 1)]
    rounds: u32,
    #[arg(long, value_enum, default_value = "even")]
    split: SplitArg,
    /// Base messages the initiator emits at start-up
    #[arg(long, default_value_t = 0)]
    burst: u32,
    /// Times each base message is forwarded
    #[arg(long, default_value_t = 0)]
    hops: u32,
    /// Interleave inbound channels randomly, with this seed
    #[arg(long)]
    interleave: Option<u64>,
}

impl Generate {
    fn scenario(&self) -> Scenario {
        let topology = match self.shape {
            Shape::Ring => Topology::ring(self.size),
            Shape::BidirectionalRing => Topology::bidirectional_ring(self.size),
            Shape::Complete => Topology::complete(self.size),
        };
        let defaults = ProcessConfig::builder()
            .max_rounds(self.rounds)
            .weight_split(match self.split {
                SplitArg::Even => WeightSplit::Even,
                SplitArg::SkipReturnEdge => WeightSplit::SkipReturnEdge,
            })
            .base_burst(self.burst)
            .base_hops(self.hops)
            .delivery(match self.interleave {
                Some(seed) => DeliveryPolicy::Interleaved { seed },
                None => DeliveryPolicy::Fifo,
            })
            .build();
        let protocol = match self.protocol {
            ProtocolArg::Snapshot => Protocol::Snapshot,
            ProtocolArg::Quiescence => Protocol::Quiescence,
        };
        Scenario {
            topology,
            config: SimConfig {
                protocol,
                defaults,
                ..SimConfig::default()
            },
        }
    }
}

fn print_outcome(outcome: &SimOutcome) {
    for snapshot in outcome.snapshots() {
        println!("round {}", snapshot.round);
        for report in &snapshot.reports {
            println!(
                "  [{} ~ {:.4}] {}",
                report.weight,
                report.weight.as_f64(),
                report.snapshot
            );
        }
    }
    for process in &outcome.processes {
        println!(
            "p{}: dispatched={} base_sent={} base_received={} base_absorbed={} clock={}",
            process.id,
            process.dispatched,
            process.base_sent,
            process.base_received,
            process.base_absorbed,
            process.clock
        );
    }
    if outcome.quiescence_detected {
        println!("terminated by quiescence detection");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ganglion=info")),
        )
        .init();

    let cli = Cli::parse();
    let scenario = match &cli.command {
        Command::Run { file } => {
            let json = std::fs::read_to_string(file)
                .with_context(|| format!("reading {}", file.display()))?;
            Scenario::from_json(&json)?
        }
        Command::Generate(generate) => generate.scenario(),
    };

    info!(processes = scenario.topology.len(), "starting simulation");
    let outcome = Simulation::from_scenario(scenario)?
        .with_observer(Arc::new(TracingObserver))
        .run()
        .await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        print_outcome(&outcome);
    }
    Ok(())
}
