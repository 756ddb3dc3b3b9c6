//! The `p3a-shuffler` binary runs in one of two modes: deployment mode
//! serves the live ingress-shuffle-forward pipeline, while the simulation
//! modes crunch numbers over offline measurement dumps.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use p3a_shuffler::consts::{
  ANALYZER_URL, BATCH_PERIOD, DEFAULT_ANONYMITY_THRESHOLD, DEFAULT_CROWD_ID_METHOD, LISTEN_ADDR,
};
use p3a_shuffler::forwarder::Forwarder;
use p3a_shuffler::measurement::AttributeOrder;
use p3a_shuffler::multiplexer::Multiplexer;
use p3a_shuffler::shuffler::Shuffler;
use p3a_shuffler::simulate::{self, SimulationConfig};
use p3a_shuffler::webapi;

#[derive(Parser, Debug)]
#[command(
  name = "p3a-shuffler",
  version,
  about = "K-anonymity shuffler for the P3A measurement stream"
)]
struct Cli {
  /// Use simulation mode instead of deployment mode.
  #[arg(long)]
  simulate: bool,

  /// Directory pointing to local P3A measurements, as stored in the S3
  /// bucket. Required for the simulation modes.
  #[arg(long)]
  datadir: Option<PathBuf>,

  /// Print every parsed measurement as a CSV record and exit.
  #[arg(long)]
  attrcsv: bool,

  /// Print the normalized empirical entropy of every attribute and exit.
  #[arg(long)]
  entropy: bool,

  /// K-anonymity threshold.
  #[arg(long, default_value_t = DEFAULT_ANONYMITY_THRESHOLD)]
  threshold: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
  // CSV and statistics output goes to stdout; logs go to stderr.
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .target(env_logger::Target::Stderr)
    .init();

  let cli = Cli::parse();
  if cli.simulate || cli.attrcsv || cli.entropy {
    offline_mode(&cli)
  } else {
    deployment_mode(cli.threshold).await
  }
}

/// Crunches numbers over offline measurement dumps: a CSV or entropy dump
/// of the parsed measurements, or the full shuffler and Nested STAR
/// simulation.
fn offline_mode(cli: &Cli) -> Result<()> {
  let datadir = cli
    .datadir
    .as_ref()
    .context("--datadir is required for the simulation modes")?;
  let reports = simulate::parse_dir(datadir)
    .with_context(|| format!("failed to load P3A reports from {}", datadir.display()))?;
  log::info!("parsed {} reports from {}", reports.len(), datadir.display());

  if cli.attrcsv {
    simulate::print_attribute_csv(&reports);
    return Ok(());
  }
  if cli.entropy {
    simulate::print_entropy(&reports);
    return Ok(());
  }

  log::info!(
    "ending batch period using anonymity threshold of {}",
    cli.threshold
  );
  let cfg = SimulationConfig {
    anonymity_threshold: cli.threshold,
    order: AttributeOrder::HighEntropyFirst,
  };
  simulate::run(&cfg, &reports)?;
  Ok(())
}

/// Runs the live pipeline: HTTP ingress feeding the shuffler, whose
/// outbox is multiplexed to the forwarder.
async fn deployment_mode(anonymity_threshold: usize) -> Result<()> {
  let mut shuffler = Shuffler::new(BATCH_PERIOD, anonymity_threshold, DEFAULT_CROWD_ID_METHOD);
  let outbox = shuffler
    .take_outbox()
    .context("shuffler outbox already taken")?;
  shuffler.start();
  log::info!("started shuffler with batch period of {:?}", BATCH_PERIOD);

  let mut multiplexer = Multiplexer::new(outbox);
  let forwarder_inbox = multiplexer.register();
  multiplexer.start();

  let mut forwarder = Forwarder::new(forwarder_inbox, ANALYZER_URL);
  forwarder.start();
  log::info!("started forwarder");

  let app = webapi::router(shuffler.inbox());
  let listener = tokio::net::TcpListener::bind(LISTEN_ADDR)
    .await
    .with_context(|| format!("failed to bind {}", LISTEN_ADDR))?;
  log::info!("listening on {}", LISTEN_ADDR);
  let served = axum::serve(listener, app).await;

  shuffler.stop().await;
  drop(shuffler);
  multiplexer.stop().await;
  forwarder.stop().await;
  served.context("web API terminated")
}
