//! The `shuffler` module implements the batching state machine at the
//! heart of the service: it drains inbound report batches into the
//! briefcase and, once per batch period, enforces k-anonymity, shuffles
//! what remains, and publishes the result downstream.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::briefcase::Briefcase;
use crate::consts::{INBOX_CAPACITY, OUTBOX_CAPACITY};
use crate::errors::ShufflerError;
use crate::measurement::{CrowdIdMethod, Report, VersionTracker};

/// The shuffler implements four tasks: anonymization, thresholding,
/// shuffling, and batching. Reports accumulate in the briefcase until the
/// batch period ends; crowds below the anonymity threshold are dumped and
/// the shuffled survivors are published to the outbox.
///
/// A single task owns the core loop, so all briefcase mutations are
/// serialized and at most one end-of-period pipeline is ever in flight.
pub struct Shuffler {
  batch_period: Duration,
  anonymity_threshold: usize,
  briefcase: Arc<Briefcase>,
  inbox_tx: mpsc::Sender<Vec<Report>>,
  inbox_rx: Option<mpsc::Receiver<Vec<Report>>>,
  outbox_tx: mpsc::Sender<Vec<Report>>,
  outbox_rx: Option<mpsc::Receiver<Vec<Report>>>,
  done_tx: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl Shuffler {
  /// Returns a new shuffler that batches reports for the given batch
  /// period, binding the given crowd-ID method to its briefcase.
  pub fn new(
    batch_period: Duration,
    anonymity_threshold: usize,
    crowd_id_method: CrowdIdMethod,
  ) -> Self {
    let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
    let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    Self {
      batch_period,
      anonymity_threshold,
      briefcase: Arc::new(Briefcase::new(
        crowd_id_method,
        Arc::new(VersionTracker::new()),
      )),
      inbox_tx,
      inbox_rx: Some(inbox_rx),
      outbox_tx,
      outbox_rx: Some(outbox_rx),
      done_tx: None,
      handle: None,
    }
  }

  /// Returns a sender for submitting report batches. Senders may be
  /// cloned freely across producers.
  pub fn inbox(&self) -> mpsc::Sender<Vec<Report>> {
    self.inbox_tx.clone()
  }

  /// Hands the outbox to the downstream consumer. The outbox is bounded
  /// at capacity one, so a stalled consumer stalls batch publication.
  pub fn take_outbox(&mut self) -> Option<mpsc::Receiver<Vec<Report>>> {
    self.outbox_rx.take()
  }

  /// Spawns the shuffler loop. Starting an already-started shuffler is a
  /// no-op.
  pub fn start(&mut self) {
    let mut inbox = match self.inbox_rx.take() {
      Some(inbox) => inbox,
      None => return,
    };
    let (done_tx, mut done_rx) = oneshot::channel();
    self.done_tx = Some(done_tx);

    let briefcase = self.briefcase.clone();
    let outbox = self.outbox_tx.clone();
    let anonymity_threshold = self.anonymity_threshold;
    let batch_period = self.batch_period;
    self.handle = Some(tokio::spawn(async move {
      let mut ticker = time::interval_at(Instant::now() + batch_period, batch_period);
      loop {
        tokio::select! {
          _ = &mut done_rx => {
            briefcase.empty();
            return;
          }
          Some(batch) = inbox.recv() => {
            briefcase.add(batch);
          }
          _ = ticker.tick() => {
            if let Err(e) = end_batch_period(&briefcase, anonymity_threshold, &outbox).await {
              log::warn!("failed to end batch period: {}", e);
            }
          }
        }
      }
    }));
  }

  /// Signals the loop to terminate and waits for it. The briefcase is
  /// emptied on the way out; an unsent outbox batch is lost.
  pub async fn stop(&mut self) {
    if let Some(done) = self.done_tx.take() {
      let _ = done.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }
}

impl fmt::Display for Shuffler {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.briefcase)
  }
}

/// The housekeeping that runs once a batch period ends: enforce the
/// k-anonymity guarantee on all reports, shuffle the remainder, empty the
/// briefcase, and publish whatever is left to the outbox. A randomness
/// failure skips the period, leaving the briefcase for the next one.
async fn end_batch_period(
  briefcase: &Briefcase,
  anonymity_threshold: usize,
  outbox: &mpsc::Sender<Vec<Report>>,
) -> Result<(), ShufflerError> {
  if briefcase.num_crowd_ids() == 0 {
    return Ok(());
  }
  briefcase.dump_fewer_than(anonymity_threshold);

  let reports = briefcase.shuffle_and_empty()?;
  let num_reports = reports.len();
  outbox
    .send(reports)
    .await
    .map_err(|_| ShufflerError::ChannelClosedError)?;
  log::info!("sent {} reports to outbox", num_reports);
  Ok(())
}
