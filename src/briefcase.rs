//! The `briefcase` module holds the crowd-keyed report accumulator that
//! backs the shuffler.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use rand_core::{OsRng, RngCore};

use crate::errors::ShufflerError;
use crate::measurement::{CrowdId, CrowdIdMethod, Report, VersionTracker};

/// The briefcase accumulates reports, keyed by their crowd ID, until the
/// end of a batch period. A single attribute-selection method is bound at
/// construction time and applied to every inserted report. All operations
/// serialize on one mutex, so observers never see a torn state.
pub struct Briefcase {
  method: CrowdIdMethod,
  versions: Arc<VersionTracker>,
  reports: Mutex<HashMap<CrowdId, Vec<Report>>>,
}

impl Briefcase {
  pub fn new(method: CrowdIdMethod, versions: Arc<VersionTracker>) -> Self {
    Self {
      method,
      versions,
      reports: Mutex::new(HashMap::new()),
    }
  }

  /// Adds a batch of reports, bucketizing each report by its crowd ID.
  /// Insertion order within a bucket follows batch order.
  pub fn add(&self, batch: Vec<Report>) {
    let mut reports = self.reports.lock().unwrap();
    for report in batch {
      let crowd_id = report.crowd_id(self.method, &self.versions);
      reports.entry(crowd_id).or_default().push(report);
    }
  }

  pub fn num_crowd_ids(&self) -> usize {
    self.reports.lock().unwrap().len()
  }

  pub fn num_reports(&self) -> usize {
    self.reports.lock().unwrap().values().map(Vec::len).sum()
  }

  /// Discards all buckets.
  pub fn empty(&self) {
    self.reports.lock().unwrap().clear();
  }

  /// Removes every bucket holding fewer than `min` reports, e.g. if `min`
  /// equals 5, all crowds with four or fewer reports are discarded.
  /// Buckets holding exactly `min` reports survive.
  pub fn dump_fewer_than(&self, min: usize) {
    let mut reports = self.reports.lock().unwrap();
    let num_crowd_ids = reports.len();
    reports.retain(|_, bucket| bucket.len() >= min);
    log::info!(
      "dumped {} of {} crowd IDs below threshold {}",
      num_crowd_ids - reports.len(),
      num_crowd_ids,
      min
    );
  }

  /// Flattens all buckets into a single sequence, gives it a Fisher-Yates
  /// shuffle driven by the operating system's CSPRNG, and empties the
  /// briefcase. A randomness failure leaves the briefcase untouched.
  pub fn shuffle_and_empty(&self) -> Result<Vec<Report>, ShufflerError> {
    let mut reports = self.reports.lock().unwrap();
    let num_reports = reports.values().map(Vec::len).sum::<usize>();

    // All swap indices are drawn up front: a failing CSPRNG must not
    // leave a half-drained briefcase behind.
    let mut swaps = Vec::with_capacity(num_reports.saturating_sub(1));
    for i in (1..num_reports).rev() {
      swaps.push(uniform_index(i + 1)?);
    }

    let mut result = Vec::with_capacity(num_reports);
    for (_, bucket) in reports.drain() {
      result.extend(bucket);
    }
    for (swap, i) in swaps.into_iter().zip((1..num_reports).rev()) {
      result.swap(i, swap);
    }
    Ok(result)
  }
}

impl fmt::Display for Briefcase {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    let reports = self.reports.lock().unwrap();
    let num_reports: usize = reports.values().map(Vec::len).sum();
    write!(
      f,
      "briefcase contains {} crowd IDs; {} reports",
      reports.len(),
      num_reports
    )
  }
}

/// Draws a uniform index in `[0, bound)` from the operating system's
/// CSPRNG, rejection-sampled to stay unbiased.
fn uniform_index(bound: usize) -> Result<usize, ShufflerError> {
  let bound = bound as u64;
  let mask = bound.next_power_of_two() - 1;
  let mut buf = [0u8; 8];
  loop {
    OsRng
      .try_fill_bytes(&mut buf)
      .map_err(|e| ShufflerError::RandomnessError(e.to_string()))?;
    let candidate = u64::from_le_bytes(buf) & mask;
    if candidate < bound {
      return Ok(candidate as usize);
    }
  }
}
