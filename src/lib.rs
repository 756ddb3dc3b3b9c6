//! The `p3a-shuffler` crate implements a k-anonymity shuffler for the P3A
//! measurement stream: clients submit structured measurements, the shuffler
//! accumulates them for a batch period, discards every "crowd" (the set of
//! clients sharing identical selected attributes) that is smaller than a
//! threshold k, uniformly shuffles the survivors, and publishes the
//! anonymized batch to a downstream analyzer.
//!
//! ## Background
//!
//! A measurement's crowd is determined by hashing a selected subset of its
//! attributes in a fixed, entropy-ordered sequence; see
//! [`measurement::CrowdIdMethod`] for the available attribute subsets.
//! Crowds below the anonymity threshold never leave the shuffler, which
//! bounds how unique a forwarded measurement can be. The crate also ships
//! an offline simulator that replays historical measurement dumps to
//! compare this threshold shuffler against a Nested STAR aggregation
//! scheme, represented as a prefix tree over ordered attribute values; see
//! [`star::NestedStar`].
//!
//! ## Example
//!
//! Reports accumulate in a [`briefcase::Briefcase`], keyed by crowd ID:
//!
//! ```
//! use std::sync::Arc;
//!
//! use p3a_shuffler::briefcase::Briefcase;
//! use p3a_shuffler::measurement::{CrowdId, CrowdIdMethod, Report, VersionTracker};
//!
//! let briefcase = Briefcase::new(CrowdIdMethod::NoValue, Arc::new(VersionTracker::new()));
//! let batch: Vec<Report> = (0..10)
//!   .map(|i| Report::Opaque {
//!     crowd_id: CrowdId::from(format!("crowd-{}", i % 2)),
//!     payload: format!("report-{}", i).into_bytes(),
//!   })
//!   .collect();
//! briefcase.add(batch);
//! assert_eq!(briefcase.num_crowd_ids(), 2);
//! assert_eq!(briefcase.num_reports(), 10);
//!
//! // Both crowds hold five reports, so a threshold of six dumps everything.
//! briefcase.dump_fewer_than(6);
//! let reports = briefcase.shuffle_and_empty().unwrap();
//! assert!(reports.is_empty());
//! assert_eq!(briefcase.num_crowd_ids(), 0);
//! ```

pub mod briefcase;
pub mod forwarder;
pub mod measurement;
pub mod multiplexer;
pub mod shuffler;
pub mod simulate;
pub mod star;
pub mod webapi;

pub mod consts {
  use std::time::Duration;

  use crate::measurement::CrowdIdMethod;

  pub const ANALYZER_URL: &str = "https://example.com";
  pub const P3A_ENDPOINT: &str = "/reports";
  pub const SHUFFLER_ENDPOINT: &str = "/encrypted-reports";
  pub const LISTEN_ADDR: &str = "0.0.0.0:8080";
  pub const BATCH_PERIOD: Duration = Duration::from_secs(60 * 60 * 24);
  pub const DEFAULT_ANONYMITY_THRESHOLD: usize = 10;
  pub const DEFAULT_CROWD_ID_METHOD: CrowdIdMethod = CrowdIdMethod::NoValue;
  pub const INBOX_CAPACITY: usize = 64;
  // A stalled consumer must stall batch publication rather than let
  // batches pile up in memory.
  pub const OUTBOX_CAPACITY: usize = 1;
}

pub mod errors {
  use std::fmt;

  #[derive(Debug, Clone, PartialEq)]
  pub enum ShufflerError {
    RandomnessError(String),
    IoError(String),
    JsonError(String),
    ChannelClosedError,
  }

  impl std::error::Error for ShufflerError {}

  impl fmt::Display for ShufflerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
      match self {
        ShufflerError::RandomnessError(err) => write!(f, "An error occurred during the sampling of shuffle randomness: {}.", err),
        ShufflerError::IoError(err) => write!(f, "An I/O error occurred: {}.", err),
        ShufflerError::JsonError(err) => write!(f, "An error occurred during JSON decoding: {}.", err),
        ShufflerError::ChannelClosedError => write!(f, "The downstream channel closed before the batch could be published."),
      }
    }
  }

  impl From<std::io::Error> for ShufflerError {
    fn from(err: std::io::Error) -> Self {
      ShufflerError::IoError(err.to_string())
    }
  }

  impl From<serde_json::Error> for ShufflerError {
    fn from(err: serde_json::Error) -> Self {
      ShufflerError::JsonError(err.to_string())
    }
  }
}
