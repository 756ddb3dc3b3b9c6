//! The `star` module simulates the execution of Nested STAR over P3A
//! measurements. It does not implement the actual STAR cryptography; it
//! merely reproduces the nesting, represented as a tree of nodes, to
//! produce CSV output that lets us explore the privacy and utility
//! tradeoff.

use std::collections::HashMap;
use std::fmt;

use crate::measurement::{AttributeOrder, CrowdIdMethod, Report, VersionTracker};

const ROOT_DEPTH: usize = 1;

/// The header preceding the CSV rows emitted by [`NestedStar::aggregate`].
pub const CSV_HEADER: &str =
  "method,order,threshold,reports,num_tags,num_leaf_tags,len_part_msmts,num_part_msmts";

/// Per-value bookkeeping within a node: the number of measurements whose
/// ordered prefix passes through this value at this depth, and the subtree
/// for the next attribute if any measurement continued past it.
#[derive(Debug, Default)]
pub struct NodeInfo {
  count: usize,
  next: Option<Node>,
}

/// A node of the prefix tree, mapping attribute values (e.g. "US",
/// "linux") to their bookkeeping.
#[derive(Debug, Default)]
pub struct Node {
  values: HashMap<String, NodeInfo>,
}

impl Node {
  pub fn new() -> Self {
    Node::default()
  }

  /// Inserts an ordered measurement, incrementing one count at every depth
  /// along its path and lazily creating child nodes.
  pub fn add(&mut self, ordered: &[String]) {
    let (head, tail) = match ordered.split_first() {
      Some(split) => split,
      None => return,
    };
    let info = self.values.entry(head.clone()).or_default();
    info.count += 1;
    if !tail.is_empty() {
      info.next.get_or_insert_with(Node::new).add(tail);
    }
  }

  /// Walks the tree and classifies the inserted measurements as fully
  /// unlocked, partially unlocked, or lost, given the k-anonymity
  /// `threshold`. `prefix` holds the attribute values on the path to this
  /// node.
  pub fn aggregate(
    &self,
    max_depth: usize,
    threshold: usize,
    prefix: &[String],
  ) -> AggregationState {
    let mut state = AggregationState::new();
    let depth = prefix.len() + 1;

    // Iterate over all values at this position in the tree, e.g. "US",
    // "FR", ...
    for (value, info) in &self.values {
      // The crowd at this prefix is too small to unlock the value.
      if info.count < threshold {
        continue;
      }

      // The last attribute was reached: a fully unlocked measurement.
      if depth == max_depth {
        state.full_msmts += info.count;
        continue;
      }

      let next = match &info.next {
        Some(next) => next,
        None => {
          // The path ends before max_depth. Everything that passed
          // through here is an incomplete measurement, partial at this
          // depth. Deeper occurrences are rolled into the root's
          // partial total through `already_counted`.
          state.add_len_tags(depth, info.count);
          state.already_counted += info.count;
          if depth == ROOT_DEPTH {
            state.partial_msmts += info.count;
          }
          continue;
        }
      };

      // Go deeper down the tree and try to unlock the next attribute.
      let mut sub_prefix = prefix.to_vec();
      sub_prefix.push(value.clone());
      let substate = next.aggregate(max_depth, threshold, &sub_prefix);
      state.augment(&substate);

      let newly_unlocked = info.count - substate.full_msmts - substate.already_counted;
      state.add_len_tags(depth, newly_unlocked);
      state.already_counted += newly_unlocked;

      // Back at the root, settle the total number of partial
      // measurements.
      if depth == ROOT_DEPTH {
        state.partial_msmts += info.count - substate.full_msmts;
      }
    }

    state
  }

  /// The total number of (value, info) pairs in the tree.
  pub fn num_tags(&self) -> usize {
    self.values.len()
      + self
        .values
        .values()
        .filter_map(|info| info.next.as_ref())
        .map(Node::num_tags)
        .sum::<usize>()
  }

  /// The total number of nodes in the tree, the root included.
  pub fn num_nodes(&self) -> usize {
    1 + self
      .values
      .values()
      .filter_map(|info| info.next.as_ref())
      .map(Node::num_nodes)
      .sum::<usize>()
  }

  /// The number of (value, info) pairs without a child node.
  pub fn num_leaf_tags(&self) -> usize {
    self
      .values
      .values()
      .map(|info| match &info.next {
        None => 1,
        Some(next) => next.num_leaf_tags(),
      })
      .sum()
  }
}

/// Counters accumulated while walking the prefix tree. `already_counted`
/// prevents a measurement from being classified as partial at more than
/// one depth.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregationState {
  pub full_msmts: usize,
  pub partial_msmts: usize,
  pub already_counted: usize,
  pub len_partial_msmts: HashMap<usize, usize>,
}

impl AggregationState {
  pub fn new() -> Self {
    AggregationState::default()
  }

  pub fn add_len_tags(&mut self, depth: usize, count: usize) {
    *self.len_partial_msmts.entry(depth).or_insert(0) += count;
  }

  /// Merges another state into this one. The merge is commutative.
  pub fn augment(&mut self, other: &AggregationState) {
    self.full_msmts += other.full_msmts;
    self.partial_msmts += other.partial_msmts;
    self.already_counted += other.already_counted;
    for (&depth, &count) in &other.len_partial_msmts {
      self.add_len_tags(depth, count);
    }
  }

  /// Correctness witness: the per-depth partial counts must add up to the
  /// total number of partial measurements.
  pub fn adds_up(&self) -> bool {
    self.len_partial_msmts.values().sum::<usize>() == self.partial_msmts
  }

  pub fn nothing_unlocked(&self) -> bool {
    self.full_msmts == 0 && self.partial_msmts == 0
  }
}

impl fmt::Display for AggregationState {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(
      f,
      "{} full, {} partial measurements",
      self.full_msmts, self.partial_msmts
    )
  }
}

/// Drives the prefix tree over P3A reports and emits the CSV statistics
/// that compare full recovery, partial recovery, and loss for a given
/// threshold.
pub struct NestedStar {
  root: Node,
  threshold: usize,
  order: AttributeOrder,
  num_measurements: usize,
}

impl NestedStar {
  pub fn new(threshold: usize, order: AttributeOrder) -> Self {
    Self {
      root: Node::new(),
      threshold,
      order,
      num_measurements: 0,
    }
  }

  /// Inserts the given reports into the tree, ordering each measurement's
  /// attributes according to the configured order. The argument `method`
  /// selects the attribute subset under consideration.
  pub fn add_reports(
    &mut self,
    method: CrowdIdMethod,
    reports: &[Report],
    versions: &VersionTracker,
  ) {
    for report in reports {
      let measurement = match report {
        Report::P3a(measurement) => measurement,
        Report::Opaque { .. } => continue,
      };
      let ordered = match self.order {
        AttributeOrder::HighEntropyFirst => {
          measurement.order_high_entropy_first(method, versions)
        }
        AttributeOrder::HighEntropyLast => {
          measurement.order_high_entropy_last(method, versions)
        }
      };
      self.root.add(&ordered);
      self.num_measurements += 1;
    }
  }

  /// Aggregates the tree's measurements and returns the CSV rows
  /// describing the outcome: one `LenPartMsmt` row per depth, a `Partial`
  /// row carrying the partial fraction and tree metrics, and a plain row
  /// carrying the fully-unlocked fraction.
  pub fn aggregate(&self, method: CrowdIdMethod, num_attrs: usize) -> Vec<String> {
    let state = self.root.aggregate(num_attrs, self.threshold, &[]);
    if !state.adds_up() {
      log::warn!(
        "number of partial measurements does not add up: {}",
        state.partial_msmts
      );
    }

    let mut rows = Vec::with_capacity(num_attrs + 2);
    for depth in 1..=num_attrs {
      let num = state.len_partial_msmts.get(&depth).copied().unwrap_or(0);
      rows.push(format!(
        "LenPartMsmt{},{},{},0,0,0,{},{}",
        method,
        self.order.index(),
        self.threshold,
        depth,
        num
      ));
    }

    let frac_full = frac(state.full_msmts, self.num_measurements);
    let frac_partial = frac(state.partial_msmts, self.num_measurements);
    log::info!(
      "{} ({:.1}%) full, {} ({:.1}%) partial out of {}; {:.1}% lost",
      state.full_msmts,
      frac_full * 100.0,
      state.partial_msmts,
      frac_partial * 100.0,
      self.num_measurements,
      100.0 - (frac_full + frac_partial) * 100.0,
    );
    rows.push(format!(
      "Partial{},{},{},{:.3},{},{},0,0",
      method,
      self.order.index(),
      self.threshold,
      frac_partial,
      self.root.num_tags(),
      self.root.num_leaf_tags()
    ));
    rows.push(format!(
      "{},{},{},{:.3},0,0,0,0",
      method,
      self.order.index(),
      self.threshold,
      frac_full
    ));
    rows
  }
}

fn frac(a: usize, b: usize) -> f64 {
  if b == 0 {
    return 0.0;
  }
  a as f64 / b as f64
}
