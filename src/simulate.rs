//! The `simulate` module replays historical measurement dumps through the
//! briefcase pipeline and the Nested STAR tree, crunching numbers instead
//! of serving traffic.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::briefcase::Briefcase;
use crate::consts::DEFAULT_CROWD_ID_METHOD;
use crate::errors::ShufflerError;
use crate::measurement::{AttributeOrder, CrowdIdMethod, P3AMeasurement, Report, VersionTracker};
use crate::star::{NestedStar, CSV_HEADER};

lazy_static! {
  // Measurement dumps wrap each JSON object in single quotes somewhere on
  // the line, e.g.:
  // POST / HTTP/2 200 '{"channel":"nightly","country_code":"US",...}'
  static ref MEASUREMENT_RE: Regex = Regex::new(r"'(\{[^']+\})'").unwrap();
}

/// Configuration for a simulation run over offline measurement dumps.
pub struct SimulationConfig {
  pub anonymity_threshold: usize,
  pub order: AttributeOrder,
}

/// Extracts all valid measurements from a single dump file. Each line may
/// carry one single-quoted JSON object; empty lines, lines without a
/// measurement, and invalid measurements are skipped.
pub fn parse_json_file(path: &Path) -> Result<Vec<Report>, ShufflerError> {
  let file = File::open(path)?;
  let mut reports = Vec::new();
  for line in BufReader::new(file).lines() {
    let line = line?;
    if line.is_empty() {
      continue;
    }
    let json = match MEASUREMENT_RE.captures(&line).and_then(|c| c.get(1)) {
      Some(json) => json.as_str(),
      None => continue,
    };
    let measurement: P3AMeasurement = match serde_json::from_str(json) {
      Ok(measurement) => measurement,
      Err(_) => continue,
    };
    if !measurement.is_valid() {
      continue;
    }
    reports.push(Report::P3a(measurement));
  }
  Ok(reports)
}

/// Walks the directory tree under `dir` and parses every file it finds,
/// visiting entries in name order.
pub fn parse_dir(dir: &Path) -> Result<Vec<Report>, ShufflerError> {
  let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
  entries.sort_by_key(|entry| entry.file_name());

  let mut reports = Vec::new();
  for entry in entries {
    let path = entry.path();
    if path.is_dir() {
      reports.extend(parse_dir(&path)?);
    } else {
      reports.extend(parse_json_file(&path)?);
    }
  }
  Ok(reports)
}

/// Computes the Shannon entropy of the observed symbol counts, normalized
/// by the entropy of a uniform distribution over the same domain, i.e. a
/// value in [0, 1]. A singleton domain has zero entropy by definition.
pub fn empirical_entropy(counts: &HashMap<String, usize>) -> f64 {
  if counts.len() <= 1 {
    return 0.0;
  }
  let total: usize = counts.values().sum();
  let mut entropy = 0.0;
  for &count in counts.values() {
    if count == 0 {
      continue;
    }
    let p = count as f64 / total as f64;
    entropy -= p * p.log2();
  }
  entropy / (counts.len() as f64).log2()
}

/// Prints every measurement as a CSV record, preceded by the header row.
pub fn print_attribute_csv(reports: &[Report]) {
  println!("{}", P3AMeasurement::csv_header());
  for report in reports {
    if let Report::P3a(measurement) = report {
      println!("{}", measurement.csv_record());
    }
  }
}

/// Prints the normalized empirical entropy of every measurement attribute.
pub fn print_entropy(reports: &[Report]) {
  let mut columns: Vec<(&str, HashMap<String, usize>)> = P3AMeasurement::csv_header()
    .split(',')
    .map(|name| (name, HashMap::new()))
    .collect();
  for report in reports {
    if let Report::P3a(measurement) = report {
      let record = measurement.csv_record();
      for ((_, counts), value) in columns.iter_mut().zip(record.split(',')) {
        *counts.entry(value.to_string()).or_insert(0) += 1;
      }
    }
  }
  for (name, counts) in &columns {
    println!("{},{:.2}", name, empirical_entropy(counts));
  }
}

/// Replays the given reports through the briefcase pipeline, then drives
/// the Nested STAR tree for every crowd-ID method, printing CSV statistics
/// to stdout.
pub fn run(cfg: &SimulationConfig, reports: &[Report]) -> Result<(), ShufflerError> {
  let versions = Arc::new(VersionTracker::new());

  let briefcase = Briefcase::new(DEFAULT_CROWD_ID_METHOD, versions.clone());
  briefcase.add(reports.to_vec());
  log::info!("{}", briefcase);
  briefcase.dump_fewer_than(cfg.anonymity_threshold);
  let survivors = briefcase.shuffle_and_empty()?;
  log::info!(
    "{} of {} reports survive an anonymity threshold of {}",
    survivors.len(),
    reports.len(),
    cfg.anonymity_threshold
  );

  println!("{}", CSV_HEADER);
  for method in [
    CrowdIdMethod::All,
    CrowdIdMethod::NoValue,
    CrowdIdMethod::Minimal,
  ] {
    let mut star = NestedStar::new(cfg.anonymity_threshold, cfg.order);
    star.add_reports(method, reports, &versions);
    for row in star.aggregate(method, method.num_attrs()) {
      println!("{}", row);
    }
  }
  Ok(())
}
