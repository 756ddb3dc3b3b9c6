//! The `measurement` module defines the P3A measurement record, the
//! attribute-selection methods that determine a measurement's crowd, and
//! the crowd-ID derivation itself.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// The crowd ID of a report: the lowercase hexadecimal SHA-1 over the
/// measurement's selected attributes in their high-entropy-first order.
/// Crowd IDs are stable across processes and machines; equal crowd IDs
/// imply identical selected attributes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrowdId(String);

impl CrowdId {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl From<String> for CrowdId {
  fn from(id: String) -> Self {
    CrowdId(id)
  }
}

impl From<&str> for CrowdId {
  fn from(id: &str) -> Self {
    CrowdId(id.to_string())
  }
}

impl fmt::Display for CrowdId {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The subset of measurement attributes that determines a crowd.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CrowdIdMethod {
  /// All eleven attributes.
  All,
  /// All attributes except the metric value, with a trailing
  /// version-freshness token.
  NoValue,
  /// A minimal, curated set of attributes.
  Minimal,
}

impl CrowdIdMethod {
  /// The number of tokens in the method's ordered attribute list.
  pub fn num_attrs(&self) -> usize {
    match self {
      CrowdIdMethod::All => 11,
      CrowdIdMethod::NoValue => 11,
      CrowdIdMethod::Minimal => 7,
    }
  }
}

impl fmt::Display for CrowdIdMethod {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      CrowdIdMethod::All => write!(f, "All"),
      CrowdIdMethod::NoValue => write!(f, "NoValue"),
      CrowdIdMethod::Minimal => write!(f, "Minimal"),
    }
  }
}

/// Whether a measurement's attributes are ordered with the high-entropy
/// attributes coming first or last.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeOrder {
  HighEntropyFirst,
  HighEntropyLast,
}

impl AttributeOrder {
  /// The numeric index used in CSV output.
  pub fn index(&self) -> u8 {
    match self {
      AttributeOrder::HighEntropyFirst => 0,
      AttributeOrder::HighEntropyLast => 1,
    }
  }
}

/// An encrypted measurement destined for the shuffler. The payload is
/// opaque until a decryption key is provisioned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShufflerMeasurement {
  pub encrypted: String,
}

/// A P3A measurement as it is sent by clients. Immutable after creation.
///
/// The serde field names mirror the wire format; `metric_hash` is accepted
/// as an alias for `metric_name` so that historical measurement dumps still
/// decode.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct P3AMeasurement {
  #[serde(rename = "yos")]
  pub year_of_survey: i32,
  #[serde(rename = "yoi")]
  pub year_of_install: i32,
  #[serde(rename = "wos")]
  pub week_of_survey: i32,
  #[serde(rename = "woi")]
  pub week_of_install: i32,
  pub metric_value: i64,
  #[serde(alias = "metric_hash")]
  pub metric_name: String,
  pub country_code: String,
  pub platform: String,
  pub version: String,
  pub channel: String,
  pub refcode: String,
}

impl P3AMeasurement {
  /// Returns true if the measurement's numeric attributes are within their
  /// bounds and its mandatory textual attributes are non-empty.
  pub fn is_valid(&self) -> bool {
    if self.year_of_survey < 1970 || self.year_of_install < 1970 {
      return false;
    }
    if !(1..=53).contains(&self.week_of_survey) || !(1..=53).contains(&self.week_of_install) {
      return false;
    }
    if self.metric_value < 0 {
      return false;
    }
    !self.metric_name.is_empty()
      && !self.platform.is_empty()
      && !self.version.is_empty()
      && !self.channel.is_empty()
  }

  /// Serializes the measurement's selected attributes as text, ordered by
  /// entropy with high-entropy attributes coming first. The argument
  /// `method` determines which attributes are included.
  pub fn order_high_entropy_first(
    &self,
    method: CrowdIdMethod,
    versions: &VersionTracker,
  ) -> Vec<String> {
    match method {
      CrowdIdMethod::All => vec![
        // The per-attribute numbers come from a -entropy run over a full
        // day of measurements.
        self.metric_name.clone(),         // 0.90
        self.metric_value.to_string(),    // 0.66
        self.week_of_install.to_string(), // 0.93
        self.country_code.clone(),        // 0.72
        self.platform.clone(),            // 0.57
        self.year_of_install.to_string(), // 0.40
        self.version.clone(),             // 0.25
        self.refcode.clone(),             // 0.17
        self.week_of_survey.to_string(),  // 0.15
        self.channel.clone(),             // 0.03
        self.year_of_survey.to_string(),  // 0.00
      ],
      CrowdIdMethod::NoValue => vec![
        self.metric_name.clone(),
        self.week_of_install.to_string(),
        self.country_code.clone(),
        self.platform.clone(),
        self.year_of_install.to_string(),
        self.version.clone(),
        self.refcode.clone(),
        self.week_of_survey.to_string(),
        self.channel.clone(),
        self.year_of_survey.to_string(),
        versions
          .is_recent_version(&self.channel, &self.version)
          .to_string(),
      ],
      CrowdIdMethod::Minimal => vec![
        self.metric_name.clone(),
        self.metric_value.to_string(),
        self.week_of_install.to_string(),
        self.country_code.clone(),
        self.platform.clone(),
        self.channel.clone(),
        versions
          .is_recent_version(&self.channel, &self.version)
          .to_string(),
      ],
    }
  }

  /// Returns the reverse of [`Self::order_high_entropy_first`], with the
  /// two leading attributes pinned to their positions.
  pub fn order_high_entropy_last(
    &self,
    method: CrowdIdMethod,
    versions: &VersionTracker,
  ) -> Vec<String> {
    let ordered = self.order_high_entropy_first(method, versions);
    let mut reversed = ordered[..2].to_vec();
    reversed.extend(ordered[2..].iter().rev().cloned());
    reversed
  }

  /// Returns the measurement's crowd ID for the given method: the SHA-1
  /// over the concatenated high-entropy-first attribute list.
  pub fn crowd_id(&self, method: CrowdIdMethod, versions: &VersionTracker) -> CrowdId {
    let mut hasher = Sha1::new();
    for attr in self.order_high_entropy_first(method, versions) {
      hasher.update(attr.as_bytes());
    }
    CrowdId(hex::encode(hasher.finalize()))
  }

  /// The header for CSV-formatted measurement output.
  pub fn csv_header() -> &'static str {
    "yos,yoi,wos,woi,metric_value,metric_name,country_code,platform,version,channel,refcode"
  }

  /// The measurement with all its attributes as a CSV record.
  pub fn csv_record(&self) -> String {
    format!(
      "{},{},{},{},{},{},{},{},{},{},{}",
      self.year_of_survey,
      self.year_of_install,
      self.week_of_survey,
      self.week_of_install,
      self.metric_value,
      self.metric_name,
      self.country_code,
      self.platform,
      self.version,
      self.channel,
      self.refcode
    )
  }
}

impl fmt::Display for P3AMeasurement {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    writeln!(f, "P3A measurement:")?;
    writeln!(f, "\tYear of survey:  {}", self.year_of_survey)?;
    writeln!(f, "\tYear of install: {}", self.year_of_install)?;
    writeln!(f, "\tWeek of survey:  {}", self.week_of_survey)?;
    writeln!(f, "\tWeek of install: {}", self.week_of_install)?;
    writeln!(f, "\tMetric value:    {}", self.metric_value)?;
    writeln!(f, "\tMetric name:     {}", self.metric_name)?;
    writeln!(f, "\tCountry code:    {}", self.country_code)?;
    writeln!(f, "\tPlatform:        {}", self.platform)?;
    writeln!(f, "\tVersion:         {}", self.version)?;
    writeln!(f, "\tChannel:         {}", self.channel)?;
    writeln!(f, "\tRefcode:         {}", self.refcode)
  }
}

/// A report that the briefcase can hold: either a structured P3A
/// measurement, or an opaque payload that already carries its crowd ID.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Report {
  P3a(P3AMeasurement),
  Opaque { crowd_id: CrowdId, payload: Vec<u8> },
}

impl Report {
  pub fn crowd_id(&self, method: CrowdIdMethod, versions: &VersionTracker) -> CrowdId {
    match self {
      Report::P3a(measurement) => measurement.crowd_id(method, versions),
      Report::Opaque { crowd_id, .. } => crowd_id.clone(),
    }
  }

  /// The report's payload: for P3A measurements, a stable textual
  /// representation. Distinct measurements have distinct payloads.
  pub fn payload(&self) -> Vec<u8> {
    match self {
      Report::P3a(measurement) => measurement.to_string().into_bytes(),
      Report::Opaque { payload, .. } => payload.clone(),
    }
  }
}

/// A browser version, following semantic versioning.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
  major: u32,
  minor: u32,
  patch: u32,
}

impl Version {
  /// Parses a `major.minor.patch` version string. A malformed version is a
  /// fatal input error; the process refuses to continue.
  pub fn parse(text: &str) -> Self {
    let fields: Vec<&str> = text.split('.').collect();
    if fields.len() != 3 {
      panic!("malformed version string {:?}", text);
    }
    let component = |field: &str| {
      field
        .parse::<u32>()
        .unwrap_or_else(|_| panic!("malformed version component {:?} in {:?}", field, text))
    };
    Version {
      major: component(fields[0]),
      minor: component(fields[1]),
      patch: component(fields[2]),
    }
  }

  /// Returns true if this version is strictly newer than `other`.
  pub fn newer_than(&self, other: &Version) -> bool {
    self > other
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
  }
}

/// Tracks the most recent browser version observed per release channel.
///
/// The tracker updates itself as it sees newer versions, so early
/// measurements of a rollout produce a small number of false positives.
/// That is acceptable at the scale of millions of measurements. The set of
/// channels is closed; versions on unexpected channels are never
/// considered recent.
pub struct VersionTracker {
  last_versions: Mutex<HashMap<String, Version>>,
}

impl VersionTracker {
  pub fn new() -> Self {
    let channels = [
      "nightly",
      "release",
      "beta",
      "canary",
      "dev",
      "developer",
      "unknown",
      "",
    ];
    let last_versions = channels
      .iter()
      .map(|channel| (channel.to_string(), Version::parse("0.0.0")))
      .collect();
    Self {
      last_versions: Mutex::new(last_versions),
    }
  }

  /// Returns true if `version` is the same as or newer than the most
  /// recent version observed for `channel`, updating the stored version
  /// when it is strictly newer.
  pub fn is_recent_version(&self, channel: &str, version: &str) -> bool {
    let mut last_versions = self.last_versions.lock().unwrap();
    let last_version = match last_versions.get_mut(channel) {
      Some(last_version) => last_version,
      None => {
        log::warn!("got unexpected channel {:?}", channel);
        return false;
      }
    };
    if version.is_empty() {
      return false;
    }

    let version = Version::parse(version);
    if version.newer_than(last_version) {
      log::info!("updating latest {} version to {}", channel, version);
      *last_version = version;
      return true;
    }
    version == *last_version
  }
}

impl Default for VersionTracker {
  fn default() -> Self {
    VersionTracker::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const METHODS: [CrowdIdMethod; 3] = [
    CrowdIdMethod::All,
    CrowdIdMethod::NoValue,
    CrowdIdMethod::Minimal,
  ];

  fn sample_measurement() -> P3AMeasurement {
    P3AMeasurement {
      year_of_survey: 2022,
      year_of_install: 2022,
      week_of_survey: 1,
      week_of_install: 1,
      metric_value: 1,
      metric_name: "Brave.Rewards.WalletState".to_string(),
      country_code: "CA".to_string(),
      platform: "winx64-bc".to_string(),
      version: "1.37.60".to_string(),
      channel: "nightly".to_string(),
      refcode: "none".to_string(),
    }
  }

  #[test]
  fn crowd_id_is_lowercase_sha1_hex() {
    let versions = VersionTracker::new();
    let measurement = sample_measurement();
    for method in METHODS {
      let crowd_id = measurement.crowd_id(method, &versions);
      assert_eq!(crowd_id.as_str().len(), 40);
      assert!(crowd_id
        .as_str()
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
      // Identical measurements fall into the same crowd.
      assert_eq!(crowd_id, measurement.crowd_id(method, &versions));
    }
  }

  #[test]
  fn crowd_ids_differ_between_methods() {
    let versions = VersionTracker::new();
    let measurement = sample_measurement();
    let full = measurement.crowd_id(CrowdIdMethod::All, &versions);
    let minimal = measurement.crowd_id(CrowdIdMethod::Minimal, &versions);
    assert_ne!(full, minimal);
  }

  #[test]
  fn metric_value_affects_full_crowd_id() {
    let versions = VersionTracker::new();
    let mut measurement = sample_measurement();
    let before = measurement.crowd_id(CrowdIdMethod::All, &versions);
    measurement.metric_value += 1;
    let after = measurement.crowd_id(CrowdIdMethod::All, &versions);
    assert_ne!(before, after);
  }

  #[test]
  fn metric_value_does_not_affect_no_value_crowd_id() {
    let versions = VersionTracker::new();
    let mut measurement = sample_measurement();
    let before = measurement.crowd_id(CrowdIdMethod::NoValue, &versions);
    measurement.metric_value += 1;
    let after = measurement.crowd_id(CrowdIdMethod::NoValue, &versions);
    assert_eq!(before, after);
  }

  #[test]
  fn attribute_changes_move_the_crowd() {
    let versions = VersionTracker::new();
    let measurement = sample_measurement();
    for method in METHODS {
      let before = measurement.crowd_id(method, &versions);
      let mut changed = measurement.clone();
      changed.metric_name = "Brave.Core.UsageDaily".to_string();
      assert_ne!(before, changed.crowd_id(method, &versions));
    }
  }

  #[test]
  fn orderings_pin_the_leading_attributes() {
    let versions = VersionTracker::new();
    let measurement = sample_measurement();
    for method in METHODS {
      let hef = measurement.order_high_entropy_first(method, &versions);
      let hel = measurement.order_high_entropy_last(method, &versions);
      assert_eq!(hef.len(), method.num_attrs());
      assert_eq!(hef.len(), hel.len());
      assert_eq!(hef[0], hel[0]);
      assert_eq!(hef[1], hel[1]);
      for i in 2..hef.len() {
        assert_eq!(hel[hef.len() - 1 - (i - 2)], hef[i]);
      }
    }
  }

  #[test]
  fn all_ordering_has_expected_shape() {
    let versions = VersionTracker::new();
    let measurement = sample_measurement();
    let hef = measurement.order_high_entropy_first(CrowdIdMethod::All, &versions);
    assert_eq!(hef[0], "Brave.Rewards.WalletState");
    assert_eq!(hef[1], "1");
    assert_eq!(hef[10], "2022");
  }

  #[test]
  fn is_valid_checks_bounds_and_mandatory_fields() {
    let measurement = sample_measurement();
    assert!(measurement.is_valid());

    let mut bad = measurement.clone();
    bad.metric_name = String::new();
    assert!(!bad.is_valid());

    let mut bad = measurement.clone();
    bad.week_of_install = 0;
    assert!(!bad.is_valid());

    let mut bad = measurement.clone();
    bad.week_of_survey = 54;
    assert!(!bad.is_valid());

    let mut bad = measurement.clone();
    bad.year_of_install = 1969;
    assert!(!bad.is_valid());

    let mut bad = measurement;
    bad.metric_value = -1;
    assert!(!bad.is_valid());
  }

  #[test]
  fn csv_header_and_record_have_the_same_shape() {
    let measurement = sample_measurement();
    let header = P3AMeasurement::csv_header();
    let record = measurement.csv_record();
    assert_eq!(
      header.matches(',').count(),
      record.matches(',').count()
    );
  }

  #[test]
  fn payloads_of_distinct_measurements_differ() {
    let versions = VersionTracker::new();
    let m1 = P3AMeasurement {
      year_of_survey: 2022,
      ..Default::default()
    };
    let m2 = P3AMeasurement {
      year_of_survey: 2021,
      ..Default::default()
    };
    assert_ne!(m1.to_string(), m2.to_string());
    assert_ne!(Report::P3a(m1.clone()).payload(), Report::P3a(m2.clone()).payload());
    assert_ne!(
      m1.crowd_id(CrowdIdMethod::All, &versions),
      m2.crowd_id(CrowdIdMethod::All, &versions)
    );
  }

  #[test]
  fn decodes_wire_format_with_historical_alias() {
    let json = r#"{"channel":"nightly","country_code":"US","metric_hash":"Brave.Core.UsageDaily","metric_value":1,"platform":"linux-bc","refcode":"none","version":"1.36.46","woi":3,"wos":3,"yoi":2022,"yos":2022}"#;
    let measurement: P3AMeasurement = serde_json::from_str(json).unwrap();
    assert_eq!(measurement.metric_name, "Brave.Core.UsageDaily");
    assert_eq!(measurement.week_of_install, 3);
    assert!(measurement.is_valid());

    let value = serde_json::to_value(&measurement).unwrap();
    assert_eq!(value["yos"], 2022);
    assert_eq!(value["metric_name"], "Brave.Core.UsageDaily");
  }

  #[test]
  fn version_ordering_is_total() {
    assert!(Version::parse("0.0.1").newer_than(&Version::parse("0.0.0")));
    assert!(Version::parse("1.2.3").newer_than(&Version::parse("1.2.2")));
    assert!(Version::parse("1.0.0").newer_than(&Version::parse("0.1.1")));
    assert!(!Version::parse("1.0.0").newer_than(&Version::parse("1.0.0")));
    assert_eq!(Version::parse("1.0.0"), Version::parse("1.0.0"));
    assert_ne!(Version::parse("1.0.0"), Version::parse("2.0.0"));
  }

  #[test]
  #[should_panic(expected = "malformed version")]
  fn malformed_version_is_fatal() {
    Version::parse("1.2");
  }

  #[test]
  fn recent_version_tracking() {
    let versions = VersionTracker::new();
    assert!(versions.is_recent_version("release", "0.0.1"));
    assert!(versions.is_recent_version("release", "0.0.2"));
    assert!(versions.is_recent_version("release", "1.0.0"));
    assert!(!versions.is_recent_version("release", "0.9.0"));
    assert!(versions.is_recent_version("release", "1.0.0"));

    assert!(!versions.is_recent_version("imaginary", "1.0.0"));
    assert!(!versions.is_recent_version("release", ""));
  }
}
