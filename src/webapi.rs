//! The `webapi` module provides the HTTP ingress: JSON-encoded P3A
//! measurement batches and encrypted measurement blobs, both feeding the
//! shuffler's inbox.

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio::sync::mpsc;

use crate::consts::{P3A_ENDPOINT, SHUFFLER_ENDPOINT};
use crate::measurement::{P3AMeasurement, Report, ShufflerMeasurement};

/// Builds the ingress router: P3A measurement batches on `/reports`,
/// encrypted blobs on `/encrypted-reports`.
pub fn router(inbox: mpsc::Sender<Vec<Report>>) -> Router {
  Router::new()
    .route(P3A_ENDPOINT, post(handle_reports))
    .route(SHUFFLER_ENDPOINT, post(handle_encrypted_reports))
    .with_state(inbox)
}

/// Accepts a JSON array of P3A measurements and pushes the valid ones to
/// the shuffler as a single batch. Malformed JSON is rejected by the
/// extractor; decodable-but-invalid measurements are silently dropped.
async fn handle_reports(
  State(inbox): State<mpsc::Sender<Vec<Report>>>,
  Json(measurements): Json<Vec<P3AMeasurement>>,
) -> StatusCode {
  let batch: Vec<Report> = measurements
    .into_iter()
    .filter(|measurement| measurement.is_valid())
    .map(Report::P3a)
    .collect();
  let num_measurements = batch.len();
  if inbox.send(batch).await.is_err() {
    return StatusCode::SERVICE_UNAVAILABLE;
  }
  log::info!("sent {} P3A measurements to shuffler", num_measurements);
  StatusCode::OK
}

/// Accepts an encrypted measurement. Decryption is not provisioned yet,
/// so the blob is acknowledged and dropped.
async fn handle_encrypted_reports(
  Json(_measurement): Json<ShufflerMeasurement>,
) -> StatusCode {
  StatusCode::OK
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn serve(inbox: mpsc::Sender<Vec<Report>>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
      axum::serve(listener, router(inbox)).await.unwrap();
    });
    base
  }

  #[tokio::test]
  async fn accepts_measurement_batches() {
    let (tx, mut rx) = mpsc::channel(1);
    let base = serve(tx).await;

    let body = serde_json::json!([
      {
        "yos": 2022, "yoi": 2022, "wos": 1, "woi": 1, "metric_value": 1,
        "metric_name": "Brave.Core.UsageDaily", "country_code": "US",
        "platform": "linux-bc", "version": "1.36.46", "channel": "release",
        "refcode": "none"
      },
      // Decodable but invalid: dropped before reaching the shuffler.
      { "yos": 2022 }
    ]);
    let response = reqwest::Client::new()
      .post(format!("{}{}", base, P3A_ENDPOINT))
      .json(&body)
      .send()
      .await
      .unwrap();
    assert_eq!(response.status().as_u16(), 200);

    let batch = rx.recv().await.unwrap();
    assert_eq!(batch.len(), 1);
    match &batch[0] {
      Report::P3a(measurement) => {
        assert_eq!(measurement.metric_name, "Brave.Core.UsageDaily")
      }
      other => panic!("unexpected report {:?}", other),
    }
  }

  #[tokio::test]
  async fn rejects_malformed_json() {
    let (tx, _rx) = mpsc::channel(1);
    let base = serve(tx).await;

    let response = reqwest::Client::new()
      .post(format!("{}{}", base, P3A_ENDPOINT))
      .header("content-type", "application/json")
      .body("not json")
      .send()
      .await
      .unwrap();
    assert!(response.status().is_client_error());
  }

  #[tokio::test]
  async fn accepts_encrypted_blobs() {
    let (tx, _rx) = mpsc::channel(1);
    let base = serve(tx).await;

    let body = serde_json::json!({ "encrypted": "b3BhcXVlIGJsb2I=" });
    let response = reqwest::Client::new()
      .post(format!("{}{}", base, SHUFFLER_ENDPOINT))
      .json(&body)
      .send()
      .await
      .unwrap();
    assert_eq!(response.status().as_u16(), 200);
  }
}
