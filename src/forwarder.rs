//! The `forwarder` module takes shuffled report batches from the
//! shuffler's outbox and forwards them to the analyzer.

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::measurement::Report;

#[derive(Serialize)]
struct ReportBatch<'a> {
  batch: &'a [Report],
}

/// Forwards report batches to the analyzer. A single task reads the
/// inbox; each batch is forwarded on its own task so a slow analyzer
/// never blocks the loop.
pub struct Forwarder {
  inbox: Option<mpsc::Receiver<Vec<Report>>>,
  analyzer_url: String,
  client: reqwest::Client,
  done_tx: Option<oneshot::Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl Forwarder {
  pub fn new(inbox: mpsc::Receiver<Vec<Report>>, analyzer_url: &str) -> Self {
    Self {
      inbox: Some(inbox),
      analyzer_url: analyzer_url.to_string(),
      client: reqwest::Client::new(),
      done_tx: None,
      handle: None,
    }
  }

  /// Spawns the forwarder loop. Starting an already-started forwarder is
  /// a no-op.
  pub fn start(&mut self) {
    let mut inbox = match self.inbox.take() {
      Some(inbox) => inbox,
      None => return,
    };
    let (done_tx, mut done_rx) = oneshot::channel();
    self.done_tx = Some(done_tx);

    let client = self.client.clone();
    let analyzer_url = self.analyzer_url.clone();
    self.handle = Some(tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = &mut done_rx => return,
          batch = inbox.recv() => {
            let reports = match batch {
              Some(reports) => reports,
              None => return,
            };
            log::info!("received {} reports from shuffler", reports.len());
            let client = client.clone();
            let analyzer_url = analyzer_url.clone();
            tokio::spawn(async move {
              forward(&client, &analyzer_url, reports).await;
            });
          }
        }
      }
    }));
  }

  /// Signals the loop to terminate and waits for it.
  pub async fn stop(&mut self) {
    if let Some(done) = self.done_tx.take() {
      let _ = done.send(());
    }
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }
}

/// Forwards the given reports to the analyzer as a `{"batch": [...]}`
/// JSON document. Transport errors and non-2xx responses are logged and
/// the batch is dropped.
async fn forward(client: &reqwest::Client, analyzer_url: &str, reports: Vec<Report>) {
  if reports.is_empty() {
    log::info!("no reports given, so there is nothing to forward");
    return;
  }
  let num_reports = reports.len();

  let response = client
    .post(analyzer_url)
    .json(&ReportBatch { batch: &reports })
    .send()
    .await;
  match response {
    Err(e) => log::warn!("failed to POST reports to analyzer: {}", e),
    Ok(response) if !response.status().is_success() => {
      log::warn!("analyzer responded with HTTP status {}", response.status());
    }
    Ok(_) => log::info!("forwarded {} reports to analyzer", num_reports),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::measurement::CrowdId;

  #[tokio::test]
  async fn lifecycle() {
    let (_tx, rx) = mpsc::channel(1);
    let mut forwarder = Forwarder::new(rx, "http://analyzer.invalid");
    forwarder.start();
    forwarder.stop().await;
  }

  #[tokio::test]
  async fn forwards_batches_as_json() {
    use axum::routing::post;
    use axum::{Json, Router};

    let (tx, mut rx) = mpsc::channel::<serde_json::Value>(1);
    let app = Router::new().route(
      "/",
      post(move |Json(body): Json<serde_json::Value>| {
        let tx = tx.clone();
        async move {
          tx.send(body).await.unwrap();
          axum::http::StatusCode::OK
        }
      }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let analyzer_url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
      axum::serve(listener, app).await.unwrap();
    });

    let client = reqwest::Client::new();
    let reports = vec![Report::Opaque {
      crowd_id: CrowdId::from("crowd"),
      payload: b"payload".to_vec(),
    }];
    forward(&client, &analyzer_url, reports).await;

    let body = rx.recv().await.unwrap();
    assert_eq!(body["batch"].as_array().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn empty_batches_are_not_forwarded() {
    // An unroutable URL: forwarding an empty batch must return before any
    // network activity.
    let client = reqwest::Client::new();
    forward(&client, "http://analyzer.invalid", Vec::new()).await;
  }
}
