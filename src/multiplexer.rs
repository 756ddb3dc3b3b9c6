//! The `multiplexer` module fans report batches from one source channel
//! out to every registered sink.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::measurement::Report;

/// Fans batches from a source channel out to all registered sinks. The
/// task terminates, closing the sinks, once the source closes.
pub struct Multiplexer {
  source: Option<mpsc::Receiver<Vec<Report>>>,
  sinks: Vec<mpsc::Sender<Vec<Report>>>,
  handle: Option<JoinHandle<()>>,
}

impl Multiplexer {
  pub fn new(source: mpsc::Receiver<Vec<Report>>) -> Self {
    Self {
      source: Some(source),
      sinks: Vec::new(),
      handle: None,
    }
  }

  /// Registers a new sink and returns its receiving end. Sinks must be
  /// registered before `start`.
  pub fn register(&mut self) -> mpsc::Receiver<Vec<Report>> {
    let (tx, rx) = mpsc::channel(1);
    self.sinks.push(tx);
    rx
  }

  pub fn start(&mut self) {
    let mut source = match self.source.take() {
      Some(source) => source,
      None => return,
    };
    let sinks = std::mem::take(&mut self.sinks);
    log::info!("multiplexing to {} channels", sinks.len());
    self.handle = Some(tokio::spawn(async move {
      while let Some(batch) = source.recv().await {
        for sink in &sinks {
          if sink.send(batch.clone()).await.is_err() {
            log::warn!("dropping batch for a closed sink");
          }
        }
      }
      // Dropping the sinks closes the downstream channels.
    }));
  }

  /// Waits for the multiplexer task, which terminates once the source
  /// channel closes.
  pub async fn stop(&mut self) {
    if let Some(handle) = self.handle.take() {
      let _ = handle.await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::measurement::CrowdId;

  fn batch() -> Vec<Report> {
    vec![Report::Opaque {
      crowd_id: CrowdId::from("crowd"),
      payload: b"payload".to_vec(),
    }]
  }

  #[tokio::test]
  async fn fans_out_to_all_sinks() {
    let (tx, rx) = mpsc::channel(1);
    let mut multiplexer = Multiplexer::new(rx);
    let mut first = multiplexer.register();
    let mut second = multiplexer.register();
    multiplexer.start();

    tx.send(batch()).await.unwrap();
    assert_eq!(first.recv().await.unwrap().len(), 1);
    assert_eq!(second.recv().await.unwrap().len(), 1);

    // Closing the source terminates the task and the sinks.
    drop(tx);
    multiplexer.stop().await;
    assert!(first.recv().await.is_none());
    assert!(second.recv().await.is_none());
  }

  #[tokio::test]
  async fn survives_closed_sinks() {
    let (tx, rx) = mpsc::channel(1);
    let mut multiplexer = Multiplexer::new(rx);
    let closed = multiplexer.register();
    let mut open = multiplexer.register();
    drop(closed);
    multiplexer.start();

    tx.send(batch()).await.unwrap();
    assert_eq!(open.recv().await.unwrap().len(), 1);

    drop(tx);
    multiplexer.stop().await;
  }
}
