//! Delivery of event batches to the collection endpoint
//!
//! Delivery is at-most-once and unconfirmed. Two transports exist:
//!
//! - [`BeaconTransport`]: a bounded queue drained by one background worker.
//!   `dispatch` only enqueues, and [`BeaconTransport::close`] drains whatever is
//!   queued, so events emitted right before shutdown still go out.
//! - [`KeepaliveTransport`]: one detached POST per batch over a pooled keep-alive
//!   connection. Used when the beacon is disabled or refuses a batch. Requests
//!   outlive the transport; [`KeepaliveTransport::close`] only waits for them.
//!
//! Neither transport retries, and failures are only logged.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::config::CollectorConfig;
use crate::envelope::EventBatch;
use crate::error::{Error, Result};

/// Fire-and-forget delivery of one batch
pub trait Transport: Send + Sync {
    /// Hand `batch` over for delivery to `endpoint`.
    ///
    /// Returns `false` if the transport could not take the batch, in which case the
    /// caller may try another transport. `true` says nothing about delivery.
    fn dispatch(&self, endpoint: &str, batch: EventBatch) -> bool;
}

/// Shared HTTP client for the collection endpoint
pub struct HttpSender {
    http_client: reqwest::Client,
}

impl HttpSender {
    /// Build a client with the configured timeout and TCP keep-alive
    pub fn new(config: &CollectorConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(config.timeout())
            .tcp_keepalive(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client })
    }

    /// POST `{"events": [...]}` to `endpoint`
    pub async fn send(&self, endpoint: &str, batch: &EventBatch) -> Result<()> {
        let response = self
            .http_client
            .post(endpoint)
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Transport(format!(
                "API error ({}): {}",
                status, error_text
            )))
        }
    }
}

/// Log a failed delivery; louder when the debug flag is on
fn report_failure(debug: &AtomicBool, endpoint: &str, error: &Error) {
    if debug.load(Ordering::Relaxed) {
        tracing::warn!(endpoint = %endpoint, error = %error, "Failed to deliver event");
    } else {
        tracing::debug!(endpoint = %endpoint, error = %error, "Failed to deliver event");
    }
}

fn current_handle() -> Result<Handle> {
    Handle::try_current()
        .map_err(|e| Error::Config(format!("transport requires a Tokio runtime: {}", e)))
}

struct Delivery {
    endpoint: String,
    batch: EventBatch,
}

/// Queued delivery that survives tracker shutdown
pub struct BeaconTransport {
    queue: Mutex<Option<mpsc::Sender<Delivery>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BeaconTransport {
    /// Start the delivery worker on the current Tokio runtime
    pub fn spawn(sender: Arc<HttpSender>, capacity: usize, debug: Arc<AtomicBool>) -> Result<Self> {
        let handle = current_handle()?;
        let (tx, mut rx) = mpsc::channel::<Delivery>(capacity.max(1));

        let worker = handle.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match sender.send(&delivery.endpoint, &delivery.batch).await {
                    Ok(()) => tracing::trace!(endpoint = %delivery.endpoint, "Beacon delivered"),
                    Err(e) => report_failure(&debug, &delivery.endpoint, &e),
                }
            }
            tracing::debug!("Beacon queue drained");
        });

        Ok(Self {
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Stop accepting batches and wait until the queued ones have been sent.
    pub async fn close(&self) {
        let queue = self.queue.lock().ok().and_then(|mut q| q.take());
        drop(queue);

        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Beacon worker ended abnormally");
            }
        }
    }
}

impl Transport for BeaconTransport {
    fn dispatch(&self, endpoint: &str, batch: EventBatch) -> bool {
        let Ok(queue) = self.queue.lock() else {
            return false;
        };
        match queue.as_ref() {
            Some(tx) => tx
                .try_send(Delivery {
                    endpoint: endpoint.to_string(),
                    batch,
                })
                .is_ok(),
            None => false,
        }
    }
}

/// One detached request per batch
pub struct KeepaliveTransport {
    sender: Arc<HttpSender>,
    handle: Handle,
    debug: Arc<AtomicBool>,
    in_flight: TaskTracker,
}

impl KeepaliveTransport {
    pub fn new(sender: Arc<HttpSender>, debug: Arc<AtomicBool>) -> Result<Self> {
        Ok(Self {
            sender,
            handle: current_handle()?,
            debug,
            in_flight: TaskTracker::new(),
        })
    }

    /// Wait for requests that are still in flight.
    pub async fn close(&self) {
        self.in_flight.close();
        self.in_flight.wait().await;
    }

    /// Number of requests not yet finished
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Transport for KeepaliveTransport {
    fn dispatch(&self, endpoint: &str, batch: EventBatch) -> bool {
        let sender = Arc::clone(&self.sender);
        let debug = Arc::clone(&self.debug);
        let endpoint = endpoint.to_string();
        self.in_flight.spawn_on(
            async move {
                if let Err(e) = sender.send(&endpoint, &batch).await {
                    report_failure(&debug, &endpoint, &e);
                }
            },
            &self.handle,
        );
        true
    }
}

/// Transport that records batches instead of sending them
///
/// Backs `--dry-run` in the CLI and stands in for the network in tests.
#[derive(Default)]
pub struct MemoryTransport {
    refuse: bool,
    batches: Mutex<Vec<(String, EventBatch)>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that refuses every batch, like a full beacon queue
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Default::default()
        }
    }

    /// Remove and return everything recorded so far
    pub fn take(&self) -> Vec<(String, EventBatch)> {
        self.batches
            .lock()
            .map(|mut b| std::mem::take(&mut *b))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transport for MemoryTransport {
    fn dispatch(&self, endpoint: &str, batch: EventBatch) -> bool {
        if self.refuse {
            return false;
        }
        match self.batches.lock() {
            Ok(mut batches) => {
                batches.push((endpoint.to_string(), batch));
                true
            }
            Err(_) => false,
        }
    }
}
