//! Async responder - runs request work off the channel reader
//!
//! Work runs on the blocking pool. The responder writes the response itself,
//! so a work function that fails or panics still produces an error response
//! carrying the request's correlation id.

use crate::server::ChannelSender;
use bytes::Bytes;
use ps_core::{ErrorClass, Result, SequencedPayload};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub struct Responder {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the in-flight count when a request finishes, however it ends.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
        ps_metrics::decrement_responder_in_flight();
    }
}

impl Responder {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run `work` on the request payload and send its result back on
    /// `sender` with the request's correlation id.
    pub fn async_execute<F>(&self, sender: ChannelSender, mut sp: SequencedPayload, work: F)
    where
        F: FnOnce(Bytes) -> Result<Bytes> + Send + 'static,
    {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        ps_metrics::increment_responder_in_flight();
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        let permits = Arc::clone(&self.permits);

        tokio::spawn(async move {
            let _guard = guard;
            let rid = sp.rid();

            let Ok(_permit) = permits.acquire_owned().await else {
                let _ = sender.respond_error(rid, "Page server is shutting down");
                return;
            };

            let request = sp.pull_payload();
            let outcome = tokio::task::spawn_blocking(move || work(request)).await;

            let sent = match outcome {
                Ok(Ok(response)) => {
                    sp.push_payload(response);
                    sender.respond(sp)
                },
                Ok(Err(e)) => {
                    if e.class() == ErrorClass::Upstream {
                        ps_metrics::increment_upstream_errors();
                    }
                    warn!(
                        target: "pageserver::responder",
                        channel = sender.channel_id(),
                        rid,
                        error = %e,
                        "Request failed"
                    );
                    sender.respond_error(rid, &e.to_string())
                },
                Err(e) => {
                    error!(
                        target: "pageserver::responder",
                        channel = sender.channel_id(),
                        rid,
                        error = %e,
                        "Request work panicked"
                    );
                    sender.respond_error(rid, "Request processing panicked")
                },
            };

            if let Err(e) = sent {
                debug!(
                    target: "pageserver::responder",
                    rid,
                    error = %e,
                    "Response dropped, channel closed"
                );
            }
        });
    }

    /// Wait for outstanding work, then refuse new work.
    /// Returns `false` if work was still running when `timeout` expired.
    pub async fn finalize(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        let drained = loop {
            let count = self.in_flight();
            if count == 0 {
                break true;
            }
            if start.elapsed() > timeout {
                warn!(
                    target: "pageserver::responder",
                    in_flight = count,
                    "Responder drain timed out"
                );
                break false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        self.permits.close();
        info!(
            target: "pageserver::responder",
            drained,
            elapsed_ms = start.elapsed().as_millis(),
            "Responder finalized"
        );

        drained
    }
}
