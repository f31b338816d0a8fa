//! The consumer loop. Fetch a delivery, decode its envelope, run it
//! through the ingestion pipeline, and ack/reject based on how the pipeline
//! failed. Broker transport failures (a dead connection, a stream that
//! ended) trigger a reconnect with the broker's own retry loop; unexpected
//! in-process failures (the ack/reject call itself erroring) back off
//! before the next iteration instead of spinning.
use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

use backoff::Backoff;
use common::knobs::{
    QUEUE_FETCH_TIMEOUT,
    RECONNECT_TIMEOUT,
    WORKER_INITIAL_BACKOFF,
    WORKER_MAX_BACKOFF,
};
use errors::ErrorMetadata;
use ingest::IngestContext;
use serde_json::Value as Json;

use crate::broker::BrokerClient;

/// Flipped by the SIGTERM handler; checked once per loop iteration so the
/// worker finishes acking/rejecting whatever delivery it's holding before
/// exiting.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Parse a delivery's payload as the top-level JSON array the pipeline requires.
/// Anything else (invalid JSON, a non-array value) is a malformed delivery:
/// bad_request, dropped without requeue.
fn parse_envelope(payload: &[u8]) -> anyhow::Result<Vec<Json>> {
    let value: Json = serde_json::from_slice(payload).map_err(|e| {
        anyhow::Error::new(ErrorMetadata::bad_request(
            "MalformedEnvelope",
            format!("delivery payload is not valid JSON: {e}"),
        ))
    })?;
    match value {
        Json::Array(items) => Ok(items),
        _ => Err(anyhow::Error::new(ErrorMetadata::bad_request(
            "MalformedEnvelope",
            "delivery payload is not a JSON array",
        ))),
    }
}

/// Run the consumer loop until `shutdown` is triggered. Owns the broker
/// connection for its entire lifetime; every other collaborator lives on
/// `ctx`.
pub async fn run(ctx: &IngestContext, broker: &mut BrokerClient, shutdown: &ShutdownFlag) {
    let mut unexpected_backoff = Backoff::new(*WORKER_INITIAL_BACKOFF, *WORKER_MAX_BACKOFF);

    while !shutdown.is_triggered() {
        let delivery = match broker.recv(*QUEUE_FETCH_TIMEOUT).await {
            Ok(None) => continue,
            Ok(Some(delivery)) => delivery,
            Err(e) => {
                tracing::warn!("broker transport failure, reconnecting: {e:#}");
                broker.reconnect(*RECONNECT_TIMEOUT).await;
                continue;
            },
        };

        let timer = ingest::metrics::batch_timer();
        let outcome = match parse_envelope(delivery.data()) {
            Ok(items) => ingest::process_batch(ctx, items).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => {
                timer.finish(true);
                ingest::metrics::BATCHES_PROCESSED_TOTAL.inc();
                if let Err(e) = broker.ack(delivery).await {
                    tracing::warn!("failed to ack delivery, reconnecting: {e:#}");
                    broker.reconnect(*RECONNECT_TIMEOUT).await;
                }
            },
            Err(mut e) => {
                timer.finish(false);
                common::errors::report_error(&mut e).await;
                let requeue = errors::ErrorMetadataAnyhowExt::should_requeue(&e);
                if requeue {
                    ingest::metrics::BATCHES_REQUEUED_TOTAL.inc();
                } else {
                    ingest::metrics::BATCHES_DROPPED_TOTAL.inc();
                }
                if let Err(reject_err) = broker.reject(delivery, requeue).await {
                    tracing::warn!("failed to reject delivery, reconnecting: {reject_err:#}");
                    broker.reconnect(*RECONNECT_TIMEOUT).await;
                    let backoff = unexpected_backoff.fail(&mut rand::rng());
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            },
        }
        unexpected_backoff.reset();
    }
    tracing::info!("consumer loop exiting on shutdown signal");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn well_formed_envelope_parses_to_its_items() {
        let payload = serde_json::to_vec(&json!([{"type": "cpu"}, {"type": "cpu.event"}])).unwrap();
        let items = parse_envelope(&payload).unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn non_array_top_level_value_is_bad_request() {
        let payload = serde_json::to_vec(&json!({"type": "cpu"})).unwrap();
        let err = parse_envelope(&payload).unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_bad_request(&err));
    }

    #[test]
    fn invalid_json_is_bad_request() {
        let err = parse_envelope(b"not json").unwrap_err();
        assert!(errors::ErrorMetadataAnyhowExt::is_bad_request(&err));
    }

    #[test]
    fn shutdown_flag_round_trips() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_triggered());
        flag.trigger();
        assert!(flag.is_triggered());
    }
}
