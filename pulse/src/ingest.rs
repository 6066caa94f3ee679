//! Asynchronous write-through.
//!
//! Interceptors hand records to a bounded channel with `try_send` and move
//! on; a single background worker drains the channel into storage. A full
//! channel drops the record rather than blocking the producer.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::model::{DependencyMetric, QueryRecord, RequestRecord};
use crate::storage::MemoryStorage;

/// Ingest channel depth.
pub(crate) const QUEUE: usize = 4_096;

/// One record on its way into storage.
pub(crate) enum Ingest {
    Request(RequestRecord),
    Query(QueryRecord),
    Dependency(DependencyMetric),
}

/// Drain the ingest channel until shutdown.
pub(crate) async fn ingest_loop(
    mut rx: mpsc::Receiver<Ingest>,
    storage: Arc<MemoryStorage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            Ingest::Request(record) => storage.add_request(record),
            Ingest::Query(record) => storage.add_query(record),
            Ingest::Dependency(metric) => storage.add_dependency(metric),
        }
    }

    // Drain whatever is already queued so shutdown does not lose records.
    while let Ok(event) = rx.try_recv() {
        match event {
            Ingest::Request(record) => storage.add_request(record),
            Ingest::Query(record) => storage.add_query(record),
            Ingest::Dependency(metric) => storage.add_dependency(metric),
        }
    }
    debug!("Ingest worker stopped");
}
