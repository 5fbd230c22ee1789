//! Async producer/consumer endpoints fronting the tracing session engine.
//!
//! A real tracing service runs as its own process, reachable from
//! producers and consumers over a socket; this crate stands in for that
//! boundary within one process. [`spawn_service`] starts a single
//! dispatcher task that owns a `TracingService` outright and answers
//! commands sent to it over an `mpsc` channel — one `(request,
//! completion-callback)` pair per call, exactly mirroring how a real
//! service's IPC dispatch loop serializes concurrent producer and
//! consumer requests onto one thread.
//!
//! # Example
//!
//! ```ignore
//! use trace_ipc::spawn_service;
//! use trace_service::TraceConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let (producers, consumer, _shutdown) = spawn_service();
//!
//!     let producer = producers.register(1000, 42, "my_producer".into()).await.unwrap();
//!     let session = consumer.enable_tracing(1000, TraceConfig::default()).await.unwrap();
//!     consumer.start_tracing(session).await.unwrap();
//!     producer.unregister().await.unwrap();
//! }
//! ```

mod command;
mod config;
mod consumer;
mod dispatcher;
mod error;
mod events;
mod invariants;
mod producer;
mod shutdown;

pub use config::EventStreamConfig;
pub use consumer::ConsumerEndpoint;
pub use error::IpcError;
pub use events::EventStream;
pub use producer::{ProducerEndpoint, ProducerEndpointFactory};
pub use shutdown::ShutdownSignal;

// Re-export useful stream combinators for callers of `ConsumerEndpoint::observe_events`.
pub use tokio_stream::StreamExt;

use trace_service::TracingService;

/// Starts a dispatcher task for a fresh [`TracingService`] and returns the
/// endpoints used to talk to it.
#[must_use]
pub fn spawn_service() -> (ProducerEndpointFactory, ConsumerEndpoint, ShutdownSignal) {
    spawn_service_with(TracingService::new())
}

/// Like [`spawn_service`], but starting from a caller-provided service —
/// useful for tests that want to seed state before wiring up endpoints.
#[must_use]
pub fn spawn_service_with(service: TracingService) -> (ProducerEndpointFactory, ConsumerEndpoint, ShutdownSignal) {
    let (tx, shutdown) = dispatcher::spawn(service);
    (ProducerEndpointFactory::new(tx.clone(), shutdown.clone()), ConsumerEndpoint::new(tx), shutdown)
}
