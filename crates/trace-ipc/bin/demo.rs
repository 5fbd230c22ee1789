//! Demonstration of the trace-ipc producer/consumer endpoints.
//!
//! Run with: `cargo run -p trace-ipc --bin demo`

use trace_ipc::{spawn_service, EventStreamConfig, StreamExt};
use trace_service::{BufferConfig, ChunkCommit, DataSourceDescriptor, TraceConfig};
use trace_smb::ChunkFlags;
use trace_types::{ChunkId, WriterId};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    println!("=== trace-ipc demo ===\n");

    let (producers, consumer, shutdown) = spawn_service();

    // A producer process connects and advertises one data source.
    let producer = producers.register(/* uid */ 1000, /* pid */ 4242, "demo_producer".into()).await?;
    producer
        .register_data_source(DataSourceDescriptor {
            name: "track_event".into(),
            will_notify_on_start: false,
            will_notify_on_stop: false,
            handles_incremental_state_clear: false,
            no_flush: false,
        })
        .await?;
    println!("producer {:?} registered", producer.id());

    // A consumer starts a trace.
    let config = TraceConfig { buffers: vec![BufferConfig { size_kb: 256, ..Default::default() }], ..Default::default() };
    let session = consumer.enable_tracing(1000, config).await?;
    println!("session {:?} started", session);

    // Watch for session-level events while the producer writes.
    let mut events = consumer.observe_events(true, false, EventStreamConfig::low_latency()).await?;
    let event_watcher = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            println!("event: {:?}", event);
        }
    });

    // The producer commits a chunk to the service.
    let buffers = consumer.read_buffers(session).await?;
    let buffer_id = buffers[0].0;
    producer
        .commit_data(vec![ChunkCommit {
            writer_id: WriterId::from(1),
            chunk_id: ChunkId::from(0),
            target_buffer: buffer_id,
            packet_count: 1,
            flags: ChunkFlags::NONE,
            payload: b"hello trace".to_vec(),
        }])
        .await?;
    println!("chunk committed");

    let stitched = consumer.read_buffers(session).await?;
    println!("buffer {:?} holds {} sequences", stitched[0].0, stitched[0].1.len());

    consumer.disable_tracing(session).await?;
    println!("session disabled");

    producer.unregister().await?;
    shutdown.shutdown();
    event_watcher.abort();

    println!("\n=== demo complete ===");
    Ok(())
}
