//! The task that owns the [`TracingService`] and serializes every request
//! onto it.
//!
//! This is the concrete version of the single-threaded IPC dispatch loop a
//! real service process runs: one task reads commands off an `mpsc`
//! channel and calls straight into `&mut TracingService`, so two endpoints
//! racing each other never observe a half-applied mutation.

use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

use trace_service::TracingService;

#[cfg(debug_assertions)]
use crate::invariants::debug_assert_shutdown_observed;

use crate::command::Command;
use crate::shutdown::{ShutdownSignal, ShutdownState};

/// Default bound on the command channel. A full channel applies
/// backpressure to whichever endpoint is sending fastest, the same way a
/// real producer would block on a full IPC socket.
const COMMAND_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn spawn(service: TracingService) -> (mpsc::Sender<Command>, ShutdownSignal) {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let state = Arc::new(ShutdownState::new());
    let wake = Arc::new(Notify::new());
    let signal = ShutdownSignal::new(state.clone(), wake.clone());

    tokio::spawn(run(service, rx, state, wake));

    (tx, signal)
}

async fn run(mut service: TracingService, mut rx: mpsc::Receiver<Command>, state: Arc<ShutdownState>, wake: Arc<Notify>) {
    loop {
        tokio::select! {
            biased;
            cmd = rx.recv() => {
                match cmd {
                    Some(cmd) => handle(&mut service, cmd),
                    None => break,
                }
            }
            () = wake.notified() => {
                let shutting_down = state.is_shutdown_initiated();
                #[cfg(debug_assertions)]
                debug_assert_shutdown_observed!(shutting_down, shutting_down);
                if shutting_down {
                    log::info!("dispatcher received shutdown signal, draining queued commands");
                    break;
                }
            }
        }
    }

    // Graceful drain: answer every command already queued before the
    // channel closes so in-flight callers don't see `DispatcherClosed`.
    while let Ok(cmd) = rx.try_recv() {
        handle(&mut service, cmd);
    }
    log::info!("dispatcher task exiting");
}

#[allow(clippy::too_many_lines)]
fn handle(service: &mut TracingService, cmd: Command) {
    match cmd {
        Command::RegisterProducer { uid, pid, name, reply } => {
            let _ = reply.send(service.register_producer(uid, pid, name));
        }
        Command::UnregisterProducer { id, reply } => {
            service.unregister_producer(id);
            let _ = reply.send(());
        }
        Command::ProvisionSharedMemory { producer_id, shm_size_kb, page_size_kb, reply } => {
            let _ = reply.send(service.provision_shared_memory(producer_id, shm_size_kb, page_size_kb));
        }
        Command::RegisterDataSource { producer_id, descriptor, reply } => {
            let _ = reply.send(service.register_data_source(producer_id, descriptor));
        }
        Command::EnableTracing { consumer_uid, config, reply } => {
            let _ = reply.send(service.enable_tracing(consumer_uid, *config));
        }
        Command::StartTracing { session_id, reply } => {
            let _ = reply.send(service.start_tracing(session_id));
        }
        Command::DisableTracing { session_id, reply } => {
            let _ = reply.send(service.disable_tracing(session_id));
        }
        Command::NotifyDataSourceStarted { producer_id, session_id, instance_id, reply } => {
            let _ = reply.send(service.notify_data_source_started(producer_id, session_id, instance_id));
        }
        Command::NotifyDataSourceStopped { producer_id, session_id, instance_id, reply } => {
            let _ = reply.send(service.notify_data_source_stopped(producer_id, session_id, instance_id));
        }
        Command::CommitData { producer_id, chunks, reply } => {
            let _ = reply.send(service.commit_data(producer_id, chunks));
        }
        Command::ApplyPatches { producer_id, patches, reply } => {
            service.apply_patches(producer_id, patches);
            let _ = reply.send(());
        }
        Command::RequestFlush { session_id, initiator, reply } => {
            let _ = reply.send(service.request_flush(session_id, initiator));
        }
        Command::NotifyFlushComplete { session_id, producer, id, reply } => {
            let _ = reply.send(service.notify_flush_complete(session_id, producer, id));
        }
        Command::ActivateTrigger { producer_id, name, skip_roll, now, reply } => {
            let _ = reply.send(service.activate_trigger(producer_id, &name, skip_roll, now));
        }
        Command::CloneSession { source_session_id, caller_uid, is_bugreport_principal, reply } => {
            let _ = reply.send(service.clone_session(source_session_id, caller_uid, is_bugreport_principal));
        }
        Command::Detach { session_id, key, reply } => {
            let _ = reply.send(service.detach(session_id, key));
        }
        Command::Attach { key, reply } => {
            let _ = reply.send(service.attach(&key));
        }
        Command::ReadBuffers { session_id, reply } => {
            let _ = reply.send(service.read_buffers(session_id));
        }
        Command::QueryServiceState { reply } => {
            let _ = reply.send(service.query_service_state());
        }
        Command::Capabilities { reply } => {
            let _ = reply.send(service.capabilities());
        }
        Command::Metrics { reply } => {
            let _ = reply.send(service.metrics());
        }
        Command::SubscribeEvents { want_state_changes, want_clone_triggered, reply } => {
            let _ = reply.send(service.subscribe_events(want_state_changes, want_clone_triggered));
        }
        Command::UnsubscribeEvents { subscriber_id, reply } => {
            service.unsubscribe_events(subscriber_id);
            let _ = reply.send(());
        }
        Command::PollEvents { subscriber_id, reply } => {
            let _ = reply.send(service.poll_events(subscriber_id));
        }
    }
}
