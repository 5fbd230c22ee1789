//! Event subscription as an async [`Stream`](futures_core::Stream).
//!
//! The dispatcher itself has no push mechanism — events sit in a
//! per-subscriber queue until polled. `EventStream` hides that behind a
//! plain `Stream`: it polls the dispatcher on an interval, buffers
//! whatever batch comes back, and yields one event per `poll_next` until
//! the buffer drains, at which point it waits for the next tick.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use pin_project_lite::pin_project;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Interval;

use trace_service::ServiceEvent;

use crate::command::Command;
use crate::config::EventStreamConfig;

type PollFuture = Pin<Box<dyn Future<Output = Vec<ServiceEvent>> + Send>>;

fn poll_events_once(tx: mpsc::Sender<Command>, subscriber_id: u64) -> PollFuture {
    Box::pin(async move {
        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Command::PollEvents { subscriber_id, reply: reply_tx }).await.is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    })
}

pin_project! {
    pub struct EventStream {
        tx: mpsc::Sender<Command>,
        subscriber_id: u64,
        buffer: VecDeque<ServiceEvent>,
        #[pin]
        interval: Interval,
        #[pin]
        pending: Option<PollFuture>,
    }
}

impl EventStream {
    pub(crate) fn new(tx: mpsc::Sender<Command>, subscriber_id: u64, config: EventStreamConfig) -> Self {
        Self { tx, subscriber_id, buffer: VecDeque::new(), interval: tokio::time::interval(config.poll_interval), pending: None }
    }

    #[must_use]
    pub fn subscriber_id(&self) -> u64 {
        self.subscriber_id
    }
}

impl Stream for EventStream {
    type Item = ServiceEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(event) = this.buffer.pop_front() {
                return Poll::Ready(Some(event));
            }

            if this.pending.is_none() {
                if this.interval.as_mut().poll_tick(cx).is_pending() {
                    return Poll::Pending;
                }
                this.pending.set(Some(poll_events_once(this.tx.clone(), *this.subscriber_id)));
            }

            match this.pending.as_mut().as_pin_mut().expect("just set").poll(cx) {
                Poll::Ready(events) => {
                    this.pending.set(None);
                    this.buffer.extend(events);
                    if this.buffer.is_empty() {
                        // Nothing new this tick; wait for the next one.
                        continue;
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
