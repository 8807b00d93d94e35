//! Graceful teardown of a serving listener and its completion queue.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    call::CallTable,
    completion::{CompletionData, CompletionQueue, Event, Tag},
    status::Status,
    transport::Listener,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ShutdownReport {
    /// The listener confirmed that every accepted call was released.
    pub acknowledged: bool,
    /// The grace period ran out and remaining calls were cancelled.
    pub forced_cancel: bool,
    /// Calls that were still owned by the server when shutdown began.
    pub released_calls: usize,
    /// Every queued operation was observed before the queue was dropped.
    pub drained: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct ShutdownCoordinator {
    grace: Duration,
    drain_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration, drain_timeout: Duration) -> Self {
        Self {
            grace,
            drain_timeout,
        }
    }

    /// Stops `listener`, releases every call in `calls` and drains `queue`.
    pub fn run(
        &self,
        mut listener: Box<dyn Listener>,
        queue: &CompletionQueue,
        calls: &mut CallTable,
    ) -> ShutdownReport {
        let mut report = ShutdownReport {
            released_calls: calls.len(),
            ..ShutdownReport::default()
        };

        listener.shutdown_and_notify(&queue.sink(), Tag::ServerShutdown);
        for id in calls.ids() {
            let Some(call) = calls.get_mut(id) else {
                continue;
            };
            call.cancel(Status::cancelled("Server shutting down"));
            call.finish(Status::cancelled("Server shutting down"));
            if !call.has_outstanding_batch() {
                calls.remove(id);
            }
        }

        report.acknowledged = self.await_acknowledgement(queue, calls);
        if !report.acknowledged {
            warn!(
                grace_ms = self.grace.as_millis(),
                calls = calls.len(),
                "shutdown not acknowledged in time, cancelling remaining calls"
            );
            listener.cancel_all_calls();
            report.forced_cancel = true;
        }

        calls.clear();
        drop(listener);
        report.drained = queue.shutdown_and_drain(self.drain_timeout);
        info!(
            acknowledged = report.acknowledged,
            forced_cancel = report.forced_cancel,
            released_calls = report.released_calls,
            "server shut down"
        );
        report
    }

    /// Consumes completions until the shutdown tag arrives or the grace period
    /// ends. Calls whose last batch comes back are released on the way.
    fn await_acknowledgement(&self, queue: &CompletionQueue, calls: &mut CallTable) -> bool {
        let deadline = Instant::now() + self.grace;
        loop {
            match queue.next(deadline) {
                Event::Complete(completion) => match completion.tag {
                    Tag::ServerShutdown => return completion.success,
                    Tag::ReadRequest(id) | Tag::SendResponse(id) | Tag::Unary(id) => {
                        if let Some(call) = calls.get_mut(id) {
                            call.batch_completed(completion.tag);
                        }
                        calls.remove(id);
                    }
                    Tag::Accept { request } => {
                        if let CompletionData::Accepted(call) = completion.data {
                            debug!(request, method = %call.method, "dropping call accepted during shutdown");
                        }
                    }
                },
                Event::Timeout | Event::Shutdown => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    };

    use super::ShutdownCoordinator;
    use crate::{
        batch::OpBatch,
        call::{Call, CallTable},
        completion::{CompletionData, CompletionQueue, CompletionSink, PendingOp, Tag},
        errors::{SubmitError, TransportError},
        status::Status,
        transport::{CallHandle, Listener},
    };

    /// Listener that acknowledges shutdown immediately unless told to hold it.
    struct MockListener {
        hold_ack: bool,
        held: Option<PendingOp>,
        cancel_all: Arc<AtomicBool>,
    }

    impl Listener for MockListener {
        fn bind(&mut self, _address: &str) -> Result<u16, TransportError> {
            Ok(1)
        }

        fn start(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        fn request_call(&mut self, _cq: &CompletionSink, _tag: Tag) -> Result<(), SubmitError> {
            Ok(())
        }

        fn shutdown_and_notify(&mut self, cq: &CompletionSink, tag: Tag) {
            let op = cq.begin(tag, CompletionData::None).expect("queue open");
            if self.hold_ack {
                self.held = Some(op);
            } else {
                op.complete(true);
            }
        }

        fn cancel_all_calls(&mut self) {
            self.cancel_all.store(true, Ordering::SeqCst);
            if let Some(op) = self.held.take() {
                op.complete(true);
            }
        }
    }

    struct CountingHandle {
        cancels: Arc<AtomicUsize>,
    }

    impl CallHandle for CountingHandle {
        fn start_batch(&mut self, _batch: OpBatch, _tag: Tag) -> Result<(), SubmitError> {
            Ok(())
        }

        fn cancel(&mut self, _status: Status) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn listener(hold_ack: bool) -> (Box<MockListener>, Arc<AtomicBool>) {
        let cancel_all = Arc::new(AtomicBool::new(false));
        (
            Box::new(MockListener {
                hold_ack,
                held: None,
                cancel_all: cancel_all.clone(),
            }),
            cancel_all,
        )
    }

    #[test]
    fn acknowledged_shutdown_cancels_in_flight_call() {
        let queue = CompletionQueue::new();
        let cancels = Arc::new(AtomicUsize::new(0));
        let mut calls = CallTable::new();
        calls.insert(Call::new(
            "/echo",
            None,
            Box::new(CountingHandle {
                cancels: cancels.clone(),
            }),
        ));
        let (listener, cancel_all) = listener(false);

        let report = ShutdownCoordinator::new(Duration::from_secs(1), Duration::from_millis(100))
            .run(listener, &queue, &mut calls);

        assert!(report.acknowledged);
        assert!(!report.forced_cancel);
        assert!(report.drained);
        assert_eq!(report.released_calls, 1);
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(!cancel_all.load(Ordering::SeqCst));
        assert!(calls.is_empty());
        assert!(queue.is_shutdown());
    }

    #[test]
    fn missing_acknowledgement_forces_cancel_after_grace() {
        let queue = CompletionQueue::new();
        let mut calls = CallTable::new();
        let (listener, cancel_all) = listener(true);
        let started = Instant::now();

        let report = ShutdownCoordinator::new(Duration::from_millis(100), Duration::from_millis(100))
            .run(listener, &queue, &mut calls);

        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(!report.acknowledged);
        assert!(report.forced_cancel);
        assert!(report.drained);
        assert!(cancel_all.load(Ordering::SeqCst));
    }
}
