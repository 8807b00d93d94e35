//! Completion queue: the single event source an engine thread polls.
//!
//! Operations are registered through a [`CompletionSink`] and handed to the
//! transport as a [`PendingOp`]. Whatever happens to the operation, it comes
//! back exactly once as an [`Event::Complete`]: a `PendingOp` that is dropped
//! without being completed reports failure. The queue only reports
//! [`Event::Shutdown`] after shutdown was requested and every registered
//! operation has been observed.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::{batch::OpBatch, call::CallId, errors::SubmitError, transport::AcceptedCall};

/// Default bound on [`CompletionQueue::shutdown_and_drain`] when an engine tears down.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Correlation token. Identifies which phase of which call a completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// Outstanding request for a new server call. `request` increments per re-arm.
    Accept { request: u64 },
    /// The single batch of a client unary call.
    Unary(CallId),
    ReadRequest(CallId),
    SendResponse(CallId),
    ServerShutdown,
}

impl Tag {
    pub fn call(&self) -> Option<CallId> {
        match self {
            Tag::Unary(id) | Tag::ReadRequest(id) | Tag::SendResponse(id) => Some(*id),
            Tag::Accept { .. } | Tag::ServerShutdown => None,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            Tag::Accept { .. } => "accept",
            Tag::Unary(_) => "unary",
            Tag::ReadRequest(_) => "read_request",
            Tag::SendResponse(_) => "send_response",
            Tag::ServerShutdown => "server_shutdown",
        }
    }
}

/// What an operation hands back to the submitter when it completes.
pub enum CompletionData {
    None,
    Batch(OpBatch),
    Accepted(Box<AcceptedCall>),
}

impl fmt::Debug for CompletionData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Batch(batch) => f.debug_tuple("Batch").field(batch).finish(),
            Self::Accepted(call) => f.debug_tuple("Accepted").field(&call.method).finish(),
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    pub tag: Tag,
    pub success: bool,
    pub data: CompletionData,
}

impl Completion {
    pub fn into_batch(self) -> Option<OpBatch> {
        match self.data {
            CompletionData::Batch(batch) => Some(batch),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum Event {
    Complete(Completion),
    Timeout,
    Shutdown,
}

enum Signal {
    Complete(Completion),
    Wake,
}

struct Shared {
    tx: Sender<Signal>,
    pending: AtomicUsize,
    shutdown: AtomicBool,
}

pub struct CompletionQueue {
    shared: Arc<Shared>,
    rx: Receiver<Signal>,
}

impl CompletionQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            shared: Arc::new(Shared {
                tx,
                pending: AtomicUsize::new(0),
                shutdown: AtomicBool::new(false),
            }),
            rx,
        }
    }

    pub fn sink(&self) -> CompletionSink {
        CompletionSink {
            shared: self.shared.clone(),
        }
    }

    /// Blocks until an operation completes, the deadline passes, or the queue
    /// has been shut down and fully drained.
    pub fn next(&self, deadline: Instant) -> Event {
        loop {
            if self.is_drained() {
                return Event::Shutdown;
            }
            match self.rx.recv_deadline(deadline) {
                Ok(Signal::Complete(completion)) => {
                    self.shared.pending.fetch_sub(1, Ordering::AcqRel);
                    return Event::Complete(completion);
                }
                Ok(Signal::Wake) => continue,
                Err(RecvTimeoutError::Timeout) => return Event::Timeout,
                // The queue keeps its own sender alive, so this cannot happen.
                Err(RecvTimeoutError::Disconnected) => return Event::Shutdown,
            }
        }
    }

    /// Stops accepting new operations. Already registered ones still complete.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, Ordering::AcqRel) {
            let _ = self.shared.tx.send(Signal::Wake);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Registered operations not yet observed through `next`.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Shuts the queue down and consumes whatever is still pending. Returns
    /// false if operations were still outstanding when `timeout` ran out.
    pub fn shutdown_and_drain(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = Instant::now() + timeout;
        loop {
            match self.next(deadline) {
                Event::Shutdown => return true,
                Event::Timeout => {
                    warn!(pending = self.pending(), "completion queue did not drain in time");
                    return false;
                }
                Event::Complete(completion) => {
                    debug!(
                        tag = ?completion.tag,
                        success = completion.success,
                        "drained completion"
                    );
                }
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.is_shutdown() && self.pending() == 0
    }
}

impl Default for CompletionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue")
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

/// Handle transports use to register operations against a queue.
#[derive(Clone)]
pub struct CompletionSink {
    shared: Arc<Shared>,
}

impl CompletionSink {
    pub fn begin(&self, tag: Tag, data: CompletionData) -> Result<PendingOp, SubmitError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(SubmitError::QueueShutdown);
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        Ok(PendingOp {
            shared: Some(self.shared.clone()),
            tag,
            data,
        })
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionSink").finish_non_exhaustive()
    }
}

/// An operation registered with a queue and not yet completed.
pub struct PendingOp {
    shared: Option<Arc<Shared>>,
    tag: Tag,
    data: CompletionData,
}

impl PendingOp {
    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn batch(&self) -> Option<&OpBatch> {
        match &self.data {
            CompletionData::Batch(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn batch_mut(&mut self) -> Option<&mut OpBatch> {
        match &mut self.data {
            CompletionData::Batch(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn set_data(&mut self, data: CompletionData) {
        self.data = data;
    }

    pub fn complete(mut self, success: bool) {
        self.post(success);
    }

    fn post(&mut self, success: bool) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        let completion = Completion {
            tag: self.tag,
            success,
            data: std::mem::replace(&mut self.data, CompletionData::None),
        };
        if shared.tx.send(Signal::Complete(completion)).is_err() {
            shared.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for PendingOp {
    fn drop(&mut self) {
        self.post(false);
    }
}

impl fmt::Debug for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOp").field("tag", &self.tag).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{CompletionData, CompletionQueue, Event, Tag};
    use crate::errors::SubmitError;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    #[test]
    fn empty_queue_times_out() {
        let queue = CompletionQueue::new();
        assert!(matches!(queue.next(soon()), Event::Timeout));
    }

    #[test]
    fn completion_is_delivered_with_its_tag() {
        let queue = CompletionQueue::new();
        let op = queue
            .sink()
            .begin(Tag::ServerShutdown, CompletionData::None)
            .expect("queue open");
        assert_eq!(queue.pending(), 1);
        op.complete(true);

        match queue.next(soon()) {
            Event::Complete(completion) => {
                assert_eq!(completion.tag, Tag::ServerShutdown);
                assert!(completion.success);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn dropped_operation_reports_failure() {
        let queue = CompletionQueue::new();
        let op = queue
            .sink()
            .begin(Tag::Accept { request: 7 }, CompletionData::None)
            .expect("queue open");
        drop(op);

        match queue.next(soon()) {
            Event::Complete(completion) => {
                assert_eq!(completion.tag, Tag::Accept { request: 7 });
                assert!(!completion.success);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn shutdown_waits_for_pending_operations() {
        let queue = CompletionQueue::new();
        let op = queue
            .sink()
            .begin(Tag::ServerShutdown, CompletionData::None)
            .expect("queue open");
        queue.shutdown();

        let err = queue
            .sink()
            .begin(Tag::ServerShutdown, CompletionData::None)
            .expect_err("closed queue rejects new operations");
        assert_eq!(err, SubmitError::QueueShutdown);

        assert!(matches!(queue.next(soon()), Event::Timeout));
        op.complete(false);
        assert!(matches!(queue.next(soon()), Event::Complete(_)));
        assert!(matches!(queue.next(soon()), Event::Shutdown));
    }

    #[test]
    fn drain_consumes_completions_and_reports_stragglers() {
        let queue = CompletionQueue::new();
        let done = queue
            .sink()
            .begin(Tag::ServerShutdown, CompletionData::None)
            .expect("queue open");
        done.complete(true);
        assert!(queue.shutdown_and_drain(Duration::from_millis(50)));

        let queue = CompletionQueue::new();
        let _stuck = queue
            .sink()
            .begin(Tag::ServerShutdown, CompletionData::None)
            .expect("queue open");
        assert!(!queue.shutdown_and_drain(Duration::from_millis(20)));
    }
}
