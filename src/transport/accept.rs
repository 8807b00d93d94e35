//! Listener bookkeeping shared by the transports: pairing arriving calls with
//! posted accepts, and tracking accepted calls until they are released.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use super::{lock, AcceptedCall};
use crate::{
    completion::{CompletionData, CompletionSink, PendingOp, Tag},
    errors::SubmitError,
    status::Status,
};

/// A client call that reached a listener and is waiting for an accept.
pub(crate) trait Incoming: Send {
    fn method(&self) -> &str;

    /// Turns the arrival into a server call that completes on `cq`.
    fn accept(self: Box<Self>, cq: CompletionSink, live: &Arc<LiveCalls>) -> AcceptedCall;

    /// Fails the arrival back to its client.
    fn reject(self: Box<Self>, status: Status);
}

type Canceller = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct LiveState {
    next_id: u64,
    calls: HashMap<u64, Option<Canceller>>,
    idle_ack: Option<PendingOp>,
}

/// Accepted calls that have not been released yet.
#[derive(Default)]
pub(crate) struct LiveCalls {
    state: Mutex<LiveState>,
}

impl LiveCalls {
    pub(crate) fn register(self: &Arc<Self>, cancel: Canceller) -> LiveCall {
        let mut state = lock(&self.state);
        let id = state.next_id;
        state.next_id += 1;
        state.calls.insert(id, Some(cancel));
        LiveCall {
            id,
            registry: self.clone(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.state).calls.len()
    }

    /// Completes `op` as soon as no accepted call is left.
    fn notify_when_idle(&self, op: PendingOp) {
        let mut state = lock(&self.state);
        if state.calls.is_empty() {
            drop(state);
            op.complete(true);
        } else {
            state.idle_ack = Some(op);
        }
    }

    fn cancel_all(&self) {
        let cancels: Vec<Canceller> = {
            let mut state = lock(&self.state);
            state
                .calls
                .values_mut()
                .filter_map(Option::take)
                .collect()
        };
        debug!(calls = cancels.len(), "cancelling accepted calls");
        for cancel in cancels {
            cancel();
        }
    }

    fn release(&self, id: u64) {
        let ack = {
            let mut state = lock(&self.state);
            state.calls.remove(&id);
            if state.calls.is_empty() {
                state.idle_ack.take()
            } else {
                None
            }
        };
        if let Some(ack) = ack {
            ack.complete(true);
        }
    }
}

/// Held by an accepted call's transport handle; releases the slot on drop.
pub(crate) struct LiveCall {
    id: u64,
    registry: Arc<LiveCalls>,
}

impl Drop for LiveCall {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[derive(Default)]
struct AcceptState {
    started: bool,
    closed: bool,
    incoming: VecDeque<Box<dyn Incoming>>,
    waiting: VecDeque<(PendingOp, CompletionSink)>,
}

#[derive(Default)]
pub(crate) struct AcceptQueue {
    state: Mutex<AcceptState>,
    live: Arc<LiveCalls>,
}

impl AcceptQueue {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn start(&self) {
        lock(&self.state).started = true;
    }

    pub(crate) fn request_call(&self, cq: &CompletionSink, tag: Tag) -> Result<(), SubmitError> {
        let mut state = lock(&self.state);
        if state.closed {
            return Err(SubmitError::ListenerShutdown);
        }
        if !state.started {
            return Err(SubmitError::NotStarted);
        }

        let op = cq.begin(tag, CompletionData::None)?;
        match state.incoming.pop_front() {
            Some(incoming) => {
                drop(state);
                self.deliver(op, cq.clone(), incoming);
            }
            None => state.waiting.push_back((op, cq.clone())),
        }
        Ok(())
    }

    /// Hands an arriving call to a waiting accept, or parks it until one is posted.
    pub(crate) fn offer(&self, incoming: Box<dyn Incoming>) {
        let mut state = lock(&self.state);
        if state.closed || !state.started {
            drop(state);
            debug!(method = %incoming.method(), "rejecting call, listener is not accepting");
            incoming.reject(Status::unavailable("server is not accepting calls"));
            return;
        }

        match state.waiting.pop_front() {
            Some((op, cq)) => {
                drop(state);
                self.deliver(op, cq, incoming);
            }
            None => state.incoming.push_back(incoming),
        }
    }

    fn deliver(&self, mut op: PendingOp, cq: CompletionSink, incoming: Box<dyn Incoming>) {
        let call = incoming.accept(cq, &self.live);
        op.set_data(CompletionData::Accepted(Box::new(call)));
        op.complete(true);
    }

    /// Stops accepting. Posted accepts fail, parked arrivals are rejected.
    pub(crate) fn close(&self) {
        let (waiting, incoming) = {
            let mut state = lock(&self.state);
            state.closed = true;
            (
                std::mem::take(&mut state.waiting),
                std::mem::take(&mut state.incoming),
            )
        };
        drop(waiting);
        for arrival in incoming {
            arrival.reject(Status::unavailable("server is shutting down"));
        }
    }

    pub(crate) fn shutdown_and_notify(&self, cq: &CompletionSink, tag: Tag) {
        self.close();
        match cq.begin(tag, CompletionData::None) {
            Ok(op) => self.live.notify_when_idle(op),
            Err(err) => warn!(error = %err, "could not register shutdown notification"),
        }
    }

    pub(crate) fn cancel_all_calls(&self) {
        self.live.cancel_all();
    }

    pub(crate) fn live_calls(&self) -> usize {
        self.live.len()
    }
}
