//! Per-call context and the ownership table tags resolve through.

use std::{cell::OnceCell, fmt, time::Instant};

use bytes::Bytes;

use crate::{
    batch::OpBatch,
    completion::Tag,
    errors::SubmitError,
    metadata::Metadata,
    status::Status,
    transport::CallHandle,
};

/// Generational index into a [`CallTable`]. A stale id never resolves to a newer call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId {
    index: u32,
    generation: u32,
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    InFlight(Tag),
    Finished,
}

pub struct Call {
    method: String,
    deadline: Option<Instant>,
    state: CallState,
    inbound_metadata: Metadata,
    outbound_metadata: Metadata,
    request: Option<Bytes>,
    response: Option<Bytes>,
    status: OnceCell<Status>,
    handle: Option<Box<dyn CallHandle>>,
}

impl Call {
    pub fn new(
        method: impl Into<String>,
        deadline: Option<Instant>,
        handle: Box<dyn CallHandle>,
    ) -> Self {
        Self {
            method: method.into(),
            deadline,
            state: CallState::Idle,
            inbound_metadata: Metadata::new(),
            outbound_metadata: Metadata::new(),
            request: None,
            response: None,
            status: OnceCell::new(),
            handle: Some(handle),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn deadline_elapsed(&self) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Hands `batch` to the transport. Only one batch may be outstanding per call.
    pub fn start_batch(&mut self, batch: OpBatch, tag: Tag) -> Result<(), SubmitError> {
        match self.state {
            CallState::InFlight(_) => return Err(SubmitError::BatchInProgress),
            CallState::Finished => return Err(SubmitError::CallClosed),
            CallState::Idle => {}
        }
        let handle = self.handle.as_mut().ok_or(SubmitError::CallClosed)?;
        handle.start_batch(batch, tag)?;
        self.state = CallState::InFlight(tag);
        Ok(())
    }

    /// Marks the outstanding batch for `tag` as observed. Returns false for a
    /// tag that is not the one in flight.
    pub fn batch_completed(&mut self, tag: Tag) -> bool {
        if self.state == CallState::InFlight(tag) {
            self.state = CallState::Idle;
            true
        } else {
            false
        }
    }

    pub fn has_outstanding_batch(&self) -> bool {
        matches!(self.state, CallState::InFlight(_))
    }

    pub fn cancel(&mut self, status: Status) {
        if let Some(handle) = self.handle.as_mut() {
            handle.cancel(status);
        }
    }

    /// Records the terminal status. Only the first status sticks.
    pub fn finish(&mut self, status: Status) -> bool {
        let first = self.status.set(status).is_ok();
        if first && !self.has_outstanding_batch() {
            self.state = CallState::Finished;
        }
        first
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.get()
    }

    pub fn set_inbound_metadata(&mut self, metadata: Metadata) {
        self.inbound_metadata = metadata;
    }

    pub fn inbound_metadata(&self) -> &Metadata {
        &self.inbound_metadata
    }

    pub fn set_outbound_metadata(&mut self, metadata: Metadata) {
        self.outbound_metadata = metadata;
    }

    pub fn outbound_metadata(&self) -> &Metadata {
        &self.outbound_metadata
    }

    pub fn set_request(&mut self, request: Option<Bytes>) {
        self.request = request;
    }

    pub fn request(&self) -> Option<&Bytes> {
        self.request.as_ref()
    }

    pub fn set_response(&mut self, response: Option<Bytes>) {
        self.response = response;
    }

    pub fn response(&self) -> Option<&Bytes> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<Bytes> {
        self.response.take()
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", &self.method)
            .field("deadline", &self.deadline)
            .field("state", &self.state)
            .field("status", &self.status.get())
            .finish_non_exhaustive()
    }
}

struct Slot {
    generation: u32,
    call: Option<Call>,
}

/// Owns every live call of an engine. Removing a call drops its transport handle.
#[derive(Default)]
pub struct CallTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl CallTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, call: Call) -> CallId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.call = Some(call);
            return CallId {
                index,
                generation: slot.generation,
            };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            call: Some(call),
        });
        CallId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: CallId) -> Option<&Call> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.call.as_ref())
    }

    pub fn get_mut(&mut self, id: CallId) -> Option<&mut Call> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.call.as_mut())
    }

    pub fn remove(&mut self, id: CallId) -> Option<Call> {
        let slot = self
            .slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)?;
        let call = slot.call.take()?;
        self.free.push(id.index);
        self.len -= 1;
        Some(call)
    }

    pub fn ids(&self) -> Vec<CallId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.call.is_some())
            .map(|(index, slot)| CallId {
                index: index as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Releases every call still in the table.
    pub fn clear(&mut self) -> usize {
        let released = self.len;
        for slot in &mut self.slots {
            slot.call = None;
        }
        self.free = (0..self.slots.len() as u32).rev().collect();
        for slot in &mut self.slots {
            slot.generation = slot.generation.wrapping_add(1);
        }
        self.len = 0;
        released
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::{Call, CallState, CallTable};
    use crate::{
        batch::OpBatch,
        completion::Tag,
        errors::SubmitError,
        status::Status,
        transport::CallHandle,
    };

    #[derive(Default)]
    struct CountingHandle {
        batches: Arc<AtomicUsize>,
        cancels: Arc<AtomicUsize>,
    }

    impl CallHandle for CountingHandle {
        fn start_batch(&mut self, _batch: OpBatch, _tag: Tag) -> Result<(), SubmitError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn cancel(&mut self, _status: Status) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn read_batch() -> OpBatch {
        OpBatch::builder().recv_message().build().expect("batch")
    }

    #[test]
    fn stale_ids_do_not_resolve_after_reuse() {
        let mut table = CallTable::new();
        let first = table.insert(Call::new("/a", None, Box::<CountingHandle>::default()));
        assert!(table.remove(first).is_some());

        let second = table.insert(Call::new("/b", None, Box::<CountingHandle>::default()));
        assert_ne!(first, second);
        assert!(table.get(first).is_none());
        assert_eq!(table.get(second).map(Call::method), Some("/b"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn only_one_batch_may_be_outstanding() {
        let handle = CountingHandle::default();
        let batches = handle.batches.clone();
        let mut table = CallTable::new();
        let id = table.insert(Call::new("/echo", None, Box::new(handle)));
        let call = table.get_mut(id).expect("call present");

        call.start_batch(read_batch(), Tag::ReadRequest(id))
            .expect("first batch accepted");
        let err = call
            .start_batch(read_batch(), Tag::ReadRequest(id))
            .expect_err("second batch rejected");
        assert_eq!(err, SubmitError::BatchInProgress);
        assert_eq!(batches.load(Ordering::SeqCst), 1);

        assert!(!call.batch_completed(Tag::SendResponse(id)));
        assert!(call.batch_completed(Tag::ReadRequest(id)));
        assert_eq!(call.state(), CallState::Idle);
    }

    #[test]
    fn terminal_status_is_set_once() {
        let mut call = Call::new("/echo", None, Box::<CountingHandle>::default());
        assert!(call.finish(Status::ok()));
        assert!(!call.finish(Status::internal("late")));
        assert!(call.status().expect("status set").is_ok());
        assert_eq!(call.state(), CallState::Finished);
    }

    #[test]
    fn clear_releases_everything() {
        let mut table = CallTable::new();
        let a = table.insert(Call::new("/a", None, Box::<CountingHandle>::default()));
        table.insert(Call::new("/b", None, Box::<CountingHandle>::default()));

        assert_eq!(table.clear(), 2);
        assert!(table.is_empty());
        assert!(table.get(a).is_none());
        assert!(table.ids().is_empty());
    }
}
