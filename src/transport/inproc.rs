//! In-memory transport. Listeners register under an address on an
//! [`InprocNetwork`]; channels on the same network reach them directly.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU16, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use bytes::Bytes;
use dashmap::DashMap;
use tracing::debug;

use super::{
    accept::{AcceptQueue, Incoming, LiveCall, LiveCalls},
    lock, split_host_port, AcceptedCall, CallHandle, Channel, Connector, Listener,
    ServerTransport,
};
use crate::{
    batch::{OpBatch, OpKind, Side},
    completion::{CompletionData, CompletionSink, PendingOp, Tag},
    errors::{SubmitError, TransportError},
    metadata::Metadata,
    status::Status,
};

const FIRST_EPHEMERAL_PORT: u16 = 40000;

struct Hub {
    listeners: DashMap<String, Arc<AcceptQueue>>,
    next_port: AtomicU16,
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Clone)]
pub struct InprocNetwork {
    hub: Arc<Hub>,
}

impl InprocNetwork {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                listeners: DashMap::new(),
                next_port: AtomicU16::new(FIRST_EPHEMERAL_PORT),
            }),
        }
    }

    /// Number of listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.hub.listeners.len()
    }
}

impl Default for InprocNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    fn resolve(&self, target: &str) -> Option<Arc<AcceptQueue>> {
        let (host, port) = split_host_port(target).ok()?;
        let exact = address_key(&host, port);
        self.listeners
            .get(&exact)
            .or_else(|| self.listeners.get(&address_key("*", port)))
            .map(|entry| entry.value().clone())
    }

    fn allocate_port(&self) -> u16 {
        loop {
            let port = self.next_port.fetch_add(1, Ordering::Relaxed);
            if port == 0 {
                continue;
            }
            let suffix = format!(":{port}");
            let taken = self
                .listeners
                .iter()
                .any(|entry| entry.key().ends_with(&suffix));
            if !taken {
                return port;
            }
        }
    }
}

fn address_key(host: &str, port: u16) -> String {
    let host = match host {
        "localhost" | "127.0.0.1" | "::1" => "127.0.0.1",
        "0.0.0.0" | "::" | "*" => "*",
        other => other,
    };
    format!("{host}:{port}")
}

impl Connector for InprocNetwork {
    fn open_channel(&self, target: &str) -> Result<Box<dyn Channel>, TransportError> {
        split_host_port(target)?;
        Ok(Box::new(InprocChannel {
            hub: self.hub.clone(),
            target: target.to_string(),
        }))
    }
}

impl ServerTransport for InprocNetwork {
    fn create_listener(&self) -> Result<Box<dyn Listener>, TransportError> {
        Ok(Box::new(InprocListener {
            hub: self.hub.clone(),
            key: None,
            queue: AcceptQueue::new(),
        }))
    }
}

struct InprocChannel {
    hub: Arc<Hub>,
    target: String,
}

impl Channel for InprocChannel {
    fn target(&self) -> &str {
        &self.target
    }

    fn create_call(
        &self,
        method: &str,
        deadline: Instant,
        cq: &CompletionSink,
    ) -> Result<Box<dyn CallHandle>, TransportError> {
        Ok(Box::new(ClientCall {
            hub: self.hub.clone(),
            target: self.target.clone(),
            method: method.to_string(),
            deadline,
            cq: cq.clone(),
            exchange: None,
        }))
    }
}

/// State shared by the two halves of one in-memory call.
struct Exchange {
    client_op: Mutex<Option<PendingOp>>,
    cancelled: AtomicBool,
}

impl Exchange {
    /// Completes the client batch with the server's reply. False if the client already gave up.
    fn reply(
        &self,
        initial_metadata: Metadata,
        message: Option<Bytes>,
        status: Status,
        trailers: Metadata,
    ) -> bool {
        let Some(mut op) = lock(&self.client_op).take() else {
            return false;
        };
        if let Some(batch) = op.batch_mut() {
            batch.fill_client_reply(initial_metadata, message, status, trailers);
        }
        op.complete(true);
        true
    }

    fn fail(&self, status: Status) {
        self.cancelled.store(true, Ordering::Release);
        let Some(mut op) = lock(&self.client_op).take() else {
            return;
        };
        if let Some(batch) = op.batch_mut() {
            batch.fill_status(status);
        }
        op.complete(false);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

struct ClientCall {
    hub: Arc<Hub>,
    target: String,
    method: String,
    deadline: Instant,
    cq: CompletionSink,
    exchange: Option<Arc<Exchange>>,
}

impl CallHandle for ClientCall {
    fn start_batch(&mut self, batch: OpBatch, tag: Tag) -> Result<(), SubmitError> {
        batch.check_side(Side::Client)?;
        if self.exchange.is_some() {
            return Err(SubmitError::InvalidBatch(
                "unary call already has its batch".to_string(),
            ));
        }
        if !batch.contains(OpKind::RecvStatusOnClient) {
            return Err(SubmitError::InvalidBatch(
                "unary batch must receive the call status".to_string(),
            ));
        }

        let metadata = batch.outgoing_metadata().cloned().unwrap_or_default();
        let message = batch.outgoing_message().cloned();
        let op = self.cq.begin(tag, CompletionData::Batch(batch))?;
        let exchange = Arc::new(Exchange {
            client_op: Mutex::new(Some(op)),
            cancelled: AtomicBool::new(false),
        });
        self.exchange = Some(exchange.clone());

        match self.hub.resolve(&self.target) {
            Some(queue) => queue.offer(Box::new(Arrival {
                method: self.method.clone(),
                deadline: self.deadline,
                metadata,
                message,
                exchange,
            })),
            None => {
                debug!(address = %self.target, "no in-process listener");
                exchange.fail(Status::unavailable(format!(
                    "no listener at {}",
                    self.target
                )));
            }
        }
        Ok(())
    }

    fn cancel(&mut self, status: Status) {
        if let Some(exchange) = &self.exchange {
            exchange.fail(status);
        }
    }
}

impl Drop for ClientCall {
    fn drop(&mut self) {
        self.cancel(Status::cancelled("call released by client"));
    }
}

struct Arrival {
    method: String,
    deadline: Instant,
    metadata: Metadata,
    message: Option<Bytes>,
    exchange: Arc<Exchange>,
}

impl Incoming for Arrival {
    fn method(&self) -> &str {
        &self.method
    }

    fn accept(self: Box<Self>, cq: CompletionSink, live: &Arc<LiveCalls>) -> AcceptedCall {
        let Arrival {
            method,
            deadline,
            metadata,
            message,
            exchange,
        } = *self;
        let cancel = exchange.clone();
        let live = live.register(Box::new(move || {
            cancel.fail(Status::cancelled("call cancelled by server"));
        }));
        AcceptedCall {
            method,
            deadline: Some(deadline),
            metadata,
            handle: Box::new(ServerCall {
                exchange,
                request: message,
                initial_metadata: Metadata::new(),
                cq,
                responded: false,
                _live: live,
            }),
        }
    }

    fn reject(self: Box<Self>, status: Status) {
        self.exchange.fail(status);
    }
}

struct ServerCall {
    exchange: Arc<Exchange>,
    request: Option<Bytes>,
    initial_metadata: Metadata,
    cq: CompletionSink,
    responded: bool,
    _live: LiveCall,
}

impl CallHandle for ServerCall {
    fn start_batch(&mut self, batch: OpBatch, tag: Tag) -> Result<(), SubmitError> {
        batch.check_side(Side::Server)?;
        if self.responded {
            return Err(SubmitError::CallClosed);
        }

        if let Some(metadata) = batch.outgoing_metadata() {
            self.initial_metadata = metadata.clone();
        }
        let reply = batch
            .outgoing_status()
            .map(|(status, trailers)| (status.clone(), trailers.clone(), batch.outgoing_message().cloned()));

        let mut op = self.cq.begin(tag, CompletionData::Batch(batch))?;
        let cancelled = self.exchange.is_cancelled();
        let mut success = !cancelled;
        if let Some(batch) = op.batch_mut() {
            if batch.contains(OpKind::RecvMessage) {
                batch.fill_request_message(self.request.take());
            }
            batch.fill_close(cancelled);
        }

        if let Some((status, trailers, message)) = reply {
            self.responded = true;
            let initial_metadata = std::mem::take(&mut self.initial_metadata);
            success = self.exchange.reply(initial_metadata, message, status, trailers);
        }
        op.complete(success);
        Ok(())
    }

    fn cancel(&mut self, status: Status) {
        self.exchange.fail(status);
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        if !self.responded {
            self.exchange
                .fail(Status::cancelled("server released call without responding"));
        }
    }
}

struct InprocListener {
    hub: Arc<Hub>,
    key: Option<String>,
    queue: Arc<AcceptQueue>,
}

impl InprocListener {
    fn unregister(&mut self) {
        if let Some(key) = self.key.take() {
            let queue = self.queue.clone();
            self.hub
                .listeners
                .remove_if(&key, |_, registered| Arc::ptr_eq(registered, &queue));
        }
    }
}

impl Listener for InprocListener {
    fn bind(&mut self, address: &str) -> Result<u16, TransportError> {
        if self.key.is_some() {
            return Err(TransportError::InvalidAddress(format!(
                "{address}: listener is already bound"
            )));
        }
        let (host, port) = split_host_port(address)?;
        let port = if port == 0 {
            self.hub.allocate_port()
        } else {
            port
        };
        let key = address_key(&host, port);

        match self.hub.listeners.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse(key));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(self.queue.clone());
            }
        }
        debug!(address = %key, "in-process listener bound");
        self.key = Some(key);
        Ok(port)
    }

    fn start(&mut self) -> Result<(), TransportError> {
        if self.key.is_none() {
            return Err(TransportError::NotBound);
        }
        self.queue.start();
        Ok(())
    }

    fn request_call(&mut self, cq: &CompletionSink, tag: Tag) -> Result<(), SubmitError> {
        self.queue.request_call(cq, tag)
    }

    fn shutdown_and_notify(&mut self, cq: &CompletionSink, tag: Tag) {
        self.unregister();
        self.queue.shutdown_and_notify(cq, tag);
    }

    fn cancel_all_calls(&mut self) {
        debug!(live = self.queue.live_calls(), "cancel all in-process calls");
        self.queue.cancel_all_calls();
    }
}

impl Drop for InprocListener {
    fn drop(&mut self) {
        self.unregister();
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use bytes::Bytes;

    use super::InprocNetwork;
    use crate::{
        batch::OpBatch,
        completion::{CompletionData, CompletionQueue, Event, Tag},
        errors::TransportError,
        metadata::Metadata,
        status::{Code, Status},
        transport::{Connector, ServerTransport},
    };

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(200)
    }

    fn unary_batch(payload: &'static [u8]) -> OpBatch {
        OpBatch::builder()
            .send_initial_metadata(Metadata::new())
            .send_message(Bytes::from_static(payload))
            .send_close_from_client()
            .recv_initial_metadata()
            .recv_message()
            .recv_status_on_client()
            .build()
            .expect("client batch")
    }

    #[test]
    fn duplicate_bind_is_rejected_and_port_zero_allocates() {
        let network = InprocNetwork::new();
        let mut first = network.create_listener().expect("listener");
        let port = first.bind("127.0.0.1:0").expect("ephemeral bind");
        assert_ne!(port, 0);

        let mut second = network.create_listener().expect("listener");
        let err = second
            .bind(&format!("localhost:{port}"))
            .expect_err("address in use");
        assert!(matches!(err, TransportError::AddressInUse(_)));

        drop(first);
        assert_eq!(network.listener_count(), 0);
    }

    #[test]
    fn missing_listener_fails_call_as_unavailable() {
        let network = InprocNetwork::new();
        let cq = CompletionQueue::new();
        let channel = network.open_channel("127.0.0.1:1").expect("channel");
        let mut call = channel
            .create_call("/echo", soon(), &cq.sink())
            .expect("call");
        call.start_batch(unary_batch(b"x"), Tag::ServerShutdown)
            .expect("submitted");

        match cq.next(soon()) {
            Event::Complete(completion) => {
                assert!(!completion.success);
                let batch = completion.into_batch().expect("batch returned");
                assert_eq!(
                    batch.received_status().map(Status::code),
                    Some(Code::Unavailable)
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn server_reply_reaches_client_batch() {
        let network = InprocNetwork::new();
        let server_cq = CompletionQueue::new();
        let client_cq = CompletionQueue::new();

        let mut listener = network.create_listener().expect("listener");
        let port = listener.bind("127.0.0.1:0").expect("bind");
        listener.start().expect("start");
        listener
            .request_call(&server_cq.sink(), Tag::Accept { request: 0 })
            .expect("accept posted");

        let channel = network
            .open_channel(&format!("127.0.0.1:{port}"))
            .expect("channel");
        let mut client = channel
            .create_call("/echo", soon(), &client_cq.sink())
            .expect("call");
        client
            .start_batch(unary_batch(b"\x01\x02"), Tag::ServerShutdown)
            .expect("submitted");

        let mut accepted = match server_cq.next(soon()) {
            Event::Complete(completion) => match completion.data {
                CompletionData::Accepted(call) => call,
                other => panic!("unexpected data {other:?}"),
            },
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(accepted.method, "/echo");

        let read = OpBatch::builder()
            .send_initial_metadata(Metadata::new())
            .recv_message()
            .build()
            .expect("read batch");
        accepted
            .handle
            .start_batch(read, Tag::ServerShutdown)
            .expect("read submitted");
        let request = match server_cq.next(soon()) {
            Event::Complete(completion) => {
                assert!(completion.success);
                completion
                    .into_batch()
                    .and_then(|mut batch| batch.take_message())
            }
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(request, Some(Bytes::from_static(b"\x01\x02")));

        let send = OpBatch::builder()
            .recv_close_on_server()
            .send_message(Bytes::from_static(b"\x02\x01"))
            .send_status_from_server(Status::ok(), Metadata::new())
            .build()
            .expect("send batch");
        accepted
            .handle
            .start_batch(send, Tag::ServerShutdown)
            .expect("send submitted");

        match client_cq.next(soon()) {
            Event::Complete(completion) => {
                assert!(completion.success);
                let mut batch = completion.into_batch().expect("batch returned");
                assert!(batch.received_status().expect("status").is_ok());
                assert_eq!(batch.take_message(), Some(Bytes::from_static(b"\x02\x01")));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
