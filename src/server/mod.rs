//! Server accept loop. One thread owns the completion queue and serves one call
//! at a time: accept, read the request, dispatch, send the response, re-arm.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, level_filters::LevelFilter, warn, Level};

use crate::{
    batch::OpBatch,
    call::{Call, CallId, CallTable},
    completion::{Completion, CompletionData, CompletionQueue, Event, Tag, DEFAULT_DRAIN_TIMEOUT},
    errors::{ServeError, SubmitError},
    logging::LogContext,
    metadata::Metadata,
    status::Status,
    transport::{AcceptedCall, Listener, ServerTransport},
};

pub mod hooks;
pub mod registry;
pub mod shutdown;

pub use hooks::{HookPoint, HookResult, Hooks};
pub use registry::{CommandHandler, DispatchError, Handler, HandlerRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:50051";
pub const DEFAULT_POLL_SLICE: Duration = Duration::from_secs(1);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    /// `None` serves until interrupted.
    pub duration: Option<Duration>,
    /// Longest single wait on the queue; interrupt and duration are checked between waits.
    pub poll_slice: Duration,
    pub shutdown_grace: Duration,
    pub drain_timeout: Duration,
    pub log_level: LevelFilter,
}

impl ServerConfig {
    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            ..Self::default()
        }
    }

    /// `0` means serve indefinitely.
    pub fn with_duration_secs(mut self, seconds: u64) -> Self {
        self.duration = (seconds > 0).then(|| Duration::from_secs(seconds));
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDR.to_string(),
            duration: None,
            poll_slice: DEFAULT_POLL_SLICE,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            log_level: LevelFilter::INFO,
        }
    }
}

/// Interrupt flag observed by the serving loop between polls.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    DurationElapsed,
    Interrupted,
    QueueShutdown,
    AcceptFailed,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::DurationElapsed => "duration_elapsed",
            StopReason::Interrupted => "interrupted",
            StopReason::QueueShutdown => "queue_shutdown",
            StopReason::AcceptFailed => "accept_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServeSummary {
    pub port: u16,
    pub stop_reason: StopReason,
    /// Calls whose response batch completed.
    pub calls_completed: u64,
    /// Calls released without a delivered response.
    pub calls_failed: u64,
    pub handler_faults: u64,
    pub shutdown_acknowledged: bool,
    pub forced_cancel: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    AwaitingCall,
    ReadingRequest(CallId),
    Dispatching(CallId),
    SendingResponse(CallId),
}

impl LoopState {
    fn call(self) -> Option<CallId> {
        match self {
            LoopState::AwaitingCall => None,
            LoopState::ReadingRequest(id)
            | LoopState::Dispatching(id)
            | LoopState::SendingResponse(id) => Some(id),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    handler_faults: u64,
}

pub struct Server {
    transport: Arc<dyn ServerTransport>,
    handlers: Arc<HandlerRegistry>,
    hooks: Hooks,
    config: ServerConfig,
    signal: ShutdownSignal,
    log: LogContext,
}

impl Server {
    pub fn new(transport: Arc<dyn ServerTransport>, handlers: HandlerRegistry) -> Self {
        let config = ServerConfig::default();
        Self {
            transport,
            handlers: Arc::new(handlers),
            hooks: Hooks::new(),
            log: LogContext::new("server", config.log_level),
            config,
            signal: ShutdownSignal::new(),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.log.set_level(config.log_level);
        self.config = config;
        self
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_shutdown_signal(mut self, signal: ShutdownSignal) -> Self {
        self.signal = signal;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Runs until the configured duration elapses or the shutdown signal fires.
    pub fn serve(self) -> Result<ServeSummary, ServeError> {
        let _entered = self.log.span().enter();
        let address = self.config.bind_address.clone();

        let mut listener = self
            .transport
            .create_listener()
            .map_err(ServeError::CreateListener)?;
        self.hooks.fire(HookPoint::ServerCreate, &json!({}));

        let queue = CompletionQueue::new();
        self.hooks.fire(HookPoint::QueueCreate, &json!({}));

        let port = match listener.bind(&address) {
            Ok(port) => port,
            Err(source) => {
                self.hooks.fire(HookPoint::Bind, &json!({ "port": 0 }));
                drop(listener);
                queue.shutdown_and_drain(self.config.drain_timeout);
                return Err(ServeError::Bind { address, source });
            }
        };
        self.hooks.fire(HookPoint::Bind, &json!({ "port": port }));

        if let Err(err) = listener.start() {
            drop(listener);
            queue.shutdown_and_drain(self.config.drain_timeout);
            return Err(ServeError::Start(err));
        }
        self.hooks.fire(HookPoint::ServerStart, &json!({ "port": port }));
        info!(
            address = %address,
            port,
            methods = self.handlers.len(),
            duration_secs = self.config.duration.map_or(0, |d| d.as_secs()),
            "server started"
        );

        let mut run = RunLoop {
            server: &self,
            listener: listener.as_mut(),
            queue: &queue,
            calls: CallTable::new(),
            state: LoopState::AwaitingCall,
            accept_seq: 0,
            counters: Counters::default(),
        };
        self.hooks.fire(HookPoint::Run, &json!({}));
        let outcome = run.run();
        let mut calls = std::mem::take(&mut run.calls);
        let counters = std::mem::take(&mut run.counters);

        let (stop_reason, failure) = match outcome {
            Ok(reason) => (reason, None),
            Err(err) => {
                warn!(error = %err, "serving loop failed");
                (StopReason::AcceptFailed, Some(err))
            }
        };
        info!(reason = stop_reason.as_str(), "server shutting down");
        self.hooks.fire(
            HookPoint::Shutdown,
            &json!({ "reason": stop_reason.as_str() }),
        );

        let in_flight = calls.len() as u64;
        let report = ShutdownCoordinator::new(self.config.shutdown_grace, self.config.drain_timeout)
            .run(listener, &queue, &mut calls);

        let summary = ServeSummary {
            port,
            stop_reason,
            calls_completed: counters.completed,
            calls_failed: counters.failed + in_flight,
            handler_faults: counters.handler_faults,
            shutdown_acknowledged: report.acknowledged,
            forced_cancel: report.forced_cancel,
        };
        let payload = serde_json::to_value(&summary).unwrap_or_else(|_| json!({}));
        self.hooks.fire(HookPoint::Stopped, &payload);

        match failure {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}

/// Serves `handlers` on `bind_address` for `duration_seconds` (`0` = until
/// the process is interrupted some other way).
pub fn serve(
    transport: Arc<dyn ServerTransport>,
    handlers: HandlerRegistry,
    bind_address: &str,
    duration_seconds: u64,
    hooks: Hooks,
) -> Result<ServeSummary, ServeError> {
    Server::new(transport, handlers)
        .with_config(ServerConfig::new(bind_address).with_duration_secs(duration_seconds))
        .with_hooks(hooks)
        .serve()
}

struct RunLoop<'a> {
    server: &'a Server,
    listener: &'a mut dyn Listener,
    queue: &'a CompletionQueue,
    calls: CallTable,
    state: LoopState,
    accept_seq: u64,
    counters: Counters,
}

impl RunLoop<'_> {
    fn run(&mut self) -> Result<StopReason, ServeError> {
        let end = self.server.config.duration.map(|d| Instant::now() + d);
        self.post_accept()?;

        loop {
            if self.server.signal.is_triggered() {
                return Ok(StopReason::Interrupted);
            }
            let now = Instant::now();
            if end.is_some_and(|end| now >= end) {
                return Ok(StopReason::DurationElapsed);
            }

            let mut poll_deadline = now + self.server.config.poll_slice;
            if let Some(end) = end {
                poll_deadline = poll_deadline.min(end);
            }
            match self.queue.next(poll_deadline) {
                Event::Timeout => {}
                Event::Shutdown => return Ok(StopReason::QueueShutdown),
                Event::Complete(completion) => self.handle(completion)?,
            }
        }
    }

    fn trace_enabled(&self) -> bool {
        self.server.log.enabled(Level::DEBUG)
    }

    fn handle(&mut self, completion: Completion) -> Result<(), ServeError> {
        if let Some(id) = completion.tag.call() {
            if self.state.call() != Some(id) {
                debug!(call = %id, state = ?self.state, "completion for a call outside the slot");
            }
        }
        match completion.tag {
            Tag::Accept { request } => self.on_accept(request, completion),
            Tag::ReadRequest(id) => self.on_read(id, completion),
            Tag::SendResponse(id) => self.on_sent(id, completion),
            Tag::Unary(_) | Tag::ServerShutdown => {
                debug!(tag = ?completion.tag, "unexpected completion on server queue");
                Ok(())
            }
        }
    }

    fn post_accept(&mut self) -> Result<(), ServeError> {
        self.accept_seq += 1;
        self.state = LoopState::AwaitingCall;
        self.listener
            .request_call(&self.queue.sink(), Tag::Accept { request: self.accept_seq })
            .map_err(|err| ServeError::AcceptFailed(err.to_string()))
    }

    fn on_accept(&mut self, request: u64, completion: Completion) -> Result<(), ServeError> {
        if request != self.accept_seq || self.state != LoopState::AwaitingCall {
            debug!(request, "ignoring stale accept completion");
            return Ok(());
        }

        match completion.data {
            CompletionData::Accepted(accepted) if completion.success => self.begin_call(*accepted),
            _ => {
                if self.server.signal.is_triggered() {
                    return Err(ServeError::AcceptFailed(
                        "accept failed after shutdown was requested".to_string(),
                    ));
                }
                debug!(request, "accept failed, re-posting");
                self.post_accept()
            }
        }
    }

    fn begin_call(&mut self, accepted: AcceptedCall) -> Result<(), ServeError> {
        let AcceptedCall {
            method,
            deadline,
            metadata,
            handle,
        } = accepted;
        let mut call = Call::new(method, deadline, handle);
        call.set_inbound_metadata(metadata);
        let id = self.calls.insert(call);

        let submitted = OpBatch::builder()
            .send_initial_metadata(Metadata::new())
            .recv_message()
            .build()
            .and_then(|batch| self.start_batch(id, batch, Tag::ReadRequest(id)));
        match submitted {
            Ok(()) => {
                self.state = LoopState::ReadingRequest(id);
                if self.trace_enabled() {
                    if let Some(call) = self.calls.get(id) {
                        debug!(call = %id, method = %call.method(), "call accepted");
                    }
                }
                Ok(())
            }
            Err(err) => {
                warn!(call = %id, error = %err, "failed to start reading request");
                self.release(id, false);
                self.post_accept()
            }
        }
    }

    fn on_read(&mut self, id: CallId, completion: Completion) -> Result<(), ServeError> {
        let Some(call) = self.calls.get_mut(id) else {
            debug!(call = %id, "read completion for released call");
            return Ok(());
        };
        call.batch_completed(completion.tag);
        self.state = LoopState::Dispatching(id);

        let success = completion.success;
        let request = completion
            .into_batch()
            .and_then(|mut batch| batch.take_message());
        call.set_request(request.clone());

        let (status, response) = if !success {
            (
                Status::cancelled("Failed to receive client message or client cancelled."),
                None,
            )
        } else if let Some(request) = request {
            if call.deadline_elapsed() {
                (
                    Status::deadline_exceeded("Deadline exceeded before the handler was invoked"),
                    None,
                )
            } else {
                let method = call.method().to_string();
                match self.server.handlers.dispatch(&method, request) {
                    Ok(response) => (Status::ok(), Some(response)),
                    Err(err) => {
                        if let DispatchError::Fault(fault) = &err {
                            self.counters.handler_faults += 1;
                            warn!(method = %method, error = %fault, "handler fault");
                        }
                        (err.into_status(), None)
                    }
                }
            }
        } else {
            (
                Status::invalid_argument(
                    "Client did not send a message payload as expected for unary call.",
                ),
                None,
            )
        };

        self.send_response(id, status, response)
    }

    fn send_response(
        &mut self,
        id: CallId,
        status: Status,
        response: Option<Bytes>,
    ) -> Result<(), ServeError> {
        if self.trace_enabled() {
            debug!(call = %id, code = %status.code(), "sending response");
        }

        let mut builder = OpBatch::builder().recv_close_on_server();
        if status.is_ok() {
            if let Some(response) = response.clone() {
                builder = builder.send_message(response);
            }
        }
        let submitted = builder
            .send_status_from_server(status.clone(), Metadata::new())
            .build()
            .and_then(|batch| self.start_batch(id, batch, Tag::SendResponse(id)));

        match submitted {
            Ok(()) => {
                if let Some(call) = self.calls.get_mut(id) {
                    call.set_response(response);
                    call.finish(status);
                }
                self.state = LoopState::SendingResponse(id);
                Ok(())
            }
            Err(err) => {
                warn!(call = %id, error = %err, "failed to send response");
                self.release(id, false);
                self.post_accept()
            }
        }
    }

    fn on_sent(&mut self, id: CallId, completion: Completion) -> Result<(), ServeError> {
        let Some(call) = self.calls.get_mut(id) else {
            debug!(call = %id, "send completion for released call");
            return Ok(());
        };
        call.batch_completed(completion.tag);
        let success = completion.success;
        let cancelled = completion
            .into_batch()
            .is_some_and(|batch| batch.was_cancelled());
        if self.trace_enabled() {
            debug!(call = %id, success, cancelled, "response batch completed");
        }
        self.release(id, success && !cancelled);
        self.post_accept()
    }

    fn start_batch(&mut self, id: CallId, batch: OpBatch, tag: Tag) -> Result<(), SubmitError> {
        self.calls
            .get_mut(id)
            .ok_or(SubmitError::CallClosed)?
            .start_batch(batch, tag)
    }

    fn release(&mut self, id: CallId, delivered: bool) {
        if delivered {
            self.counters.completed += 1;
        } else {
            self.counters.failed += 1;
        }
        self.calls.remove(id);
        self.state = LoopState::AwaitingCall;
    }
}
