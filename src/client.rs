//! Client call engine. Each call runs on its own completion queue and is
//! driven to exactly one outcome on the calling thread.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tracing::{debug, info, level_filters::LevelFilter, warn, Level};

use crate::{
    batch::OpBatch,
    call::{Call, CallId, CallTable},
    completion::{Completion, CompletionQueue, Event, Tag, DEFAULT_DRAIN_TIMEOUT},
    errors::CallError,
    logging::LogContext,
    metadata::Metadata,
    status::Status,
    transport::Connector,
};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Used when a call does not name its own timeout.
    pub default_timeout: Duration,
    /// Upper bound on waiting for stray completions while tearing a call down.
    pub drain_timeout: Duration,
    pub log_level: LevelFilter,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_CALL_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            log_level: LevelFilter::INFO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnaryResponse {
    /// `None` when the server completed with OK but sent no payload.
    pub message: Option<Bytes>,
    pub initial_metadata: Metadata,
    pub trailing_metadata: Metadata,
}

pub struct Client {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    log: LogContext,
}

impl Client {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self::with_config(connector, ClientConfig::default())
    }

    pub fn with_config(connector: Arc<dyn Connector>, config: ClientConfig) -> Self {
        let log = LogContext::new("client", config.log_level);
        Self {
            connector,
            config,
            log,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Issues one unary call. `metadata` is a flat `[key, value, key, value, ...]`
    /// sequence; `timeout` falls back to the configured default.
    pub fn execute(
        &self,
        target: &str,
        method: &str,
        payload: Bytes,
        metadata: &[Bytes],
        timeout: Option<Duration>,
    ) -> Result<UnaryResponse, CallError> {
        let _entered = self.log.span().enter();
        let started_at = Instant::now();

        if target.trim().is_empty() {
            return Err(CallError::CallerInput("target must not be empty".to_string()));
        }
        if method.trim().is_empty() {
            return Err(CallError::CallerInput("method must not be empty".to_string()));
        }
        let metadata = Metadata::from_flat(metadata.iter().cloned())?;
        let timeout = timeout.unwrap_or(self.config.default_timeout);

        let queue = CompletionQueue::new();
        let result = self.run_call(&queue, target, method, payload, metadata, timeout);
        if !queue.shutdown_and_drain(self.config.drain_timeout) {
            warn!(method = %method, "call torn down with operations still pending");
        }

        if self.log.enabled(Level::INFO) {
            let code = match &result {
                Ok(_) => "OK",
                Err(err) => err.code().map_or("NONE", |code| code.as_str()),
            };
            info!(
                target_addr = %target,
                method = %method,
                code,
                duration_ms = started_at.elapsed().as_millis(),
                "call summary"
            );
        }
        result
    }

    fn run_call(
        &self,
        queue: &CompletionQueue,
        target: &str,
        method: &str,
        payload: Bytes,
        metadata: Metadata,
        timeout: Duration,
    ) -> Result<UnaryResponse, CallError> {
        let connect_error = |source| CallError::Connect {
            target: target.to_string(),
            source,
        };
        let channel = self.connector.open_channel(target).map_err(connect_error)?;
        let deadline = Instant::now() + timeout;
        let handle = channel
            .create_call(method, deadline, &queue.sink())
            .map_err(connect_error)?;

        let mut calls = CallTable::new();
        let id = calls.insert(Call::new(method, Some(deadline), handle));
        let result = self.drive(queue, &mut calls, id, payload, metadata, timeout);

        // The call handle goes before the channel that created it.
        drop(calls);
        drop(channel);
        result
    }

    fn drive(
        &self,
        queue: &CompletionQueue,
        calls: &mut CallTable,
        id: CallId,
        payload: Bytes,
        metadata: Metadata,
        timeout: Duration,
    ) -> Result<UnaryResponse, CallError> {
        let call = calls
            .get_mut(id)
            .ok_or_else(|| CallError::TransportFailure(Status::internal("call vanished")))?;
        let deadline = call.deadline().unwrap_or_else(|| Instant::now() + timeout);

        let batch = OpBatch::builder()
            .send_initial_metadata(metadata.clone())
            .send_message(payload.clone())
            .send_close_from_client()
            .recv_initial_metadata()
            .recv_message()
            .recv_status_on_client()
            .build()?;
        call.set_outbound_metadata(metadata);
        call.set_request(Some(payload));
        call.start_batch(batch, Tag::Unary(id))?;
        if self.log.enabled(Level::DEBUG) {
            debug!(method = %call.method(), call = %id, "unary batch submitted");
        }

        loop {
            match queue.next(deadline) {
                Event::Complete(completion) if completion.tag == Tag::Unary(id) => {
                    return self.complete(call, completion, timeout);
                }
                Event::Complete(completion) => {
                    debug!(tag = ?completion.tag, "ignoring completion for another call");
                }
                Event::Timeout => {
                    if Instant::now() >= deadline {
                        return Err(self.time_out(call, timeout));
                    }
                }
                Event::Shutdown => {
                    return Err(CallError::TransportFailure(Status::cancelled(
                        "completion queue shut down before the call completed",
                    )));
                }
            }
        }
    }

    fn complete(
        &self,
        call: &mut Call,
        completion: Completion,
        timeout: Duration,
    ) -> Result<UnaryResponse, CallError> {
        let tag = completion.tag;
        let success = completion.success;
        call.batch_completed(tag);
        let mut batch = completion.into_batch().ok_or_else(|| {
            CallError::TransportFailure(Status::internal("completion carried no batch"))
        })?;

        if !success {
            if call.deadline_elapsed() {
                return Err(self.time_out(call, timeout));
            }
            let status = batch
                .received_status()
                .cloned()
                .unwrap_or_else(|| Status::unavailable("transport failure"));
            call.finish(status.clone());
            return Err(CallError::TransportFailure(status));
        }

        let status = batch
            .received_status()
            .cloned()
            .unwrap_or_else(|| Status::internal("call completed without a status"));
        call.set_inbound_metadata(batch.take_initial_metadata().unwrap_or_default());
        call.finish(status.clone());
        if !status.is_ok() {
            return Err(CallError::RemoteFault(status));
        }

        call.set_response(batch.take_message());
        Ok(UnaryResponse {
            message: call.take_response(),
            initial_metadata: call.inbound_metadata().clone(),
            trailing_metadata: batch.take_trailers().unwrap_or_default(),
        })
    }

    fn time_out(&self, call: &mut Call, timeout: Duration) -> CallError {
        call.cancel(Status::cancelled("Client cancelled due to timeout"));
        call.finish(Status::deadline_exceeded("Deadline Exceeded"));
        debug!(method = %call.method(), "call cancelled after deadline");
        CallError::Timeout {
            method: call.method().to_string(),
            timeout,
        }
    }
}

/// One-shot unary call: returns the response payload, `None` when the server
/// answered OK without one.
pub fn call(
    connector: Arc<dyn Connector>,
    target: &str,
    method: &str,
    payload: Bytes,
    metadata: &[Bytes],
    timeout: Option<Duration>,
) -> Result<Option<Bytes>, CallError> {
    Client::new(connector)
        .execute(target, method, payload, metadata, timeout)
        .map(|response| response.message)
}
