//! gRPC-over-HTTP/2 transport built on `h2`, driven by a private tokio runtime
//! so the engines themselves stay blocking.
//!
//! Each client call opens its own connection. Messages use the 5-byte gRPC
//! length prefix and the call status travels in `grpc-status` / `grpc-message`
//! trailers.

use std::{
    io,
    net::{SocketAddr, ToSocketAddrs},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use h2::{server::SendResponse, Reason, RecvStream};
use http::{
    header::{CONTENT_TYPE, TE},
    HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri,
};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::{Handle, Runtime},
    sync::oneshot,
    task::JoinHandle,
};
use tracing::{debug, info, warn};

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
    status::{Code, Status},
};

const HEADER_SIZE: usize = 5;
const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
const GRPC_CONTENT_TYPE: &str = "application/grpc";
const GRPC_TIMEOUT: &str = "grpc-timeout";
const GRPC_STATUS: &str = "grpc-status";
const GRPC_MESSAGE: &str = "grpc-message";
const WORKER_THREADS: usize = 2;
const BINARY_SUFFIX: &str = "-bin";

/// Header names the transport owns; never surfaced as call metadata.
const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "te",
    "user-agent",
    GRPC_TIMEOUT,
    GRPC_STATUS,
    GRPC_MESSAGE,
    "grpc-encoding",
    "grpc-accept-encoding",
];

#[derive(Clone)]
pub struct Http2Transport {
    runtime: Arc<Runtime>,
}

impl Http2Transport {
    pub fn new() -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("cqrpc-h2")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    /// Handle to the transport's runtime, e.g. for wiring signal listeners.
    pub fn handle(&self) -> Handle {
        self.runtime.handle().clone()
    }
}

impl Connector for Http2Transport {
    fn open_channel(&self, target: &str) -> Result<Box<dyn Channel>, TransportError> {
        let (host, port) = split_host_port(target)?;
        let authority = if host.contains(':') {
            format!("[{host}]:{port}")
        } else {
            format!("{host}:{port}")
        };
        Ok(Box::new(Http2Channel {
            runtime: self.runtime.clone(),
            target: target.to_string(),
            authority,
        }))
    }
}

impl ServerTransport for Http2Transport {
    fn create_listener(&self) -> Result<Box<dyn Listener>, TransportError> {
        Ok(Box::new(Http2Listener {
            runtime: self.runtime.clone(),
            bound: None,
            queue: AcceptQueue::new(),
            accept_task: None,
        }))
    }
}

struct Http2Channel {
    runtime: Arc<Runtime>,
    target: String,
    authority: String,
}

impl Channel for Http2Channel {
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
            handle: self.runtime.handle().clone(),
            authority: self.authority.clone(),
            method: method.to_string(),
            deadline,
            cq: cq.clone(),
            cancel: None,
            started: false,
        }))
    }
}

struct ClientCall {
    handle: Handle,
    authority: String,
    method: String,
    deadline: Instant,
    cq: CompletionSink,
    cancel: Option<oneshot::Sender<Status>>,
    started: bool,
}

struct Reply {
    initial_metadata: Metadata,
    message: Option<Bytes>,
    status: Status,
    trailers: Metadata,
}

impl ClientCall {
    fn build_request(&self, metadata: Option<&Metadata>) -> Result<Request<()>, SubmitError> {
        let path = if self.method.starts_with('/') {
            self.method.clone()
        } else {
            format!("/{}", self.method)
        };
        let uri = Uri::builder()
            .scheme("http")
            .authority(self.authority.as_str())
            .path_and_query(path)
            .build()
            .map_err(|err| SubmitError::InvalidBatch(format!("invalid request uri: {err}")))?;

        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(())
            .map_err(|err| SubmitError::InvalidBatch(err.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        headers.insert(TE, HeaderValue::from_static("trailers"));
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        if let Ok(value) = HeaderValue::from_str(&encode_timeout(remaining)) {
            headers.insert(GRPC_TIMEOUT, value);
        }
        if let Some(metadata) = metadata {
            append_metadata(headers, metadata)?;
        }
        Ok(request)
    }
}

impl CallHandle for ClientCall {
    fn start_batch(&mut self, batch: OpBatch, tag: Tag) -> Result<(), SubmitError> {
        batch.check_side(Side::Client)?;
        if self.started {
            return Err(SubmitError::InvalidBatch(
                "unary call already has its batch".to_string(),
            ));
        }
        if !batch.contains(OpKind::RecvStatusOnClient) {
            return Err(SubmitError::InvalidBatch(
                "unary batch must receive the call status".to_string(),
            ));
        }

        let request = self.build_request(batch.outgoing_metadata())?;
        let message = batch.outgoing_message().cloned().unwrap_or_default();
        let op = self.cq.begin(tag, CompletionData::Batch(batch))?;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancel = Some(cancel_tx);
        self.started = true;

        let authority = self.authority.clone();
        let deadline = tokio::time::Instant::from_std(self.deadline);
        self.handle.spawn(async move {
            let outcome = tokio::select! {
                result = tokio::time::timeout_at(deadline, unary_exchange(authority, request, message)) => {
                    match result {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Status::deadline_exceeded("Deadline Exceeded")),
                    }
                }
                cancelled = cancel_rx => {
                    Err(cancelled.unwrap_or_else(|_| Status::cancelled("call released by client")))
                }
            };
            finish_client_op(op, outcome);
        });
        Ok(())
    }

    fn cancel(&mut self, status: Status) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(status);
        }
    }
}

fn finish_client_op(mut op: PendingOp, outcome: Result<Reply, Status>) {
    match outcome {
        Ok(reply) => {
            if let Some(batch) = op.batch_mut() {
                batch.fill_client_reply(
                    reply.initial_metadata,
                    reply.message,
                    reply.status,
                    reply.trailers,
                );
            }
            op.complete(true);
        }
        Err(status) => {
            debug!(status = %status, "http2 client call failed");
            if let Some(batch) = op.batch_mut() {
                batch.fill_status(status);
            }
            op.complete(false);
        }
    }
}

async fn unary_exchange(
    authority: String,
    request: Request<()>,
    message: Bytes,
) -> Result<Reply, Status> {
    let socket = TcpStream::connect(&authority)
        .await
        .map_err(|err| Status::unavailable(format!("failed to connect to {authority}: {err}")))?;
    let _ = socket.set_nodelay(true);
    let (client, connection) = h2::client::handshake(socket)
        .await
        .map_err(unavailable)?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            debug!(error = %err, "http2 client connection closed");
        }
    });

    let mut client = client.ready().await.map_err(unavailable)?;
    let (response, mut stream) = client
        .send_request(request, false)
        .map_err(unavailable)?;
    stream
        .send_data(encode_message(&message), true)
        .map_err(unavailable)?;

    let response = response.await.map_err(|err| status_from_h2(&err))?;
    let (parts, mut body) = response.into_parts();
    if parts.status != StatusCode::OK {
        return Err(Status::new(
            code_from_http(parts.status),
            format!("unexpected HTTP status {}", parts.status),
        ));
    }

    if let Some(status) = status_from_headers(&parts.headers) {
        return Ok(Reply {
            initial_metadata: Metadata::new(),
            message: None,
            status,
            trailers: metadata_from_headers(&parts.headers),
        });
    }

    let mut buf = read_body(&mut body)
        .await
        .map_err(|err| status_from_h2(&err))?;
    let trailers = body
        .trailers()
        .await
        .map_err(|err| status_from_h2(&err))?
        .unwrap_or_default();
    let status = status_from_headers(&trailers)
        .unwrap_or_else(|| Status::internal("response is missing grpc-status"));
    let message = decode_message(&mut buf)
        .map_err(|err| Status::internal(format!("malformed response message: {err}")))?;

    Ok(Reply {
        initial_metadata: metadata_from_headers(&parts.headers),
        message,
        status,
        trailers: metadata_from_headers(&trailers),
    })
}

fn unavailable(err: impl std::fmt::Display) -> Status {
    Status::unavailable(err.to_string())
}

async fn read_body(body: &mut RecvStream) -> Result<BytesMut, h2::Error> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        let _ = body.flow_control().release_capacity(chunk.len());
        buf.extend_from_slice(&chunk);
    }
    Ok(buf)
}

struct Http2Listener {
    runtime: Arc<Runtime>,
    bound: Option<std::net::TcpListener>,
    queue: Arc<AcceptQueue>,
    accept_task: Option<JoinHandle<()>>,
}

impl Http2Listener {
    fn stop_accepting(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Listener for Http2Listener {
    fn bind(&mut self, address: &str) -> Result<u16, TransportError> {
        let addr: SocketAddr = address
            .to_socket_addrs()
            .map_err(|_| TransportError::InvalidAddress(address.to_string()))?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;

        let listener = std::net::TcpListener::bind(addr).map_err(|err| {
            if err.kind() == io::ErrorKind::AddrInUse {
                TransportError::AddressInUse(address.to_string())
            } else {
                TransportError::Bind {
                    address: address.to_string(),
                    source: err,
                }
            }
        })?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();
        self.bound = Some(listener);
        Ok(port)
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let listener = self.bound.take().ok_or(TransportError::NotBound)?;
        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(listener)?
        };
        if let Ok(local) = listener.local_addr() {
            info!(address = %local, "http2 listener started");
        }
        self.queue.start();
        self.accept_task = Some(
            self.runtime
                .spawn(accept_connections(listener, self.queue.clone())),
        );
        Ok(())
    }

    fn request_call(&mut self, cq: &CompletionSink, tag: Tag) -> Result<(), SubmitError> {
        self.queue.request_call(cq, tag)
    }

    fn shutdown_and_notify(&mut self, cq: &CompletionSink, tag: Tag) {
        self.stop_accepting();
        self.queue.shutdown_and_notify(cq, tag);
    }

    fn cancel_all_calls(&mut self) {
        debug!(live = self.queue.live_calls(), "cancel all http2 calls");
        self.queue.cancel_all_calls();
    }
}

impl Drop for Http2Listener {
    fn drop(&mut self) {
        self.stop_accepting();
        self.queue.close();
    }
}

async fn accept_connections(listener: TcpListener, queue: Arc<AcceptQueue>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let _ = socket.set_nodelay(true);
                tokio::spawn(serve_connection(socket, peer, queue.clone()));
            }
            Err(err) => {
                warn!(error = %err, "failed to accept connection");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn serve_connection(socket: TcpStream, peer: SocketAddr, queue: Arc<AcceptQueue>) {
    let mut connection = match h2::server::handshake(socket).await {
        Ok(connection) => connection,
        Err(err) => {
            debug!(peer = %peer, error = %err, "http2 handshake failed");
            return;
        }
    };

    while let Some(result) = connection.accept().await {
        match result {
            Ok((request, respond)) => {
                tokio::spawn(read_request(request, respond, queue.clone()));
            }
            Err(err) => {
                debug!(peer = %peer, error = %err, "http2 connection error");
                break;
            }
        }
    }
}

async fn read_request(
    request: Request<RecvStream>,
    mut respond: SendResponse<Bytes>,
    queue: Arc<AcceptQueue>,
) {
    let (parts, mut body) = request.into_parts();
    let method = parts.uri.path().to_string();
    let deadline = parts
        .headers
        .get(GRPC_TIMEOUT)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_timeout)
        .map(|timeout| Instant::now() + timeout);
    let metadata = metadata_from_headers(&parts.headers);

    let mut buf = match read_body(&mut body).await {
        Ok(buf) => buf,
        Err(err) => {
            debug!(method = %method, error = %err, "failed to read request body");
            return;
        }
    };
    let message = match decode_message(&mut buf) {
        Ok(message) => message,
        Err(err) => {
            let status = Status::internal(format!("malformed request message: {err}"));
            if let Err(err) = send_reply(&mut respond, HeaderMap::new(), None, &status, HeaderMap::new()) {
                debug!(error = %err, "failed to reject malformed request");
            }
            return;
        }
    };

    queue.offer(Box::new(Arrival {
        method,
        deadline,
        metadata,
        message,
        respond,
    }));
}

type SharedResponder = Arc<Mutex<Option<SendResponse<Bytes>>>>;

struct Arrival {
    method: String,
    deadline: Option<Instant>,
    metadata: Metadata,
    message: Option<Bytes>,
    respond: SendResponse<Bytes>,
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
            respond,
        } = *self;
        let respond: SharedResponder = Arc::new(Mutex::new(Some(respond)));
        let cancel = respond.clone();
        let live = live.register(Box::new(move || reset_stream(&cancel)));
        AcceptedCall {
            method,
            deadline,
            metadata,
            handle: Box::new(ServerCall {
                respond,
                request: message,
                initial_metadata: HeaderMap::new(),
                cq,
                _live: live,
            }),
        }
    }

    fn reject(mut self: Box<Self>, status: Status) {
        if let Err(err) = send_reply(&mut self.respond, HeaderMap::new(), None, &status, HeaderMap::new()) {
            debug!(error = %err, "failed to reject call");
        }
    }
}

fn reset_stream(respond: &SharedResponder) {
    if let Some(mut respond) = lock(respond).take() {
        respond.send_reset(Reason::CANCEL);
    }
}

struct ServerCall {
    respond: SharedResponder,
    request: Option<Bytes>,
    initial_metadata: HeaderMap,
    cq: CompletionSink,
    _live: LiveCall,
}

impl CallHandle for ServerCall {
    fn start_batch(&mut self, batch: OpBatch, tag: Tag) -> Result<(), SubmitError> {
        batch.check_side(Side::Server)?;

        if let Some(metadata) = batch.outgoing_metadata() {
            let mut headers = HeaderMap::new();
            append_metadata(&mut headers, metadata)?;
            self.initial_metadata = headers;
        }
        let reply = match batch.outgoing_status() {
            Some((status, trailers)) => {
                let mut trailer_map = HeaderMap::new();
                append_metadata(&mut trailer_map, trailers)?;
                Some((status.clone(), trailer_map, batch.outgoing_message().cloned()))
            }
            None => None,
        };

        let mut op = self.cq.begin(tag, CompletionData::Batch(batch))?;
        let mut responder = lock(&self.respond);
        let cancelled = responder.is_none();
        let mut success = !cancelled;
        if let Some(batch) = op.batch_mut() {
            if batch.contains(OpKind::RecvMessage) {
                batch.fill_request_message(self.request.take());
            }
            batch.fill_close(cancelled);
        }

        if let Some((status, trailers, message)) = reply {
            success = match responder.take() {
                Some(mut respond) => {
                    let headers = std::mem::take(&mut self.initial_metadata);
                    match send_reply(&mut respond, headers, message, &status, trailers) {
                        Ok(()) => true,
                        Err(err) => {
                            debug!(error = %err, "failed to send response");
                            false
                        }
                    }
                }
                None => false,
            };
        }
        drop(responder);
        op.complete(success);
        Ok(())
    }

    fn cancel(&mut self, _status: Status) {
        reset_stream(&self.respond);
    }
}

impl Drop for ServerCall {
    fn drop(&mut self) {
        reset_stream(&self.respond);
    }
}

/// Sends headers, the message and the status trailers. Without a message the
/// status goes out as a trailers-only response.
fn send_reply(
    respond: &mut SendResponse<Bytes>,
    mut headers: HeaderMap,
    message: Option<Bytes>,
    status: &Status,
    mut trailers: HeaderMap,
) -> Result<(), h2::Error> {
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
    match message {
        Some(message) => {
            let mut response = Response::new(());
            *response.headers_mut() = headers;
            let mut stream = respond.send_response(response, false)?;
            stream.send_data(encode_message(&message), false)?;
            put_status(&mut trailers, status);
            stream.send_trailers(trailers)
        }
        None => {
            headers.extend(trailers);
            put_status(&mut headers, status);
            let mut response = Response::new(());
            *response.headers_mut() = headers;
            respond.send_response(response, true).map(|_| ())
        }
    }
}

fn put_status(headers: &mut HeaderMap, status: &Status) {
    headers.insert(GRPC_STATUS, HeaderValue::from(status.code().as_u32()));
    if !status.detail().is_empty() {
        if let Ok(value) = HeaderValue::from_str(&percent_encode(status.detail())) {
            headers.insert(GRPC_MESSAGE, value);
        }
    }
}

fn status_from_headers(headers: &HeaderMap) -> Option<Status> {
    let code = headers
        .get(GRPC_STATUS)?
        .to_str()
        .ok()
        .and_then(|value| value.trim().parse::<u32>().ok())
        .map(Code::from_u32)
        .unwrap_or(Code::Unknown);
    let detail = headers
        .get(GRPC_MESSAGE)
        .map(|value| percent_decode(value.as_bytes()))
        .unwrap_or_default();
    Some(Status::new(code, detail))
}

fn status_from_h2(err: &h2::Error) -> Status {
    match err.reason() {
        Some(Reason::CANCEL) => Status::cancelled(err.to_string()),
        _ => Status::unavailable(err.to_string()),
    }
}

fn code_from_http(status: StatusCode) -> Code {
    match status {
        StatusCode::BAD_REQUEST => Code::Internal,
        StatusCode::UNAUTHORIZED => Code::Unauthenticated,
        StatusCode::FORBIDDEN => Code::PermissionDenied,
        StatusCode::NOT_FOUND => Code::Unimplemented,
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => Code::Unavailable,
        _ => Code::Unknown,
    }
}

/// Keys ending in `-bin` carry arbitrary bytes and go out base64 encoded.
/// Other values must already be valid header bytes.
fn append_metadata(headers: &mut HeaderMap, metadata: &Metadata) -> Result<(), SubmitError> {
    for (key, value) in metadata.iter() {
        let name = HeaderName::from_bytes(key).map_err(|_| {
            SubmitError::InvalidBatch(format!(
                "metadata key {:?} is not a valid header name",
                String::from_utf8_lossy(key)
            ))
        })?;
        if RESERVED_HEADERS.contains(&name.as_str()) {
            return Err(SubmitError::InvalidBatch(format!(
                "metadata key {} is reserved",
                name.as_str()
            )));
        }
        let value = if name.as_str().ends_with(BINARY_SUFFIX) {
            HeaderValue::from_maybe_shared(Bytes::from(STANDARD_NO_PAD.encode(value)))
        } else {
            HeaderValue::from_maybe_shared(value.clone())
        }
        .map_err(|_| {
            SubmitError::InvalidBatch(format!(
                "metadata value for {} is not a valid header, use a {BINARY_SUFFIX} key for binary values",
                name.as_str()
            ))
        })?;
        headers.append(name, value);
    }
    Ok(())
}

fn metadata_from_headers(headers: &HeaderMap) -> Metadata {
    headers
        .iter()
        .filter(|(name, _)| !RESERVED_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            let value = if name.as_str().ends_with(BINARY_SUFFIX) {
                let encoded = value.as_bytes();
                let unpadded = encoded
                    .iter()
                    .rposition(|byte| *byte != b'=')
                    .map_or(&encoded[..0], |end| &encoded[..=end]);
                match STANDARD_NO_PAD.decode(unpadded) {
                    Ok(decoded) => Bytes::from(decoded),
                    Err(err) => {
                        debug!(key = %name, error = %err, "dropping malformed binary metadata");
                        return None;
                    }
                }
            } else {
                Bytes::copy_from_slice(value.as_bytes())
            };
            Some((Bytes::copy_from_slice(name.as_str().as_bytes()), value))
        })
        .collect()
}

fn encode_message(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.put_u8(0);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.freeze()
}

/// Decodes the single message of a unary body. An empty body carries no message.
fn decode_message(buf: &mut BytesMut) -> io::Result<Option<Bytes>> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() < HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated message header",
        ));
    }

    let compressed = buf[0] != 0;
    let length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if compressed {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "compressed messages are not supported",
        ));
    }
    if length > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {length} bytes"),
        ));
    }
    if buf.len() < HEADER_SIZE + length {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated message body",
        ));
    }

    buf.advance(HEADER_SIZE);
    Ok(Some(buf.split_to(length).freeze()))
}

/// Formats a timeout the way `grpc-timeout` expects: at most 8 digits plus a unit.
fn encode_timeout(timeout: Duration) -> String {
    const MAX: u128 = 99_999_999;
    let millis = timeout.as_millis();
    if millis <= MAX {
        return format!("{}m", millis.max(1));
    }
    let secs = timeout.as_secs() as u128;
    if secs <= MAX {
        return format!("{secs}S");
    }
    format!("{}H", (secs / 3600).min(MAX))
}

fn parse_timeout(value: &str) -> Option<Duration> {
    let value = value.trim();
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount = digits.parse::<u64>().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.saturating_mul(3600)),
        "M" => Duration::from_secs(amount.saturating_mul(60)),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

fn percent_encode(detail: &str) -> String {
    let mut encoded = String::with_capacity(detail.len());
    for byte in detail.bytes() {
        if (0x20..=0x7e).contains(&byte) && byte != b'%' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

fn percent_decode(value: &[u8]) -> String {
    let mut decoded = Vec::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        if value[i] == b'%' && i + 2 < value.len() {
            let hex = std::str::from_utf8(&value[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|hex| u8::from_str_radix(hex, 16).ok()) {
                decoded.push(byte);
                i += 3;
                continue;
            }
        }
        decoded.push(value[i]);
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}
