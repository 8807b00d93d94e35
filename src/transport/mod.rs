//! Transport seam. The engines only ever see these traits; completions flow
//! back through the [`CompletionSink`] handed in when a call or accept is created.

use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use crate::{
    batch::OpBatch,
    completion::{CompletionSink, Tag},
    errors::{SubmitError, TransportError},
    metadata::Metadata,
    status::Status,
};

pub(crate) mod accept;
pub mod http2;
pub mod inproc;

pub trait Connector: Send + Sync {
    fn open_channel(&self, target: &str) -> Result<Box<dyn Channel>, TransportError>;
}

pub trait Channel: Send {
    fn target(&self) -> &str;

    fn create_call(
        &self,
        method: &str,
        deadline: Instant,
        cq: &CompletionSink,
    ) -> Result<Box<dyn CallHandle>, TransportError>;
}

/// Transport side of one call. Each submitted batch completes exactly once on
/// the call's queue, and dropping the handle releases the call.
pub trait CallHandle: Send {
    fn start_batch(&mut self, batch: OpBatch, tag: Tag) -> Result<(), SubmitError>;

    /// Best effort. Outstanding batches complete with `success = false`.
    fn cancel(&mut self, status: Status);
}

pub trait ServerTransport: Send + Sync {
    fn create_listener(&self) -> Result<Box<dyn Listener>, TransportError>;
}

pub trait Listener: Send {
    /// Returns the bound port.
    fn bind(&mut self, address: &str) -> Result<u16, TransportError>;

    fn start(&mut self) -> Result<(), TransportError>;

    /// Posts one accept. It completes with [`crate::completion::CompletionData::Accepted`]
    /// once a client call arrives, or with failure if the listener goes away first.
    fn request_call(&mut self, cq: &CompletionSink, tag: Tag) -> Result<(), SubmitError>;

    /// Stops accepting and posts `tag` once every accepted call has been released.
    fn shutdown_and_notify(&mut self, cq: &CompletionSink, tag: Tag);

    fn cancel_all_calls(&mut self);
}

/// A call handed to the server by a completed accept.
pub struct AcceptedCall {
    pub method: String,
    pub deadline: Option<Instant>,
    pub metadata: Metadata,
    pub handle: Box<dyn CallHandle>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub(crate) fn split_host_port(address: &str) -> Result<(String, u16), TransportError> {
    let invalid = || TransportError::InvalidAddress(address.to_string());
    let address = address.trim();
    let (host, port) = address.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::split_host_port;
    use crate::errors::TransportError;

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            split_host_port("localhost:50051").expect("valid"),
            ("localhost".to_string(), 50051)
        );
        assert_eq!(
            split_host_port("[::1]:0").expect("valid"),
            ("::1".to_string(), 0)
        );
        assert!(matches!(
            split_host_port("no-port"),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(split_host_port(":80").is_err());
    }
}
