//! Method name to handler mapping. Handler faults and panics stop at
//! [`HandlerRegistry::dispatch`] and never reach the serving loop.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    io::Write,
    panic::{catch_unwind, AssertUnwindSafe},
    process::{Command, Stdio},
    sync::Arc,
    thread,
};

use bytes::Bytes;
use tracing::debug;

use crate::{errors::HandlerFault, status::Status};

pub trait Handler: Send + Sync {
    fn invoke(&self, request: Bytes) -> Result<Bytes, HandlerFault>;
}

impl<F> Handler for F
where
    F: Fn(Bytes) -> Result<Bytes, HandlerFault> + Send + Sync,
{
    fn invoke(&self, request: Bytes) -> Result<Bytes, HandlerFault> {
        self(request)
    }
}

/// Runs an external program per call: the request is written to its stdin and
/// its stdout becomes the response. A non-zero exit is a fault.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    program: String,
    args: Vec<String>,
}

impl CommandHandler {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl Handler for CommandHandler {
    fn invoke(&self, request: Bytes) -> Result<Bytes, HandlerFault> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| HandlerFault::Process(format!("failed to run {}: {err}", self.program)))?;

        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                // The child may exit without reading its input.
                let _ = stdin.write_all(&request);
            })
        });
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            let _ = writer.join();
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HandlerFault::Process(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(Bytes::from(output.stdout))
    }
}

#[derive(Debug)]
pub enum DispatchError {
    NotFound(String),
    Fault(HandlerFault),
}

impl DispatchError {
    pub fn into_status(self) -> Status {
        match self {
            Self::NotFound(method) => {
                Status::unimplemented(format!("Method not implemented or not found: {method}"))
            }
            Self::Fault(fault) => Status::internal(format!("Error in handler: {fault}")),
        }
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `method`, replacing any earlier registration.
    pub fn register(&mut self, method: impl Into<String>, handler: impl Handler + 'static) -> &mut Self {
        self.handlers.insert(method.into(), Arc::new(handler));
        self
    }

    pub fn with(mut self, method: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.register(method, handler);
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<&str> {
        let mut methods: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        methods.sort_unstable();
        methods
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn dispatch(&self, method: &str, request: Bytes) -> Result<Bytes, DispatchError> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| DispatchError::NotFound(method.to_string()))?;

        match catch_unwind(AssertUnwindSafe(|| handler.invoke(request))) {
            Ok(result) => result.map_err(DispatchError::Fault),
            Err(panic) => {
                let description = panic_message(panic.as_ref());
                debug!(method = %method, panic = %description, "handler panicked");
                Err(DispatchError::Fault(HandlerFault::Panicked(description)))
            }
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown error during handler execution".to_string()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{CommandHandler, DispatchError, HandlerRegistry};
    use crate::{errors::HandlerFault, status::Code};

    fn registry() -> HandlerRegistry {
        HandlerRegistry::new()
            .with("/echo", |request: Bytes| -> Result<Bytes, HandlerFault> { Ok(request) })
            .with("/fail", |_request: Bytes| -> Result<Bytes, HandlerFault> {
                Err(HandlerFault::msg("boom"))
            })
            .with("/panic", |_request: Bytes| -> Result<Bytes, HandlerFault> {
                panic!("handler exploded")
            })
    }

    #[test]
    fn dispatch_invokes_registered_handler() {
        let response = registry()
            .dispatch("/echo", Bytes::from_static(b"\x01\x02\x03"))
            .expect("echo succeeds");
        assert_eq!(response, Bytes::from_static(b"\x01\x02\x03"));
    }

    #[test]
    fn unknown_method_maps_to_unimplemented() {
        let err = registry()
            .dispatch("/missing", Bytes::new())
            .expect_err("no handler");
        assert!(matches!(err, DispatchError::NotFound(_)));

        let status = err.into_status();
        assert_eq!(status.code(), Code::Unimplemented);
        assert!(status.detail().contains("/missing"));
    }

    #[test]
    fn faults_and_panics_become_internal() {
        let registry = registry();

        let fault = registry
            .dispatch("/fail", Bytes::new())
            .expect_err("handler fails")
            .into_status();
        assert_eq!(fault.code(), Code::Internal);
        assert!(fault.detail().contains("boom"));

        let panic = registry
            .dispatch("/panic", Bytes::new())
            .expect_err("handler panics")
            .into_status();
        assert_eq!(panic.code(), Code::Internal);
        assert!(panic.detail().contains("handler exploded"));
    }

    #[cfg(unix)]
    #[test]
    fn command_handler_pipes_request_through_process() {
        let cat = CommandHandler::new("cat");
        let registry = HandlerRegistry::new().with("/cat", cat);
        let response = registry
            .dispatch("/cat", Bytes::from_static(b"ping"))
            .expect("cat echoes");
        assert_eq!(response, Bytes::from_static(b"ping"));

        let failing = HandlerRegistry::new().with("/false", CommandHandler::new("false"));
        let err = failing
            .dispatch("/false", Bytes::new())
            .expect_err("non-zero exit");
        assert!(matches!(err, DispatchError::Fault(HandlerFault::Process(_))));
    }
}
