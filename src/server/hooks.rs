//! Lifecycle hooks. At most one hook per point; a hook that errors or panics
//! is logged and otherwise ignored.

use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
};

use serde_json::Value;
use tracing::warn;

use super::registry::panic_message;
use crate::errors::HookError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    ServerCreate,
    QueueCreate,
    Bind,
    ServerStart,
    Run,
    Shutdown,
    Stopped,
}

impl HookPoint {
    pub const ALL: [HookPoint; 7] = [
        HookPoint::ServerCreate,
        HookPoint::QueueCreate,
        HookPoint::Bind,
        HookPoint::ServerStart,
        HookPoint::Run,
        HookPoint::Shutdown,
        HookPoint::Stopped,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HookPoint::ServerCreate => "server_create",
            HookPoint::QueueCreate => "queue_create",
            HookPoint::Bind => "bind",
            HookPoint::ServerStart => "server_start",
            HookPoint::Run => "run",
            HookPoint::Shutdown => "shutdown",
            HookPoint::Stopped => "stopped",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = HookError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        HookPoint::ALL
            .into_iter()
            .find(|point| point.as_str() == name)
            .ok_or_else(|| HookError::UnknownHook(name.to_string()))
    }
}

pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type HookFn = Box<dyn Fn(&Value) -> HookResult + Send + Sync>;

#[derive(Default)]
pub struct Hooks {
    hooks: HashMap<HookPoint, HookFn>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `hook` at `point`, replacing any earlier one.
    pub fn on<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: Fn(&Value) -> HookResult + Send + Sync + 'static,
    {
        self.hooks.insert(point, Box::new(hook));
        self
    }

    /// Installs a hook by name. Names outside the known set are rejected.
    pub fn register<F>(&mut self, name: &str, hook: F) -> Result<(), HookError>
    where
        F: Fn(&Value) -> HookResult + Send + Sync + 'static,
    {
        let point = name.parse::<HookPoint>()?;
        self.hooks.insert(point, Box::new(hook));
        Ok(())
    }

    pub fn is_registered(&self, point: HookPoint) -> bool {
        self.hooks.contains_key(&point)
    }

    /// Runs the hook for `point`, if any. Returns whether it completed cleanly.
    pub(crate) fn fire(&self, point: HookPoint, payload: &Value) -> bool {
        let Some(hook) = self.hooks.get(&point) else {
            return true;
        };
        match catch_unwind(AssertUnwindSafe(|| hook(payload))) {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(hook = %point, error = %err, "lifecycle hook failed");
                false
            }
            Err(panic) => {
                warn!(
                    hook = %point,
                    panic = %panic_message(panic.as_ref()),
                    "lifecycle hook panicked"
                );
                false
            }
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut points: Vec<&'static str> = self.hooks.keys().map(|p| p.as_str()).collect();
        points.sort_unstable();
        f.debug_struct("Hooks").field("points", &points).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use serde_json::json;

    use super::{HookPoint, Hooks};
    use crate::errors::HookError;

    #[test]
    fn names_parse_and_unknown_names_are_rejected() {
        for point in HookPoint::ALL {
            assert_eq!(point.as_str().parse::<HookPoint>(), Ok(point));
        }

        let mut hooks = Hooks::new();
        let err = hooks
            .register("on_start", |_| Ok(()))
            .expect_err("unknown hook");
        assert_eq!(err, HookError::UnknownHook("on_start".to_string()));
        assert!(hooks.register("bind", |_| Ok(())).is_ok());
        assert!(hooks.is_registered(HookPoint::Bind));
    }

    #[test]
    fn missing_hook_is_a_no_op() {
        assert!(Hooks::new().fire(HookPoint::Run, &json!({})));
    }

    #[test]
    fn hook_receives_payload() {
        let seen = Arc::new(AtomicU64::new(0));
        let captured = seen.clone();
        let hooks = Hooks::new().on(HookPoint::Bind, move |payload| {
            captured.store(payload["port"].as_u64().unwrap_or(0), Ordering::SeqCst);
            Ok(())
        });

        assert!(hooks.fire(HookPoint::Bind, &json!({ "port": 50051 })));
        assert_eq!(seen.load(Ordering::SeqCst), 50051);
    }

    #[test]
    fn faulting_hooks_are_contained() {
        let hooks = Hooks::new()
            .on(HookPoint::Run, |_| Err("hook refused".into()))
            .on(HookPoint::Stopped, |_| panic!("hook exploded"));

        assert!(!hooks.fire(HookPoint::Run, &json!({})));
        assert!(!hooks.fire(HookPoint::Stopped, &json!({})));
    }
}
