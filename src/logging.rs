use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{level_filters::LevelFilter, Level, Span};
use tracing_subscriber::{fmt, EnvFilter};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Logging scope of one engine instance: a span tagged with the component and
/// an instance id, plus the verbosity the instance logs its per-event traces at.
#[derive(Debug, Clone)]
pub struct LogContext {
    span: Span,
    instance: u64,
    level: LevelFilter,
}

impl LogContext {
    pub fn new(component: &'static str, level: LevelFilter) -> Self {
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!("engine", component, instance);
        Self {
            span,
            instance,
            level,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn level(&self) -> LevelFilter {
        self.level
    }

    pub fn set_level(&mut self, level: LevelFilter) {
        self.level = level;
    }

    pub fn enabled(&self, level: Level) -> bool {
        self.level >= level
    }
}

/// Parses a verbosity name such as `debug` or `off`.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    value.trim().parse::<LevelFilter>().ok()
}

#[cfg(test)]
mod tests {
    use tracing::{level_filters::LevelFilter, Level};

    use super::{parse_level, LogContext};

    #[test]
    fn instances_are_distinct_and_levels_independent() {
        let quiet = LogContext::new("client", LevelFilter::WARN);
        let mut verbose = LogContext::new("server", LevelFilter::DEBUG);
        assert_ne!(quiet.instance(), verbose.instance());

        assert!(!quiet.enabled(Level::DEBUG));
        assert!(verbose.enabled(Level::DEBUG));
        assert!(!verbose.enabled(Level::TRACE));

        verbose.set_level(LevelFilter::OFF);
        assert!(!verbose.enabled(Level::ERROR));
        assert_eq!(quiet.level(), LevelFilter::WARN);
    }

    #[test]
    fn level_names_parse() {
        assert_eq!(parse_level("debug"), Some(LevelFilter::DEBUG));
        assert_eq!(parse_level(" off "), Some(LevelFilter::OFF));
        assert_eq!(parse_level("loud"), None);
    }
}
