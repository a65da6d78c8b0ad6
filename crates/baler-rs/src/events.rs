//! Compaction lifecycle events and observers.
//!
//! The engine communicates with callers through [`ContextEvent`] variants
//! delivered to an explicit observer list (the [`Notifier`]), not a global
//! event bus, so the core stays testable in isolation. Emission is
//! synchronous and in registration order; a panicking subscriber is isolated
//! and never aborts the compaction that emitted the event.

use crate::compress::CompressionOutcome;
use std::panic::{AssertUnwindSafe, catch_unwind};
use tracing::{info, warn};

/// Events emitted around threshold crossings and compression runs.
#[derive(Debug)]
pub enum ContextEvent<'a> {
    /// The warn threshold was crossed for the first time since the last
    /// compaction.
    ContextWarning { usage_percent: f64 },
    /// A compression run is starting.
    CompactionStarted,
    /// A compression run finished; the outcome has before/after counts.
    CompactionFinished(&'a CompressionOutcome),
    /// Narrative generation failed or timed out; the run continued with
    /// deterministic facts and a placeholder narrative.
    CompactionDegraded { reason: &'a str },
}

/// Observer for [`ContextEvent`]s.
///
/// Implement this to print warning lines in a CLI, collect metrics, or
/// record events in tests. The default implementation ignores everything.
pub trait ContextEventHandler: Send + Sync {
    fn on_event(&self, event: &ContextEvent<'_>) {
        let _ = event;
    }
}

/// An observer that ignores all events.
pub struct NoopHandler;
impl ContextEventHandler for NoopHandler {}

/// An observer backed by a closure.
pub struct FnHandler<F>(F)
where
    F: Fn(&ContextEvent<'_>) + Send + Sync;

impl<F> FnHandler<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ContextEventHandler for FnHandler<F>
where
    F: Fn(&ContextEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ContextEvent<'_>) {
        (self.0)(event)
    }
}

/// An observer that fans one subscription out to several handlers. Useful
/// when a caller gets to register exactly one handler slot.
#[derive(Default)]
pub struct CompositeHandler {
    handlers: Vec<Box<dyn ContextEventHandler>>,
}

impl CompositeHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: impl ContextEventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }
}

impl ContextEventHandler for CompositeHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// An observer that logs events via `tracing`, matching what a CLI would
/// print: a warning line, a "compacting" line, and a completion line with
/// before/after counts.
pub struct LoggingHandler;

impl ContextEventHandler for LoggingHandler {
    fn on_event(&self, event: &ContextEvent<'_>) {
        match event {
            ContextEvent::ContextWarning { usage_percent } => {
                warn!(
                    "context at {:.0}% of the window; compaction will run at the compact threshold",
                    usage_percent * 100.0
                );
            }
            ContextEvent::CompactionStarted => {
                info!("compacting context...");
            }
            ContextEvent::CompactionFinished(outcome) => {
                info!(
                    "compaction finished: {} -> {} tokens, {} message(s) pruned, {} summary(ies) created{}",
                    outcome.tokens_before,
                    outcome.tokens_after,
                    outcome.pruned.len(),
                    outcome.summaries_created,
                    if outcome.degraded { " (degraded)" } else { "" },
                );
            }
            ContextEvent::CompactionDegraded { reason } => {
                warn!("compaction degraded: {reason}");
            }
        }
    }
}

/// Explicit observer list passed into the compression engine.
///
/// Handlers are called once per emission, in registration order. There are
/// no delivery guarantees beyond that, and a panic in one handler does not
/// prevent delivery to the rest.
#[derive(Default)]
pub struct Notifier {
    handlers: Vec<Box<dyn ContextEventHandler>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler (builder pattern). Handlers fire in registration order.
    pub fn with(mut self, handler: impl ContextEventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add a handler to an existing notifier.
    pub fn subscribe(&mut self, handler: impl ContextEventHandler + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Deliver an event to every handler, isolating panics.
    pub fn emit(&self, event: &ContextEvent<'_>) {
        for handler in &self.handlers {
            if catch_unwind(AssertUnwindSafe(|| handler.on_event(event))).is_err() {
                warn!("event subscriber panicked; continuing with remaining subscribers");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recording_handler(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl ContextEventHandler {
        FnHandler::new(move |event: &ContextEvent<'_>| {
            let name = match event {
                ContextEvent::ContextWarning { .. } => "warning",
                ContextEvent::CompactionStarted => "started",
                ContextEvent::CompactionFinished(_) => "finished",
                ContextEvent::CompactionDegraded { .. } => "degraded",
            };
            log.lock().unwrap().push(format!("{tag}:{name}"));
        })
    }

    #[test]
    fn handlers_fire_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::new()
            .with(recording_handler(log.clone(), "a"))
            .with(recording_handler(log.clone(), "b"));

        notifier.emit(&ContextEvent::CompactionStarted);
        notifier.emit(&ContextEvent::ContextWarning { usage_percent: 0.81 });

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec!["a:started", "b:started", "a:warning", "b:warning"]);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        struct Panicker;
        impl ContextEventHandler for Panicker {
            fn on_event(&self, _event: &ContextEvent<'_>) {
                panic!("subscriber bug");
            }
        }

        let log = Arc::new(Mutex::new(Vec::new()));
        let notifier = Notifier::new()
            .with(Panicker)
            .with(recording_handler(log.clone(), "after"));

        notifier.emit(&ContextEvent::CompactionStarted);

        // The handler after the panicker still ran.
        assert_eq!(log.lock().unwrap().clone(), vec!["after:started"]);
    }

    #[test]
    fn composite_fans_out_to_all_members() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut composite = CompositeHandler::new();
        composite.push(recording_handler(log.clone(), "x"));
        composite.push(recording_handler(log.clone(), "y"));

        let notifier = Notifier::new().with(composite);
        notifier.emit(&ContextEvent::CompactionStarted);
        assert_eq!(log.lock().unwrap().clone(), vec!["x:started", "y:started"]);
    }

    #[test]
    fn empty_notifier_emits_quietly() {
        let notifier = Notifier::new();
        notifier.emit(&ContextEvent::CompactionStarted); // must not panic
    }

    #[test]
    fn noop_handler_ignores_events() {
        let notifier = Notifier::new().with(NoopHandler);
        notifier.emit(&ContextEvent::ContextWarning { usage_percent: 0.9 });
    }
}
