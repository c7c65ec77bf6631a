//! Counter-style telemetry interface.
//!
//! Metrics backends are external collaborators; the engine only needs a
//! handle it can increment on. The default sink logs through `tracing` at
//! trace level so counters remain observable without any backend wired in.
use std::{cell::RefCell, collections::HashMap, rc::Rc};

pub trait Metrics {
    fn incr(&self, key: &str);
}

/// Default sink: every increment becomes a trace event.
#[derive(Debug, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn incr(&self, key: &str) {
        tracing::trace!(counter = key, "incr");
    }
}

/// In-memory sink for assertions in tests and for embedders that want to
/// scrape counters themselves.
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    counters: RefCell<HashMap<String, u64>>,
}

impl RecordingMetrics {
    pub fn get(&self, key: &str) -> u64 {
        self.counters.borrow().get(key).copied().unwrap_or(0)
    }
}

impl Metrics for RecordingMetrics {
    fn incr(&self, key: &str) {
        *self.counters.borrow_mut().entry(key.to_string()).or_insert(0) += 1;
    }
}

pub fn default_metrics() -> Rc<dyn Metrics> {
    Rc::new(TracingMetrics)
}
