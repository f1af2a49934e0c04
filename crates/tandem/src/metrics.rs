//! Shared counters exposed through `rpc.serverInfo`.
//!
//! A `Metrics` bag may be shared across servers via
//! [`ServerOptions::metrics`](crate::ServerOptions); each server otherwise
//! gets its own.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// A named counter bag. Counters are signed and monotone by convention;
/// max-value counters record a high-water mark instead of a sum.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, i64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the named counter, creating it at zero if needed.
    pub fn count(&self, name: &str, n: i64) {
        let mut counters = self.counters.lock().unwrap();
        *counters.entry(name.to_string()).or_insert(0) += n;
    }

    /// Raise the named counter to `value` if it is below it.
    pub fn set_max(&self, name: &str, value: i64) {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(name.to_string()).or_insert(value);
        if *entry < value {
            *entry = value;
        }
    }

    /// A point-in-time copy of every counter, sorted by name.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.counters.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_accumulates() {
        let m = Metrics::new();
        m.count("rpc.requests", 1);
        m.count("rpc.requests", 2);
        assert_eq!(m.snapshot().get("rpc.requests"), Some(&3));
    }

    #[test]
    fn set_max_keeps_high_water_mark() {
        let m = Metrics::new();
        m.set_max("rpc.inflight", 3);
        m.set_max("rpc.inflight", 1);
        m.set_max("rpc.inflight", 5);
        assert_eq!(m.snapshot().get("rpc.inflight"), Some(&5));
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let m = Metrics::new();
        m.count("b", 1);
        m.count("a", 1);
        let names: Vec<_> = m.snapshot().into_keys().collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
