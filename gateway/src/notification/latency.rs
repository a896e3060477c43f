//! Rolling callback latency per destination host.

use dashmap::DashMap;
use std::collections::VecDeque;

/// Keeps the last `max_samples` delivery times per host and classifies a
/// host as slow when their average exceeds the threshold.
#[derive(Debug)]
pub struct HostLatencyTracker {
    samples: DashMap<String, VecDeque<u64>>,
    max_samples: usize,
    slow_threshold_ms: u64,
}

impl HostLatencyTracker {
    pub fn new(max_samples: usize, slow_threshold_ms: u64) -> Self {
        Self {
            samples: DashMap::new(),
            max_samples: max_samples.max(1),
            slow_threshold_ms,
        }
    }

    pub fn add_execution_time(&self, host: &str, elapsed_ms: u64) {
        let mut entry = self.samples.entry(host.to_string()).or_default();
        if entry.len() == self.max_samples {
            entry.pop_front();
        }
        entry.push_back(elapsed_ms);
    }

    /// Unknown hosts are fast.
    pub fn is_slow(&self, host: &str) -> bool {
        self.samples
            .get(host)
            .map(|s| Self::average(&s) > self.slow_threshold_ms as f64)
            .unwrap_or(false)
    }

    /// Hosts currently in the requested class.
    pub fn get_hosts(&self, slow: bool) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .samples
            .iter()
            .filter(|e| (Self::average(e.value()) > self.slow_threshold_ms as f64) == slow)
            .map(|e| e.key().clone())
            .collect();
        hosts.sort();
        hosts
    }

    fn average(samples: &VecDeque<u64>) -> f64 {
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().sum::<u64>() as f64 / samples.len() as f64
    }
}

/// Host part of a callback URL (`scheme://host:port/path` -> `host:port`).
pub fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    authority.rsplit_once('@').map(|(_, h)| h).unwrap_or(authority)
}
