//! Adaptive cap on simultaneous in-flight loads

use crate::core::{
    clock::Timestamp,
    config::{CacheConfig, DeviceCapabilityClass},
    constants::NETWORK_WINDOW_MS,
};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkCondition {
    Good, // < 500ms average
    Fair, // 500ms - 2s average
    Poor, // > 2s average
}

/// Sliding-window record of load latency and failures
#[derive(Debug, Clone)]
pub struct NetworkMetrics {
    recent_durations: VecDeque<(u64, Timestamp)>,
    recent_failures: VecDeque<Timestamp>,
    average_duration_ms: u64,
    condition: NetworkCondition,
}

impl Default for NetworkMetrics {
    fn default() -> Self {
        Self {
            recent_durations: VecDeque::with_capacity(100),
            recent_failures: VecDeque::with_capacity(50),
            average_duration_ms: 0,
            condition: NetworkCondition::Good,
        }
    }
}

impl NetworkMetrics {
    pub fn record_success(&mut self, duration_ms: u64, now: Timestamp) {
        self.prune(now);
        self.recent_durations.push_back((duration_ms, now));
        self.update_average();
        self.update_condition();
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        self.prune(now);
        self.recent_failures.push_back(now);
        self.update_condition();
    }

    pub fn condition(&self) -> NetworkCondition {
        self.condition
    }

    pub fn average_duration_ms(&self) -> u64 {
        self.average_duration_ms
    }

    fn prune(&mut self, now: Timestamp) {
        let cutoff = now.saturating_sub(NETWORK_WINDOW_MS);
        while let Some(&(_, time)) = self.recent_durations.front() {
            if time < cutoff {
                self.recent_durations.pop_front();
            } else {
                break;
            }
        }
        while let Some(&time) = self.recent_failures.front() {
            if time < cutoff {
                self.recent_failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn update_average(&mut self) {
        if self.recent_durations.is_empty() {
            return;
        }
        let total: u64 = self.recent_durations.iter().map(|(d, _)| *d).sum();
        self.average_duration_ms = total / self.recent_durations.len() as u64;
    }

    fn update_condition(&mut self) {
        let failure_rate = self.recent_failures.len() as f64
            / (self.recent_durations.len() + self.recent_failures.len()).max(1) as f64;

        self.condition = if failure_rate > 0.5 || self.average_duration_ms > 2000 {
            NetworkCondition::Poor
        } else if failure_rate > 0.2 || self.average_duration_ms > 500 {
            NetworkCondition::Fair
        } else {
            NetworkCondition::Good
        };
    }

    /// Scale a base cap to the observed condition, never below one
    pub fn concurrency_limit(&self, base_limit: usize) -> usize {
        let limit = match self.condition {
            NetworkCondition::Good => base_limit,
            NetworkCondition::Fair => base_limit * 2 / 3,
            NetworkCondition::Poor => base_limit / 2,
        };
        limit.max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Boost {
    cap: usize,
    until: Timestamp,
}

/// Admission control for loads.
///
/// `in_flight` never exceeds the effective cap at the moment of admission.
/// When a boost lapses (or the network degrades) loads already admitted run
/// to completion; no new load is admitted until `in_flight` drops below the
/// lowered cap.
#[derive(Debug, Clone)]
pub struct ConcurrencyController {
    base_cap: usize,
    in_flight: usize,
    boost: Option<Boost>,
    metrics: Option<NetworkMetrics>,
}

impl ConcurrencyController {
    pub fn new(cap: usize) -> Self {
        Self {
            base_cap: cap.max(1),
            in_flight: 0,
            boost: None,
            metrics: None,
        }
    }

    pub fn for_device(class: DeviceCapabilityClass, config: &CacheConfig) -> Self {
        Self::new(config.max_concurrency.for_class(class))
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::for_device(config.device_class, config).with_network_adaptation(config.network_adaptive)
    }

    pub fn with_network_adaptation(mut self, enabled: bool) -> Self {
        self.metrics = enabled.then(NetworkMetrics::default);
        self
    }

    /// Base cap after network adaptation
    pub fn cap(&self) -> usize {
        match &self.metrics {
            Some(metrics) => metrics.concurrency_limit(self.base_cap),
            None => self.base_cap,
        }
    }

    pub fn effective_cap(&self, now: Timestamp) -> usize {
        match self.boost {
            Some(boost) if now < boost.until => self.cap().max(boost.cap),
            _ => self.cap(),
        }
    }

    pub fn is_boosted(&self, now: Timestamp) -> bool {
        self.boost.is_some_and(|boost| now < boost.until)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_capacity(&self, now: Timestamp) -> bool {
        self.in_flight < self.effective_cap(now)
    }

    /// Take a slot if one is free
    pub fn try_admit(&mut self, now: Timestamp) -> bool {
        if let Some(boost) = self.boost {
            if now >= boost.until {
                log::debug!("concurrency boost to {} lapsed", boost.cap);
                self.boost = None;
            }
        }

        if self.has_capacity(now) {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    /// Give back a slot on completion (success, failure or cancellation)
    pub fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Temporarily raise the cap. A new boost replaces the pending one.
    pub fn boost(&mut self, cap: usize, duration_ms: u64, now: Timestamp) {
        self.boost = Some(Boost {
            cap,
            until: now.saturating_add(duration_ms),
        });
    }

    pub fn record_success(&mut self, duration_ms: u64, now: Timestamp) {
        if let Some(metrics) = &mut self.metrics {
            metrics.record_success(duration_ms, now);
        }
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        if let Some(metrics) = &mut self.metrics {
            metrics.record_failure(now);
        }
    }

    pub fn network_condition(&self) -> Option<NetworkCondition> {
        self.metrics.as_ref().map(NetworkMetrics::condition)
    }
}
