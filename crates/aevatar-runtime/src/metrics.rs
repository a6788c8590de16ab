use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use aevatar_protocol::{AgentId, EventEnvelope, KernelObserver, SkipReason};
use serde::Serialize;

/// Counters for one agent's kernel activity.
#[derive(Debug, Default)]
pub struct KernelMetrics {
    published: AtomicU64,
    handled: AtomicU64,
    dropped: AtomicU64,
    handler_failures: AtomicU64,
    routing_skips: AtomicU64,
    handling_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub published: u64,
    pub handled: u64,
    pub dropped: u64,
    pub handler_failures: u64,
    pub routing_skips: u64,
    pub handling_micros: u64,
}

impl KernelMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            routing_skips: self.routing_skips.load(Ordering::Relaxed),
            handling_micros: self.handling_micros.load(Ordering::Relaxed),
        }
    }
}

impl KernelObserver for KernelMetrics {
    fn event_published(&self, _agent_id: &AgentId, _envelope: &EventEnvelope) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    fn event_handled(
        &self,
        _agent_id: &AgentId,
        _envelope: &EventEnvelope,
        _handlers: usize,
        elapsed: Duration,
    ) {
        self.handled.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.handling_micros.fetch_add(micros, Ordering::Relaxed);
    }

    fn event_dropped(&self, _agent_id: &AgentId, _envelope: &EventEnvelope) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn handler_failed(&self, _agent_id: &AgentId, _handler: &str, _message: &str) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn routing_skipped(&self, _agent_id: &AgentId, _target: &AgentId, _reason: SkipReason) {
        self.routing_skips.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fans every callback out to each registered observer in order.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn KernelObserver>>,
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn KernelObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl KernelObserver for ObserverSet {
    fn event_published(&self, agent_id: &AgentId, envelope: &EventEnvelope) {
        for observer in &self.observers {
            observer.event_published(agent_id, envelope);
        }
    }

    fn event_handled(
        &self,
        agent_id: &AgentId,
        envelope: &EventEnvelope,
        handlers: usize,
        elapsed: Duration,
    ) {
        for observer in &self.observers {
            observer.event_handled(agent_id, envelope, handlers, elapsed);
        }
    }

    fn event_dropped(&self, agent_id: &AgentId, envelope: &EventEnvelope) {
        for observer in &self.observers {
            observer.event_dropped(agent_id, envelope);
        }
    }

    fn handler_failed(&self, agent_id: &AgentId, handler: &str, message: &str) {
        for observer in &self.observers {
            observer.handler_failed(agent_id, handler, message);
        }
    }

    fn routing_skipped(&self, agent_id: &AgentId, target: &AgentId, reason: SkipReason) {
        for observer in &self.observers {
            observer.routing_skipped(agent_id, target, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use aevatar_protocol::{Direction, TypedPayload};

    use super::*;

    #[test]
    fn fan_out_reaches_every_observer() {
        let first = Arc::new(KernelMetrics::new());
        let second = Arc::new(KernelMetrics::new());
        let mut set = ObserverSet::new();
        set.push(Arc::clone(&first) as Arc<dyn KernelObserver>);
        set.push(Arc::clone(&second) as Arc<dyn KernelObserver>);

        let agent = AgentId::from("a");
        let env = EventEnvelope::new(
            agent.clone(),
            TypedPayload::new("test.Ping", b"null".to_vec()),
            Direction::Down,
            50,
        );
        set.event_published(&agent, &env);
        set.event_handled(&agent, &env, 2, Duration::from_micros(40));
        set.routing_skipped(&agent, &AgentId::from("b"), SkipReason::Cycle);

        for metrics in [first, second] {
            let snapshot = metrics.snapshot();
            assert_eq!(snapshot.published, 1);
            assert_eq!(snapshot.handled, 1);
            assert_eq!(snapshot.handling_micros, 40);
            assert_eq!(snapshot.routing_skips, 1);
            assert_eq!(snapshot.dropped, 0);
        }
    }
}
