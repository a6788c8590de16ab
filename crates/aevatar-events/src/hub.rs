use aevatar_protocol::{AgentId, EventEnvelope, KernelObserver};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Fan-out of every envelope an agent publishes.
///
/// Delivery is at-most-once: slow subscribers lag and lose envelopes rather
/// than back-pressuring publishers.
#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        let _ = self.sender.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<EventEnvelope> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl KernelObserver for EventStreamHub {
    fn event_published(&self, _agent_id: &AgentId, envelope: &EventEnvelope) {
        self.publish(envelope.clone());
    }
}
