//! Rule-change notification bus

use tokio::sync::broadcast;

/// Name of the event published when the rule set changes
pub const RULES_UPDATED_EVENT: &str = "error_patterns.updated";

/// Events carried on the rule bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleEvent {
    /// The authoritative rule set changed and caches should reload
    RuleSetUpdated,
}

impl RuleEvent {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            Self::RuleSetUpdated => RULES_UPDATED_EVENT,
        }
    }

    /// Parse a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            RULES_UPDATED_EVENT => Some(Self::RuleSetUpdated),
            _ => None,
        }
    }
}

/// Event bus for broadcasting rule changes to detector instances
#[derive(Clone)]
pub struct RuleEventBus {
    sender: broadcast::Sender<RuleEvent>,
}

impl RuleEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<RuleEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, event: RuleEvent) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Signal that the rule set changed
    pub fn notify_rules_updated(&self) {
        self.publish(RuleEvent::RuleSetUpdated);
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for RuleEventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = RuleEventBus::default();
        let mut rx = bus.subscribe();

        bus.notify_rules_updated();

        assert_eq!(rx.recv().await.unwrap(), RuleEvent::RuleSetUpdated);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = RuleEventBus::new(4);
        bus.notify_rules_updated();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_names() {
        assert_eq!(RuleEvent::RuleSetUpdated.name(), "error_patterns.updated");
        assert_eq!(
            RuleEvent::from_name("error_patterns.updated"),
            Some(RuleEvent::RuleSetUpdated)
        );
        assert_eq!(RuleEvent::from_name("other"), None);
    }
}
