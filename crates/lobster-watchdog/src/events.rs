use serde::Serialize;
use tokio::sync::broadcast;

/// What caused a scheduler-driven operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Idle,
    Traffic,
    Cron,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Traffic => write!(f, "traffic"),
            Self::Cron => write!(f, "cron"),
        }
    }
}

/// Watchdog event stream, consumed by the TUI/daemon.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum WatchdogEvent {
    SuspendStart {
        tenant: String,
        trigger: Trigger,
    },
    SuspendComplete {
        tenant: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_wake_at_ms: Option<u64>,
    },
    SuspendFailed {
        tenant: String,
        error: String,
    },
    ResumeStart {
        tenant: String,
        trigger: Trigger,
    },
    ResumeComplete {
        tenant: String,
        vm_pid: u32,
    },
    ResumeFailed {
        tenant: String,
        trigger: Trigger,
        error: String,
    },
}

impl WatchdogEvent {
    pub fn tenant(&self) -> &str {
        match self {
            Self::SuspendStart { tenant, .. }
            | Self::SuspendComplete { tenant, .. }
            | Self::SuspendFailed { tenant, .. }
            | Self::ResumeStart { tenant, .. }
            | Self::ResumeComplete { tenant, .. }
            | Self::ResumeFailed { tenant, .. } => tenant,
        }
    }
}

/// Bounded fan-out for watchdog events. Slow consumers lag and lose the
/// oldest events rather than blocking the loops.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WatchdogEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publish an event. Nobody listening is fine.
    pub fn publish(&self, event: WatchdogEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchdogEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = WatchdogEvent::SuspendComplete {
            tenant: "alice".to_string(),
            next_wake_at_ms: Some(123),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"suspend-complete\""));
        assert!(json.contains("\"nextWakeAtMs\":123"));

        let event = WatchdogEvent::ResumeStart {
            tenant: "alice".to_string(),
            trigger: Trigger::Traffic,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"resume-start\""));
        assert!(json.contains("\"trigger\":\"traffic\""));
    }

    #[test]
    fn test_event_tenant_accessor() {
        let event = WatchdogEvent::SuspendFailed {
            tenant: "bob".to_string(),
            error: "boom".to_string(),
        };
        assert_eq!(event.tenant(), "bob");
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(WatchdogEvent::SuspendStart {
            tenant: "alice".to_string(),
            trigger: Trigger::Idle,
        });
        let got = rx.recv().await.unwrap();
        assert_eq!(got.tenant(), "alice");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(WatchdogEvent::SuspendFailed {
            tenant: "alice".to_string(),
            error: "x".to_string(),
        });
    }

    #[tokio::test]
    async fn test_slow_consumer_drops_oldest() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        for i in 0..300 {
            bus.publish(WatchdogEvent::SuspendFailed {
                tenant: format!("t{}", i),
                error: "x".to_string(),
            });
        }
        // The receiver lagged: first recv reports the loss, the stream
        // then continues from the oldest retained event.
        match rx.recv().await {
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {:?}", other),
        }
        assert!(rx.recv().await.is_ok());
    }
}
