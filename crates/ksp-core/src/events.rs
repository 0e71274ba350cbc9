use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    PluginLoaded { id: String, version: String },
    PluginUnloaded { id: String },
    PluginError { id: String, detail: String },
    PluginHealthy { id: String },
    PluginUnhealthy { id: String, detail: String },
}

impl LifecycleEvent {
    pub fn plugin_id(&self) -> &str {
        match self {
            Self::PluginLoaded { id, .. }
            | Self::PluginUnloaded { id }
            | Self::PluginError { id, .. }
            | Self::PluginHealthy { id }
            | Self::PluginUnhealthy { id, .. } => id,
        }
    }
}

/// An event with the time it was published.
#[derive(Debug, Clone, Serialize)]
pub struct Stamped {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LifecycleEvent,
}

/// Fan-out of lifecycle events. Publishing never blocks and never fails;
/// slow subscribers observe `RecvError::Lagged`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Stamped>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: LifecycleEvent) {
        // No receivers is fine.
        let _ = self.tx.send(Stamped {
            at: Utc::now(),
            event,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Stamped> {
        self.tx.subscribe()
    }
}

/// Logs every event published on `bus` until the bus is dropped.
pub fn spawn_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(stamped) => log_event(&stamped.event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event logger lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &LifecycleEvent) {
    match event {
        LifecycleEvent::PluginLoaded { id, version } => {
            tracing::info!(plugin = %id, version = %version, "plugin loaded")
        }
        LifecycleEvent::PluginUnloaded { id } => tracing::info!(plugin = %id, "plugin unloaded"),
        LifecycleEvent::PluginError { id, detail } => {
            tracing::error!(plugin = %id, error = %detail, "plugin error")
        }
        LifecycleEvent::PluginHealthy { id } => tracing::info!(plugin = %id, "plugin healthy"),
        LifecycleEvent::PluginUnhealthy { id, detail } => {
            tracing::warn!(plugin = %id, error = %detail, "plugin unhealthy")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.publish(LifecycleEvent::PluginLoaded {
            id: "a".into(),
            version: "1.0.0".into(),
        });
        bus.publish(LifecycleEvent::PluginUnloaded { id: "a".into() });

        assert_eq!(rx.recv().await.unwrap().event.plugin_id(), "a");
        assert_eq!(
            rx.recv().await.unwrap().event,
            LifecycleEvent::PluginUnloaded { id: "a".into() }
        );
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        EventBus::new(1).publish(LifecycleEvent::PluginHealthy { id: "a".into() });
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(LifecycleEvent::PluginError {
            id: "a".into(),
            detail: "boom".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "plugin_error");
        assert_eq!(json["detail"], "boom");
    }
}
