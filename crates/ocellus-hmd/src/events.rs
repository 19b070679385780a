use std::sync::Arc;

use ocellus_xr::{CapabilityId, MapEvents};
use tracing::trace;

use crate::permission::PermissionState;

/// Lifecycle notifications published by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum HmdEvent {
    SessionReady { render_target_size: (u32, u32) },
    SessionInitFailed,
    SessionDestroyed,
    CapabilityChanged {
        capability: CapabilityId,
        state: PermissionState,
    },
    /// The tracker raised map events this tick; never empty.
    HeadTrackingMapEvents { events: MapEvents },
    Paused,
    Resumed,
}

pub trait HmdEventListener: Send + Sync {
    fn on_event(&self, event: &HmdEvent);
}

impl<F> HmdEventListener for F
where
    F: Fn(&HmdEvent) + Send + Sync,
{
    fn on_event(&self, event: &HmdEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener list owned by the scheduler. Listeners run on the stage that
/// raised the event, in registration order.
#[derive(Default)]
pub struct EventRegistry {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn HmdEventListener>)>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn HmdEventListener>) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        self.listeners.push((id, listener));
        id
    }

    /// Returns false if the id was not registered.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn dispatch(&self, event: &HmdEvent) {
        trace!(?event, listeners = self.listeners.len(), "dispatching hmd event");
        for (_, listener) in &self.listeners {
            listener.on_event(event);
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_dispatch_reaches_all_listeners() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = EventRegistry::new();
        for tag in 0..2 {
            let seen = seen.clone();
            registry.add(Arc::new(move |event: &HmdEvent| {
                seen.lock().unwrap().push((tag, event.clone()));
            }));
        }
        registry.dispatch(&HmdEvent::Paused);
        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(0, HmdEvent::Paused), (1, HmdEvent::Paused)]
        );
    }

    #[test]
    fn test_removed_listener_is_not_called() {
        let hits = Arc::new(Mutex::new(0u32));
        let mut registry = EventRegistry::new();
        let counter = hits.clone();
        let id = registry.add(Arc::new(move |_: &HmdEvent| {
            *counter.lock().unwrap() += 1;
        }));
        registry.dispatch(&HmdEvent::Resumed);
        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        registry.dispatch(&HmdEvent::Resumed);
        assert_eq!(*hits.lock().unwrap(), 1);
        assert!(registry.is_empty());
    }
}
