//! Typed notification events delivered to weakly-held listeners.

use std::rc::{Rc, Weak};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationEvent {
    RomLoaded { system: String, name: String },
    RomLoadFailed { reason: String },
    StateLoaded,
    StateLoadFailed { reason: String },
    SaveStateCreated,
    MovieEnded,
    MovieRecordingStarted,
    CheatsApplied { count: usize },
    RewindStarted,
    RewindStopped,
}

type Listener = dyn Fn(&NotificationEvent);

#[derive(Default)]
pub struct NotificationManager {
    listeners: Vec<Weak<Listener>>,
}

impl NotificationManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Expired listeners are pruned here rather than on every dispatch.
    pub fn register(&mut self, listener: &Rc<Listener>) {
        self.listeners.retain(|weak| weak.strong_count() > 0);
        self.listeners.push(Rc::downgrade(listener));
    }

    pub fn notify(&self, event: &NotificationEvent) {
        for weak in &self.listeners {
            if let Some(listener) = weak.upgrade() {
                listener(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn delivers_to_live_listeners_and_prunes_dead_ones() {
        let mut manager = NotificationManager::new();
        let received = Rc::new(RefCell::new(Vec::new()));

        let received_clone = Rc::clone(&received);
        let listener: Rc<Listener> = Rc::new(move |event: &NotificationEvent| {
            received_clone.borrow_mut().push(event.clone());
        });
        manager.register(&listener);

        let dropped: Rc<Listener> = Rc::new(|_: &NotificationEvent| panic!("should not fire"));
        manager.register(&dropped);
        drop(dropped);

        manager.notify(&NotificationEvent::SaveStateCreated);
        assert_eq!(received.borrow().len(), 1);

        // Registration prunes the dead listener
        manager.register(&listener);
        assert_eq!(manager.listeners.len(), 2);
    }
}
