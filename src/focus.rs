//! Window-focus and network-reachability broadcasters.
//!
//! The core has no notion of a browser window or a network interface; a
//! platform-integration crate drives these by calling `notify()` in response
//! to whatever the host platform considers a focus or reconnect event.
//! [`crate::observer::QueryObserver`] subscribes to the ones it's told to
//! honor (spec.md §4.6 `refetchOnWindowFocus`/`refetchOnReconnect`).

use std::cell::RefCell;
use std::rc::Rc;

use slotmap::{new_key_type, SlotMap};

new_key_type! {
    pub struct FocusListenerKey;
}

/// A broadcaster with no payload — subscribers just care that the event
/// happened.
#[derive(Clone)]
pub struct Broadcaster {
    listeners: Rc<RefCell<SlotMap<FocusListenerKey, Box<dyn Fn()>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Broadcaster {
            listeners: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }

    pub fn subscribe(&self, listener: impl Fn() + 'static) -> FocusListenerKey {
        self.listeners.borrow_mut().insert(Box::new(listener))
    }

    pub fn unsubscribe(&self, key: FocusListenerKey) -> bool {
        self.listeners.borrow_mut().remove(key).is_some()
    }

    /// Invoked by the platform integration when the event occurs.
    pub fn notify(&self) {
        let listeners = self.listeners.borrow();
        for (_, listener) in listeners.iter() {
            listener();
        }
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

pub type FocusSignal = Broadcaster;
pub type OnlineSignal = Broadcaster;

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn notifies_all_subscribers() {
        let broadcaster = Broadcaster::new();
        let a = Rc::new(Cell::new(0));
        let b = Rc::new(Cell::new(0));
        let (ac, bc) = (a.clone(), b.clone());
        broadcaster.subscribe(move || ac.set(ac.get() + 1));
        broadcaster.subscribe(move || bc.set(bc.get() + 1));

        broadcaster.notify();
        assert_eq!(a.get(), 1);
        assert_eq!(b.get(), 1);
    }

    #[test]
    fn unsubscribed_listener_is_not_notified() {
        let broadcaster = Broadcaster::new();
        let calls = Rc::new(Cell::new(0));
        let calls_clone = calls.clone();
        let key = broadcaster.subscribe(move || calls_clone.set(calls_clone.get() + 1));
        broadcaster.unsubscribe(key);

        broadcaster.notify();
        assert_eq!(calls.get(), 0);
    }
}
