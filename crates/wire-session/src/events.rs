//! Typed pub/sub event surface exposed to the router: `message`,
//! `sessionStatus`, `sessionTransition`, `protocolError`, `transportStatus`.
//!
//! Listener order is insertion order. A listener added *during* a dispatch
//! does not fire within that same dispatch; a listener removed during a
//! dispatch takes effect immediately, even mid-dispatch, if it has not yet
//! run. This is implemented by snapshotting the listener set at dispatch
//! start and consulting the live set before invoking each one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use wire_protocol::TransportMessage;

use crate::error::ProtocolError;

/// The six FSM state names, used in `sessionTransition` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateName {
    NoConnection,
    BackingOff,
    Connecting,
    Handshaking,
    Connected,
    WaitingForHandshake,
}

impl From<crate::session::StateName> for SessionStateName {
    fn from(name: crate::session::StateName) -> Self {
        match name {
            crate::session::StateName::NoConnection => SessionStateName::NoConnection,
            crate::session::StateName::BackingOff => SessionStateName::BackingOff,
            crate::session::StateName::Connecting => SessionStateName::Connecting,
            crate::session::StateName::Handshaking => SessionStateName::Handshaking,
            crate::session::StateName::Connected => SessionStateName::Connected,
            crate::session::StateName::WaitingForHandshake => {
                SessionStateName::WaitingForHandshake
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatusKind {
    Created,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatusKind {
    Open,
    Closed,
    Destroyed,
}

#[derive(Debug, Clone)]
pub struct SessionStatusEvent {
    pub status: SessionStatusKind,
    pub session_id: String,
    pub peer: String,
}

#[derive(Debug, Clone)]
pub struct SessionTransitionEvent {
    pub state: SessionStateName,
    pub id: String,
}

/// One event surfaced through the dispatcher. Mirrors spec §4.8 exactly.
#[derive(Debug, Clone)]
pub enum Event {
    Message(TransportMessage),
    SessionStatus(SessionStatusEvent),
    SessionTransition(SessionTransitionEvent),
    ProtocolError(ProtocolError),
    TransportStatus(TransportStatusKind),
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Slot {
    id: ListenerId,
    listener: Listener,
}

/// Insertion-ordered, dispatch-safe pub/sub for [`Event`].
pub struct EventDispatcher {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registers a listener, returning an id that can later be passed to
    /// [`EventDispatcher::off`].
    pub fn on(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.slots.lock().unwrap().push(Slot {
            id,
            listener: Arc::new(listener),
        });
        id
    }

    /// Removes a listener. Safe to call from inside a dispatch — it takes
    /// effect immediately, even for the dispatch currently in progress.
    pub fn off(&self, id: ListenerId) {
        self.slots.lock().unwrap().retain(|slot| slot.id != id);
    }

    /// Dispatches `event` to every listener registered before this call
    /// began, skipping any that were removed (by any caller, including the
    /// listeners themselves) before their turn comes up.
    pub fn dispatch(&self, event: Event) {
        let snapshot: Vec<Slot> = {
            let slots = self.slots.lock().unwrap();
            slots
                .iter()
                .map(|s| Slot {
                    id: s.id,
                    listener: Arc::clone(&s.listener),
                })
                .collect()
        };
        for slot in snapshot {
            let still_live = self.slots.lock().unwrap().iter().any(|s| s.id == slot.id);
            if still_live {
                (slot.listener)(&event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_in_insertion_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        dispatcher.on(move |_| o1.lock().unwrap().push(1));
        let o2 = Arc::clone(&order);
        dispatcher.on(move |_| o2.lock().unwrap().push(2));
        let o3 = Arc::clone(&order);
        dispatcher.on(move |_| o3.lock().unwrap().push(3));

        dispatcher.dispatch(Event::TransportStatus(TransportStatusKind::Open));
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn listener_added_during_dispatch_does_not_fire_that_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let fired_new = Arc::new(AtomicUsize::new(0));
        let d = Arc::clone(&dispatcher);
        let fired_new_clone = Arc::clone(&fired_new);
        dispatcher.on(move |_| {
            let fired_new_clone = Arc::clone(&fired_new_clone);
            d.on(move |_| {
                fired_new_clone.fetch_add(1, Ordering::SeqCst);
            });
        });

        dispatcher.dispatch(Event::TransportStatus(TransportStatusKind::Open));
        assert_eq!(fired_new.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(Event::TransportStatus(TransportStatusKind::Open));
        assert_eq!(fired_new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_removed_during_dispatch_does_not_fire_again_this_dispatch() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let d = Arc::clone(&dispatcher);
        // Registered first: removes the second listener before it runs.
        let to_remove_id = Arc::new(Mutex::new(None));
        let to_remove_id_writer = Arc::clone(&to_remove_id);
        d.on(move |_| {
            if let Some(id) = *to_remove_id_writer.lock().unwrap() {
                d.off(id);
            }
        });

        let fired_clone = Arc::clone(&fired);
        let id = dispatcher.on(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        *to_remove_id.lock().unwrap() = Some(id);

        dispatcher.dispatch(Event::TransportStatus(TransportStatusKind::Open));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
