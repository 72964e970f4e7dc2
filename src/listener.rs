//! The single-slot listener registration through which a host controller
//! receives autonomously paced bytes from a card.
//!
//! The card never owns its listener: the slot holds a `Weak` reference, so
//! a host controller that goes away simply stops receiving (and stops the
//! transmission loop) instead of being kept alive by the card.

use std::rc::{Rc, Weak};

/// Receiver for card-initiated data transmission.
pub trait CardListener {
    /// Deliver one paced run of data-phase bytes. Never called with an
    /// empty slice.
    fn receive(&self, data: &[u8]);
}

#[derive(Default)]
pub(crate) struct ListenerSlot {
    slot: Option<(Weak<dyn CardListener>, usize)>,
}

impl ListenerSlot {
    /// Occupy the slot. Fails (returning `false`) if it is already
    /// occupied: every data-transfer invariant assumes exactly one
    /// consumer.
    pub(crate) fn add(&mut self, listener: &Rc<dyn CardListener>, max_packet: usize) -> bool {
        if self.slot.is_some() {
            return false;
        }
        self.slot = Some((Rc::downgrade(listener), max_packet));
        true
    }

    /// Clear the slot, but only if `listener` is the registered occupant.
    pub(crate) fn remove(&mut self, listener: &Rc<dyn CardListener>) -> bool {
        match &self.slot {
            Some((registered, _)) if Weak::ptr_eq(registered, &Rc::downgrade(listener)) => {
                self.slot = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn is_occupied(&self) -> bool {
        self.slot.is_some()
    }

    /// Upgrade the occupant for one delivery. `None` either means the slot
    /// is free or the listener was dropped behind our back.
    pub(crate) fn get(&self) -> Option<(Rc<dyn CardListener>, usize)> {
        let (listener, max_packet) = self.slot.as_ref()?;
        listener.upgrade().map(|l| (l, *max_packet))
    }
}

#[cfg(test)]
struct Sink;

#[cfg(test)]
impl CardListener for Sink {
    fn receive(&self, _data: &[u8]) {}
}

#[test]
fn test_slot_rejects_second_listener() {
    let a: Rc<dyn CardListener> = Rc::new(Sink);
    let b: Rc<dyn CardListener> = Rc::new(Sink);
    let mut slot = ListenerSlot::default();
    assert!(slot.add(&a, 64));
    assert!(!slot.add(&b, 64));
    // Removal validates the handle.
    assert!(!slot.remove(&b));
    assert!(slot.remove(&a));
    assert!(slot.add(&b, 64));
}

#[test]
fn test_dropped_listener_reads_empty() {
    let mut slot = ListenerSlot::default();
    {
        let a: Rc<dyn CardListener> = Rc::new(Sink);
        assert!(slot.add(&a, 64));
        assert!(slot.get().is_some());
    }
    assert!(slot.is_occupied());
    assert!(slot.get().is_none());
}
