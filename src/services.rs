//! Consumed simulation services: the fire-once timer and the bus clock.
//!
//! The card model never blocks; anything time-delayed is a single scheduled
//! re-invocation of [`crate::card::Card::timer_due`]. The embedding
//! simulator supplies both services; [`ManualTimer`] and [`FixedClock`] are
//! simple deterministic implementations for tests and the demo binary.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A fire-once timer slot allocated to one card.
///
/// `schedule` arms (or re-arms) the slot; when the simulated delay elapses
/// the embedder calls back into the card.
pub trait TimerService {
    fn schedule(&mut self, delay_ns: u64);
    fn cancel(&mut self);
    fn is_pending(&self) -> bool;
}

/// Read-only view of the simulated clock tree.
pub trait SimClock {
    /// Current derived bus-clock frequency in Hz.
    fn frequency(&self) -> u64;
    /// Simulated microseconds elapsed since power-on.
    fn elapsed_us(&self) -> u64;
}

/// A timer that records the armed delay and leaves firing to the driver.
#[derive(Default)]
pub struct ManualTimer {
    armed: Option<u64>,
}

impl ManualTimer {
    pub fn new() -> Rc<RefCell<ManualTimer>> {
        Rc::new(RefCell::new(ManualTimer::default()))
    }

    /// Take the armed delay, disarming the timer. The driver then calls
    /// `Card::timer_due`.
    pub fn take(&mut self) -> Option<u64> {
        self.armed.take()
    }
}

impl TimerService for Rc<RefCell<ManualTimer>> {
    fn schedule(&mut self, delay_ns: u64) {
        self.borrow_mut().armed = Some(delay_ns);
    }

    fn cancel(&mut self) {
        self.borrow_mut().armed = None;
    }

    fn is_pending(&self) -> bool {
        self.borrow().armed.is_some()
    }
}

/// A clock with a fixed bus frequency and manually advanced time.
pub struct FixedClock {
    frequency: u64,
    now_us: Cell<u64>,
}

impl FixedClock {
    pub fn new(frequency: u64) -> Rc<FixedClock> {
        Rc::new(FixedClock { frequency, now_us: Cell::new(0) })
    }

    pub fn advance_us(&self, us: u64) {
        self.now_us.set(self.now_us.get() + us);
    }
}

impl SimClock for FixedClock {
    fn frequency(&self) -> u64 {
        self.frequency
    }

    fn elapsed_us(&self) -> u64 {
        self.now_us.get()
    }
}

#[test]
fn test_manual_timer_arms_once() {
    let timer = ManualTimer::new();
    let mut handle = timer.clone();
    assert!(!handle.is_pending());
    handle.schedule(1000);
    assert!(handle.is_pending());
    assert_eq!(timer.borrow_mut().take(), Some(1000));
    assert!(!handle.is_pending());
}
