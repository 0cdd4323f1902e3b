//! Clocked-register simulation primitives.
//!
//! The whole design follows the two-process pattern: every clocked component
//! keeps a *current* register bank `r` and a *next* bank `v`. Combinational
//! evaluation recomputes `v` and the module outputs from `r` and the inputs;
//! the clock edge then publishes `r <- v` atomically across the design.
//!
//! `Signal<T>` is the single-register version of the same idea, used for
//! standalone wires that need one tick of delay (interrupt lines, handshake
//! latches). Reads always observe the committed value; writes only stage the
//! pending one.

/// A clocked signal: a current value plus a staged next value.
///
/// Invariant: reads during a tick observe the value committed at the previous
/// clock edge; `set` only alters the pending value until `commit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signal<T: Copy> {
    cur: T,
    nxt: T,
    rst: T,
}

impl<T: Copy> Signal<T> {
    /// Create a signal holding `reset` as both the current and reset value.
    pub fn new(reset: T) -> Self {
        Self { cur: reset, nxt: reset, rst: reset }
    }

    /// Current (committed) value.
    #[inline]
    pub fn get(&self) -> T {
        self.cur
    }

    /// Stage the value to be committed at the next clock edge.
    #[inline]
    pub fn set(&mut self, value: T) {
        self.nxt = value;
    }

    /// Publish the staged value.
    #[inline]
    pub fn commit(&mut self) {
        self.cur = self.nxt;
    }

    /// Force both values back to the reset value.
    pub fn reset(&mut self) {
        self.cur = self.rst;
        self.nxt = self.rst;
    }
}

impl<T: Copy + Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Reset flavor applied to the register banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Registers hold their reset value for as long as `nrst` is low.
    Asynchronous,
    /// Registers load their reset value at the next rising edge.
    Synchronous,
}

/// Why a `run` loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested tick count elapsed.
    TickLimit,
    /// A halt-access-point predicate fired (e.g. hart halted).
    Hap,
    /// The external shutdown flag was observed.
    Shutdown,
}

/// Callback invoked after the register commit of a tick.
///
/// The argument is the tick number that just committed. Returning `true`
/// keeps the callback registered for the following tick.
pub type StepCallback = Box<dyn FnMut(u64) -> bool>;

/// Ordered list of step callbacks, run after each commit in registration
/// order. A callback reschedules itself by returning `true`.
#[derive(Default)]
pub struct StepQueue {
    callbacks: Vec<StepCallback>,
}

impl StepQueue {
    pub fn new() -> Self {
        Self { callbacks: Vec::new() }
    }

    /// Register a callback for the end of the current/next tick.
    pub fn register(&mut self, cb: StepCallback) {
        self.callbacks.push(cb);
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Run every callback once for tick `tick`, dropping the ones that do
    /// not reschedule themselves.
    pub fn dispatch(&mut self, tick: u64) {
        let mut kept = Vec::with_capacity(self.callbacks.len());
        for mut cb in self.callbacks.drain(..) {
            if cb(tick) {
                kept.push(cb);
            }
        }
        self.callbacks = kept;
    }
}

impl std::fmt::Debug for StepQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepQueue")
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_read_during_tick() {
        let mut s = Signal::new(0u32);
        s.set(5);
        // Write only alters the next value
        assert_eq!(s.get(), 0);
        s.commit();
        assert_eq!(s.get(), 5);
    }

    #[test]
    fn test_signal_reset() {
        let mut s = Signal::new(7u8);
        s.set(1);
        s.commit();
        s.reset();
        assert_eq!(s.get(), 7);
        s.commit();
        assert_eq!(s.get(), 7);
    }

    #[test]
    fn test_step_queue_order_and_reschedule() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let order = Rc::new(RefCell::new(Vec::new()));
        let mut q = StepQueue::new();

        let o1 = order.clone();
        q.register(Box::new(move |t| {
            o1.borrow_mut().push((1, t));
            false
        }));
        let o2 = order.clone();
        q.register(Box::new(move |t| {
            o2.borrow_mut().push((2, t));
            t < 1 // reschedule once
        }));

        q.dispatch(0);
        q.dispatch(1);
        q.dispatch(2);

        assert_eq!(*order.borrow(), vec![(1, 0), (2, 0), (2, 1)]);
        assert!(q.is_empty());
    }
}
