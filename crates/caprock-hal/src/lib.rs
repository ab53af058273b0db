//! Platform collaborator trait for the Caprock kernel core
//!
//! The kernel core performs no scheduling, no I/O and no frame
//! construction of its own. Everything platform-shaped sits behind the
//! [`Platform`] trait defined here: the scheduler's blocking contract,
//! monotonic time, the debug output channel, and initial register frame
//! construction for new execution contexts.
//!
//! Implementations range from a host-test recorder ([`TestPlatform`])
//! to a real scheduler/loader pair on target hardware.

#![no_std]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

/// Why a thread is being parked by the kernel.
///
/// Forwarded verbatim to the scheduler; the scheduler never needs to
/// interpret it beyond bookkeeping, since the kernel always issues the
/// matching [`Platform::wake`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// Queued on an endpoint's sender queue.
    SendWait,
    /// Queued on an endpoint's receiver queue.
    RecvWait,
    /// Rendezvous complete, waiting for the paired reply.
    ReplyWait,
    /// Queued on a notification's waiter queue.
    NotificationWait,
    /// Fault delivered, waiting for the handler's reply.
    FaultWait,
    /// Explicitly suspended.
    Suspended,
}

/// Initial register frame for a new execution context.
///
/// The kernel never constructs frames itself; the platform's image
/// loader decides what a runnable entry point looks like.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Frame {
    /// Entry program counter.
    pub pc: u64,
    /// Initial stack pointer.
    pub sp: u64,
}

/// Platform collaborator trait.
///
/// Implementations provide:
/// - the scheduler blocking contract (`block` / `wake`)
/// - priority and lifecycle notifications
/// - monotonic time
/// - a debug output channel
/// - initial frame construction for new execution contexts
pub trait Platform: Send + Sync + 'static {
    // === Scheduler contract ===

    /// Park a thread. The kernel guarantees a later `wake` (or
    /// `thread_exited`) for every `block`.
    fn block(&self, tid: u64, reason: BlockReason);

    /// Make a previously blocked (or newly resumed) thread runnable.
    fn wake(&self, tid: u64);

    /// Record a priority change. Priority never affects kernel queue
    /// order; it only informs the scheduler's pick of the next runnable
    /// thread.
    fn set_priority(&self, tid: u64, priority: u8);

    /// A thread is gone for good (terminated or destroyed).
    fn thread_exited(&self, tid: u64);

    // === Time ===

    /// Monotonic time in nanoseconds.
    fn now_nanos(&self) -> u64;

    // === Debug ===

    /// Write a debug message to the platform's console/log.
    fn debug_write(&self, msg: &str);

    // === Image loader ===

    /// Build the initial register frame for a new execution context.
    fn build_frame(&self, entry: u64, stack_top: u64) -> Frame {
        Frame {
            pc: entry,
            sp: stack_top,
        }
    }
}

/// Scheduler events recorded by [`TestPlatform`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedEvent {
    /// `block(tid, reason)` was called.
    Blocked(u64, BlockReason),
    /// `wake(tid)` was called.
    Woken(u64),
    /// `set_priority(tid, prio)` was called.
    Priority(u64, u8),
    /// `thread_exited(tid)` was called.
    Exited(u64),
}

/// Recording platform for tests.
///
/// Captures every scheduler event and debug line so tests can assert
/// on the exact block/wake traffic an operation produced.
pub struct TestPlatform {
    time: AtomicU64,
    events: RefCell<Vec<SchedEvent>>,
    debug_log: RefCell<Vec<String>>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            events: RefCell::new(Vec::new()),
            debug_log: RefCell::new(Vec::new()),
        }
    }

    /// Advance the fake clock.
    pub fn advance(&self, nanos: u64) {
        self.time.fetch_add(nanos, Ordering::SeqCst);
    }

    /// All recorded scheduler events, in order.
    pub fn events(&self) -> Vec<SchedEvent> {
        self.events.borrow().clone()
    }

    /// Drop recorded events (keeps the clock).
    pub fn clear_events(&self) {
        self.events.borrow_mut().clear();
    }

    /// All recorded debug lines.
    pub fn debug_log(&self) -> Vec<String> {
        self.debug_log.borrow().clone()
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}

// Test-only single-threaded use.
unsafe impl Send for TestPlatform {}
unsafe impl Sync for TestPlatform {}

impl Platform for TestPlatform {
    fn block(&self, tid: u64, reason: BlockReason) {
        self.events.borrow_mut().push(SchedEvent::Blocked(tid, reason));
    }

    fn wake(&self, tid: u64) {
        self.events.borrow_mut().push(SchedEvent::Woken(tid));
    }

    fn set_priority(&self, tid: u64, priority: u8) {
        self.events
            .borrow_mut()
            .push(SchedEvent::Priority(tid, priority));
    }

    fn thread_exited(&self, tid: u64) {
        self.events.borrow_mut().push(SchedEvent::Exited(tid));
    }

    fn now_nanos(&self) -> u64 {
        self.time.load(Ordering::SeqCst)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(String::from(msg));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_test_platform_records_events() {
        let p = TestPlatform::new();
        p.block(1, BlockReason::RecvWait);
        p.wake(1);
        p.set_priority(2, 7);
        p.thread_exited(3);

        assert_eq!(
            p.events(),
            alloc::vec![
                SchedEvent::Blocked(1, BlockReason::RecvWait),
                SchedEvent::Woken(1),
                SchedEvent::Priority(2, 7),
                SchedEvent::Exited(3),
            ]
        );
    }

    #[test]
    fn test_test_platform_clock() {
        let p = TestPlatform::new();
        assert_eq!(p.now_nanos(), 0);
        p.advance(1500);
        assert_eq!(p.now_nanos(), 1500);
    }

    #[test]
    fn test_default_frame_builder() {
        let p = TestPlatform::new();
        let frame = p.build_frame(0x1000, 0x8000);
        assert_eq!(frame.pc, 0x1000);
        assert_eq!(frame.sp, 0x8000);
    }

    #[test]
    fn test_debug_log_captured() {
        let p = TestPlatform::new();
        p.debug_write("hello");
        p.debug_write("world");
        assert_eq!(p.debug_log().len(), 2);
        assert_eq!(p.debug_log()[0], "hello");
    }
}
