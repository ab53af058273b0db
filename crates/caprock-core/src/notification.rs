//! Notification objects
//!
//! A notification is a single word of pending badge bits. Signals OR
//! the signalling capability's badge into the word; a wait drains the
//! whole word at once. Coalescing loses counts, never bits.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::object::ObjectKind;
use crate::rights::CapRights;
use crate::state::KernelState;
use crate::step::Outcome;
use crate::tcb::ExecState;
use crate::types::{Badge, BlockReason, Delivered, KernelError, SchedEffect, SlotRef, ThreadId};

/// Badge accumulator plus the queue of threads waiting on it.
#[derive(Clone, Debug)]
pub struct Notification {
    /// Pending badge bits; `None` while nothing is pending.
    pub pending: Option<Badge>,
    pub waiters: VecDeque<ThreadId>,
}

impl Notification {
    pub fn new() -> Self {
        Self {
            pending: None,
            waiters: VecDeque::new(),
        }
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

/// Fire the notification with the invoked capability's badge. Never
/// blocks: either a waiter absorbs the badge or it coalesces into the
/// pending word.
pub(crate) fn signal(
    state: &mut KernelState,
    slot: SlotRef,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let cap = state.cap_checked(slot, CapRights::WRITE, ObjectKind::Notification)?;
    let badge = cap.badge.unwrap_or(0);
    let ntfn = state.objects.notification_mut(cap.object)?;
    if let Some(waiter) = ntfn.waiters.pop_front() {
        let tcb = state.thread_mut(waiter)?;
        tcb.incoming = Some(Ok(Delivered::signal(badge)));
        tcb.exec = ExecState::Running;
        effects.push(SchedEffect::Wake { tid: waiter });
    } else {
        ntfn.pending = Some(ntfn.pending.unwrap_or(0) | badge);
    }
    Ok(Outcome::Unit)
}

/// Drain the pending word, or park until a signal arrives.
pub(crate) fn wait(
    state: &mut KernelState,
    tid: ThreadId,
    slot: SlotRef,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let cap = state.cap_checked(slot, CapRights::READ, ObjectKind::Notification)?;
    let ntfn = state.objects.notification_mut(cap.object)?;
    if let Some(bits) = ntfn.pending.take() {
        return Ok(Outcome::Badge(bits));
    }
    ntfn.waiters.push_back(tid);
    state.thread_mut(tid)?.exec = ExecState::NotificationBlocked(cap.object);
    effects.push(SchedEffect::Block {
        tid,
        reason: BlockReason::NotificationWait,
    });
    Ok(Outcome::Blocked)
}

/// Non-blocking drain.
pub(crate) fn poll(state: &mut KernelState, slot: SlotRef) -> Result<Outcome, KernelError> {
    let cap = state.cap_checked(slot, CapRights::READ, ObjectKind::Notification)?;
    let ntfn = state.objects.notification_mut(cap.object)?;
    match ntfn.pending.take() {
        Some(bits) => Ok(Outcome::Badge(bits)),
        None => Ok(Outcome::NoMessage),
    }
}
