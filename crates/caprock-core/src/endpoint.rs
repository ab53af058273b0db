//! Rendezvous endpoints
//!
//! Endpoints hold no messages. A send with no receiver parks the
//! sender with its message staged in its own TCB; a receive with no
//! sender parks the receiver. Either arrival completes the rendezvous
//! immediately, so at most one of the two queues is ever non-empty.
//!
//! Call is send plus a kernel-minted single-use reply object; the
//! receiver comes out of the rendezvous holding it, and firing it
//! wakes exactly the caller it was minted for.

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::cspace::{Capability, DerivId};
use crate::object::ObjectKind;
use crate::rights::CapRights;
use crate::state::KernelState;
use crate::step::Outcome;
use crate::tcb::{ExecState, Outgoing};
use crate::types::{
    Badge, BlockReason, Delivered, KernelError, Message, ObjRef, SchedEffect, SlotRef, ThreadId,
    MSG_MAX_CAPS,
};

/// Rendezvous point. Both queues are FIFO; the rendezvous discipline
/// keeps at least one of them empty at every step boundary.
#[derive(Clone, Debug)]
pub struct Endpoint {
    pub send_queue: VecDeque<ThreadId>,
    pub recv_queue: VecDeque<ThreadId>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self {
            send_queue: VecDeque::new(),
            recv_queue: VecDeque::new(),
        }
    }
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a pending reply object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplyRef(pub u32);

/// A minted reply obligation: who to wake, and whether the original
/// message was a kernel-synthesised fault.
#[derive(Clone, Copy, Debug)]
pub struct ReplyEntry {
    pub caller: ThreadId,
    pub fault: bool,
}

/// Live reply objects. An entry exists exactly while some caller is
/// reply-blocked; consuming or invalidating it removes the entry, so
/// a stale [`ReplyRef`] simply fails to resolve.
#[derive(Debug)]
pub struct ReplyTable {
    entries: Vec<Option<ReplyEntry>>,
    free: Vec<u32>,
}

impl ReplyTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self, caller: ThreadId, fault: bool) -> ReplyRef {
        let entry = ReplyEntry { caller, fault };
        match self.free.pop() {
            Some(i) => {
                self.entries[i as usize] = Some(entry);
                ReplyRef(i)
            }
            None => {
                self.entries.push(Some(entry));
                ReplyRef((self.entries.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, r: ReplyRef) -> Option<&ReplyEntry> {
        self.entries.get(r.0 as usize).and_then(|e| e.as_ref())
    }

    pub fn remove(&mut self, r: ReplyRef) -> Option<ReplyEntry> {
        let entry = self.entries.get_mut(r.0 as usize)?.take()?;
        self.free.push(r.0);
        Some(entry)
    }

    /// Invalidate every reply obligation owed to `caller`. Used when
    /// the caller dies or is suspended out of its wait.
    pub fn remove_by_caller(&mut self, caller: ThreadId) {
        for i in 0..self.entries.len() {
            if self.entries[i].map(|e| e.caller) == Some(caller) {
                self.entries[i] = None;
                self.free.push(i as u32);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ReplyTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Capability transfer
// ============================================================================

/// Resolve a message's attached capability slots against the sender's
/// CSpace. Without Grant on the endpoint capability the attachments
/// are stripped rather than rejected.
fn resolve_transfer_caps(
    state: &KernelState,
    msg: &Message,
    grant: bool,
) -> Result<Vec<(Capability, DerivId)>, KernelError> {
    if !grant {
        return Ok(Vec::new());
    }
    let mut caps = Vec::with_capacity(msg.cap_slots.len());
    for &slot in &msg.cap_slots {
        let cap = state.lookup_cap(slot)?;
        let node = cap.node;
        caps.push((cap, node));
    }
    Ok(caps)
}

/// Install transferred capabilities into the receiver's slots, pairing
/// them up in order. Anything undeliverable (no slot left, slot now
/// occupied, source revoked mid-wait) is dropped, not an error.
fn transfer_caps(
    state: &mut KernelState,
    caps: Vec<(Capability, DerivId)>,
    slots: &[SlotRef],
) -> usize {
    let mut transferred = 0;
    for (i, (cap, node)) in caps.into_iter().enumerate() {
        let slot = match slots.get(i) {
            Some(&s) => s,
            None => break,
        };
        if !state.derivs.contains(node) || !state.objects.contains(cap.object) {
            continue;
        }
        if state
            .install_cap(slot, cap.object, cap.rights, cap.badge, Some(node))
            .is_ok()
        {
            transferred += 1;
        }
    }
    transferred
}

// ============================================================================
// Send / Call
// ============================================================================

pub(crate) fn send(
    state: &mut KernelState,
    tid: ThreadId,
    ep_slot: SlotRef,
    msg: Message,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    send_inner(state, tid, ep_slot, msg, false, effects)
}

pub(crate) fn call(
    state: &mut KernelState,
    tid: ThreadId,
    ep_slot: SlotRef,
    msg: Message,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    send_inner(state, tid, ep_slot, msg, true, effects)
}

fn send_inner(
    state: &mut KernelState,
    tid: ThreadId,
    ep_slot: SlotRef,
    msg: Message,
    is_call: bool,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    if !msg.within_limits() {
        return Err(KernelError::InvalidArgument);
    }
    let cap = state.cap_checked(ep_slot, CapRights::WRITE, ObjectKind::Endpoint)?;
    let caps = resolve_transfer_caps(state, &msg, cap.rights.contains(CapRights::GRANT))?;
    let badge = cap.badge.unwrap_or(0);
    send_resolved(state, tid, cap.object, msg, badge, caps, is_call, false, effects)
}

/// Rendezvous entry for an already-resolved endpoint. The fault path
/// comes in here directly with the handler capability's badge.
#[allow(clippy::too_many_arguments)]
pub(crate) fn send_resolved(
    state: &mut KernelState,
    tid: ThreadId,
    ep_obj: ObjRef,
    msg: Message,
    badge: Badge,
    caps: Vec<(Capability, DerivId)>,
    is_call: bool,
    is_fault: bool,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let ep = state.objects.endpoint_mut(ep_obj)?;
    if let Some(receiver) = ep.recv_queue.pop_front() {
        // Receiver is waiting: complete the rendezvous now.
        let slots = core::mem::take(&mut state.thread_mut(receiver)?.recv_slots);
        let transferred = transfer_caps(state, caps, &slots);
        let rtcb = state.thread_mut(receiver)?;
        rtcb.incoming = Some(Ok(Delivered {
            msg,
            badge,
            transferred,
        }));
        rtcb.exec = ExecState::Running;
        effects.push(SchedEffect::Wake { tid: receiver });
        if is_call {
            grant_reply(state, tid, receiver, is_fault);
            state.thread_mut(tid)?.exec = ExecState::ReplyBlocked;
            effects.push(SchedEffect::Block {
                tid,
                reason: if is_fault {
                    BlockReason::FaultWait
                } else {
                    BlockReason::ReplyWait
                },
            });
            Ok(Outcome::Blocked)
        } else {
            Ok(Outcome::Unit)
        }
    } else {
        // No receiver: stage the message and park.
        ep.send_queue.push_back(tid);
        let tcb = state.thread_mut(tid)?;
        tcb.outgoing = Some(Outgoing {
            msg,
            badge,
            caps,
            call: is_call,
            fault: is_fault,
        });
        tcb.exec = if is_call {
            ExecState::CallBlocked(ep_obj)
        } else {
            ExecState::SendBlocked(ep_obj)
        };
        effects.push(SchedEffect::Block {
            tid,
            reason: BlockReason::SendWait,
        });
        Ok(Outcome::Blocked)
    }
}

/// Mint a reply object for `caller` and hand it to `receiver`,
/// discarding any reply object the receiver still held.
fn grant_reply(state: &mut KernelState, caller: ThreadId, receiver: ThreadId, fault: bool) {
    let r = state.replies.insert(caller, fault);
    if let Ok(rtcb) = state.thread_mut(receiver) {
        if let Some(old) = rtcb.reply.replace(r) {
            state.replies.remove(old);
        }
    }
}

// ============================================================================
// Recv
// ============================================================================

pub(crate) fn recv(
    state: &mut KernelState,
    tid: ThreadId,
    ep_slot: SlotRef,
    recv_slots: Vec<SlotRef>,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    if recv_slots.len() > MSG_MAX_CAPS {
        return Err(KernelError::InvalidArgument);
    }
    let cap = state.cap_checked(ep_slot, CapRights::READ, ObjectKind::Endpoint)?;
    let ep = state.objects.endpoint_mut(cap.object)?;
    if let Some(sender) = ep.send_queue.pop_front() {
        // Sender is waiting: take its staged message.
        let out = state
            .thread_mut(sender)?
            .outgoing
            .take()
            .ok_or(KernelError::InvalidCapability)?;
        let transferred = transfer_caps(state, out.caps, &recv_slots);
        if out.call {
            grant_reply(state, sender, tid, out.fault);
            state.thread_mut(sender)?.exec = ExecState::ReplyBlocked;
        } else {
            let stcb = state.thread_mut(sender)?;
            stcb.incoming = Some(Ok(Delivered::ack()));
            stcb.exec = ExecState::Running;
            effects.push(SchedEffect::Wake { tid: sender });
        }
        Ok(Outcome::Delivered(Delivered {
            msg: out.msg,
            badge: out.badge,
            transferred,
        }))
    } else {
        // No sender: park with the receive slots staged.
        ep.recv_queue.push_back(tid);
        let tcb = state.thread_mut(tid)?;
        tcb.recv_slots = recv_slots;
        tcb.exec = ExecState::RecvBlocked(cap.object);
        effects.push(SchedEffect::Block {
            tid,
            reason: BlockReason::RecvWait,
        });
        Ok(Outcome::Blocked)
    }
}

// ============================================================================
// Reply
// ============================================================================

/// Fire the reply object held by `tid`, waking exactly the caller it
/// was minted for. Single use: the object is consumed either way.
pub(crate) fn reply(
    state: &mut KernelState,
    tid: ThreadId,
    msg: Message,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    if !msg.within_limits() || !msg.cap_slots.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    let r = state
        .thread_mut(tid)?
        .reply
        .take()
        .ok_or(KernelError::InvalidCapability)?;
    let entry = state.replies.remove(r).ok_or(KernelError::InvalidCapability)?;
    let caller = entry.caller;
    let ctcb = match state.thread_mut(caller) {
        Ok(t) if t.exec == ExecState::ReplyBlocked => t,
        _ => return Err(KernelError::InvalidCapability),
    };
    if entry.fault {
        // Fault replies carry the resume address in the first word.
        if let Some(&pc) = msg.words.first() {
            ctcb.registers.pc = pc;
        }
    }
    ctcb.incoming = Some(Ok(Delivered {
        msg,
        badge: 0,
        transferred: 0,
    }));
    ctcb.exec = ExecState::Running;
    effects.push(SchedEffect::Wake { tid: caller });
    Ok(Outcome::Unit)
}

/// Reply to the held reply object (if any), then receive on the
/// endpoint in one step. The server idiom: the window in which the
/// server holds neither a request nor a wait never opens.
pub(crate) fn reply_recv(
    state: &mut KernelState,
    tid: ThreadId,
    ep_slot: SlotRef,
    msg: Message,
    recv_slots: Vec<SlotRef>,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    // Validate the reply message before touching the reply object, so
    // a malformed reply never half-completes the pair.
    if !msg.within_limits() || !msg.cap_slots.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    if state.thread(tid)?.reply.is_some() {
        match reply(state, tid, msg, effects) {
            Ok(_) => {}
            // A caller that died mid-wait leaves a stale reply object;
            // that is not the receiver's problem.
            Err(KernelError::InvalidCapability) => {}
            Err(e) => return Err(e),
        }
    }
    recv(state, tid, ep_slot, recv_slots, effects)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_table_insert_remove() {
        let mut table = ReplyTable::new();
        let a = table.insert(ThreadId(1), false);
        let b = table.insert(ThreadId(2), true);

        assert_eq!(table.get(a).unwrap().caller, ThreadId(1));
        assert!(table.get(b).unwrap().fault);
        assert!(table.remove(a).is_some());
        // Single use: a second resolve fails.
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reply_table_remove_by_caller() {
        let mut table = ReplyTable::new();
        table.insert(ThreadId(7), false);
        let keep = table.insert(ThreadId(8), false);

        table.remove_by_caller(ThreadId(7));

        assert_eq!(table.len(), 1);
        assert!(table.get(keep).is_some());
    }

    #[test]
    fn test_reply_ref_reuse_invalidates_stale_handles() {
        let mut table = ReplyTable::new();
        let a = table.insert(ThreadId(1), false);
        table.remove(a);
        let b = table.insert(ThreadId(2), false);

        // Index reuse means the stale handle now names the new entry's
        // slot; callers must treat a consumed ReplyRef as dead.
        assert_eq!(a, b);
        assert_eq!(table.get(b).unwrap().caller, ThreadId(2));
    }
}
