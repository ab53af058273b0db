//! Kernel state and object lifecycle
//!
//! [`KernelState`] owns the three arenas (objects, derivation tree,
//! reply table) and the slot-level primitives every operation builds
//! on. Object teardown also lives here: Delete and Revoke, plus the
//! destruction cascade that releases IPC waiters and recursively
//! empties destroyed CNodes.

use alloc::vec::Vec;

use crate::cspace::{Capability, DerivId, DerivTree};
use crate::endpoint::ReplyTable;
use crate::object::{KernelObject, ObjectKind, ObjectTable};
use crate::rights::CapRights;
use crate::step::Outcome;
use crate::tcb::{ExecState, Tcb};
use crate::types::{Badge, KernelError, ObjRef, SchedEffect, SlotRef, ThreadId};

/// The whole kernel, as one owned value.
#[derive(Debug)]
pub struct KernelState {
    pub objects: ObjectTable,
    pub derivs: DerivTree,
    pub replies: ReplyTable,
}

impl KernelState {
    pub fn new() -> Self {
        Self {
            objects: ObjectTable::new(),
            derivs: DerivTree::new(),
            replies: ReplyTable::new(),
        }
    }

    /// Resolve a slot to the capability it holds.
    pub fn lookup_cap(&self, slot: SlotRef) -> Result<Capability, KernelError> {
        self.objects
            .cnode(slot.cnode)?
            .get(slot.index)?
            .clone()
            .ok_or(KernelError::FailedLookup)
    }

    /// Resolve a slot and check kind and rights in one step.
    ///
    /// A resolvable capability of the wrong kind or with missing
    /// rights is `InvalidCapability`; an empty or unresolvable slot
    /// is `FailedLookup`.
    pub fn cap_checked(
        &self,
        slot: SlotRef,
        required: CapRights,
        expected: ObjectKind,
    ) -> Result<Capability, KernelError> {
        let cap = self.lookup_cap(slot)?;
        if self.objects.kind(cap.object) != Some(expected) {
            return Err(KernelError::InvalidCapability);
        }
        if !cap.rights.contains(required) {
            return Err(KernelError::InvalidCapability);
        }
        Ok(cap)
    }

    /// True if the slot resolves and holds nothing.
    pub fn slot_is_empty(&self, slot: SlotRef) -> Result<bool, KernelError> {
        Ok(self.objects.cnode(slot.cnode)?.get(slot.index)?.is_none())
    }

    /// Write a fresh capability into an empty slot, creating its
    /// derivation node under `parent` and counting the slot reference.
    ///
    /// With `parent: None` this forges a derivation root. Only boot
    /// code may do that; everything after boot derives from an
    /// existing capability.
    pub fn install_cap(
        &mut self,
        slot: SlotRef,
        object: ObjRef,
        rights: CapRights,
        badge: Option<Badge>,
        parent: Option<DerivId>,
    ) -> Result<DerivId, KernelError> {
        if !self.slot_is_empty(slot)? {
            return Err(KernelError::SlotInUse);
        }
        let node = self.derivs.insert(parent, slot, object);
        let dest = self.objects.cnode_mut(slot.cnode)?.get_mut(slot.index)?;
        *dest = Some(Capability {
            object,
            rights,
            badge,
            node,
        });
        self.objects.inc_refs(object);
        Ok(node)
    }

    pub fn thread(&self, tid: ThreadId) -> Result<&Tcb, KernelError> {
        self.objects.tcb(tid.obj_ref())
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> Result<&mut Tcb, KernelError> {
        self.objects.tcb_mut(tid.obj_ref())
    }
}

impl Default for KernelState {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Delete and Revoke
// ============================================================================

/// Remove the capability in `slot`, splicing its derivation node.
///
/// Destroying the final capability to an Untyped that still has live
/// retyped children is refused with `RevokeFirst`: the children's
/// parent reference must never dangle.
pub(crate) fn cap_delete(
    state: &mut KernelState,
    slot: SlotRef,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let cap = state.lookup_cap(slot)?;
    if let Some(entry) = state.objects.get(cap.object) {
        if entry.slot_refs == 1
            && !entry.children.is_empty()
            && matches!(entry.object, KernelObject::Untyped(_))
        {
            return Err(KernelError::RevokeFirst);
        }
    }
    let taken = state
        .objects
        .cnode_mut(slot.cnode)?
        .get_mut(slot.index)?
        .take()
        .ok_or(KernelError::FailedLookup)?;
    state.derivs.remove_splice(taken.node);
    release_object_ref(state, taken.object, effects);
    Ok(Outcome::Unit)
}

/// Delete every descendant of the capability in `slot`, deepest first.
/// The invoked capability itself survives. Idempotent on a leaf.
pub(crate) fn cap_revoke(
    state: &mut KernelState,
    slot: SlotRef,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let cap = state.lookup_cap(slot)?;
    revoke_node(state, cap.node, effects);
    Ok(Outcome::Unit)
}

/// Delete all proper descendants of `node` from the derivation tree,
/// clearing their slots and destroying objects that lose their last
/// reference.
pub(crate) fn revoke_node(state: &mut KernelState, node: DerivId, effects: &mut Vec<SchedEffect>) {
    for id in state.derivs.descendants_post_order(node) {
        let (nslot, nobj) = match state.derivs.get(id) {
            Some(n) => (n.slot, n.object),
            // Already torn down by a destruction cascade underneath us.
            None => continue,
        };
        // Clear the slot if it still resolves; the slot's CNode may
        // itself be mid-destruction.
        if let Ok(cnode) = state.objects.cnode_mut(nslot.cnode) {
            if let Ok(s) = cnode.get_mut(nslot.index) {
                if s.as_ref().map(|c| c.node) == Some(id) {
                    *s = None;
                }
            }
        }
        state.derivs.remove_leaf(id);
        release_object_ref(state, nobj, effects);
    }
}

/// Drop one slot reference to `obj`, destroying it on the last one.
fn release_object_ref(state: &mut KernelState, obj: ObjRef, effects: &mut Vec<SchedEffect>) {
    if state.objects.dec_refs(obj) == 0 && state.objects.contains(obj) {
        destroy_object(state, obj, effects);
    }
}

// ============================================================================
// Destruction cascade
// ============================================================================

/// Release a thread parked in IPC with `ObjectDestroyed`.
pub(crate) fn abort_waiter(state: &mut KernelState, tid: ThreadId, effects: &mut Vec<SchedEffect>) {
    if let Ok(tcb) = state.objects.tcb_mut(tid.obj_ref()) {
        tcb.incoming = Some(Err(KernelError::ObjectDestroyed));
        tcb.outgoing = None;
        tcb.exec = ExecState::Running;
        effects.push(SchedEffect::Wake { tid });
    }
}

/// Kill a live thread in place: unhook it from any queue, release a
/// caller stranded on its reply object, and mark it terminated. The
/// TCB object itself stays allocated until its capabilities go.
pub(crate) fn terminate_thread(
    state: &mut KernelState,
    tid: ThreadId,
    effects: &mut Vec<SchedEffect>,
) {
    crate::tcb::detach_from_wait(state, tid);
    let reply = match state.thread_mut(tid) {
        Ok(t) => t.reply.take(),
        Err(_) => return,
    };
    if let Some(r) = reply {
        if let Some(entry) = state.replies.remove(r) {
            abort_waiter(state, entry.caller, effects);
        }
    }
    if let Ok(t) = state.thread_mut(tid) {
        t.exec = ExecState::Terminated;
        t.incoming = None;
        t.outgoing = None;
    }
    effects.push(SchedEffect::Killed { tid });
}

/// Tear an object out of the table once its last capability is gone.
///
/// Endpoints and notifications release their waiters, a TCB kills its
/// thread, and a CNode recursively deletes every capability it holds.
pub(crate) fn destroy_object(state: &mut KernelState, obj: ObjRef, effects: &mut Vec<SchedEffect>) {
    let entry = match state.objects.remove(obj) {
        Some(e) => e,
        None => return,
    };
    match entry.object {
        KernelObject::Untyped(_) => {
            // Delete refuses the last capability while children exist,
            // so a destroyed Untyped is always childless.
        }
        KernelObject::Endpoint(ep) => {
            for tid in ep.send_queue.into_iter().chain(ep.recv_queue) {
                abort_waiter(state, tid, effects);
            }
        }
        KernelObject::Notification(n) => {
            for tid in n.waiters {
                abort_waiter(state, tid, effects);
            }
        }
        KernelObject::Tcb(t) => {
            let tid = ThreadId::from_obj(obj);
            match t.exec {
                ExecState::SendBlocked(ep) | ExecState::CallBlocked(ep) => {
                    if let Ok(ep) = state.objects.endpoint_mut(ep) {
                        ep.send_queue.retain(|&x| x != tid);
                    }
                }
                ExecState::RecvBlocked(ep) => {
                    if let Ok(ep) = state.objects.endpoint_mut(ep) {
                        ep.recv_queue.retain(|&x| x != tid);
                    }
                }
                ExecState::NotificationBlocked(n) => {
                    if let Ok(n) = state.objects.notification_mut(n) {
                        n.waiters.retain(|&x| x != tid);
                    }
                }
                ExecState::ReplyBlocked => {
                    state.replies.remove_by_caller(tid);
                }
                _ => {}
            }
            // A reply object held by the dying server releases its
            // caller rather than stranding it.
            if let Some(r) = t.reply {
                if let Some(entry) = state.replies.remove(r) {
                    abort_waiter(state, entry.caller, effects);
                }
            }
            effects.push(SchedEffect::Killed { tid });
        }
        KernelObject::CNode(cn) => {
            // The CNode is out of the table already, so nested lookups
            // against it fail cleanly while we drain its slots.
            for cap in cn.into_slots().into_iter().flatten() {
                // A revocation triggered by an earlier slot may have
                // already consumed this node.
                if !state.derivs.contains(cap.node) {
                    continue;
                }
                if let Some(e) = state.objects.get(cap.object) {
                    if e.slot_refs == 1
                        && !e.children.is_empty()
                        && matches!(e.object, KernelObject::Untyped(_))
                    {
                        revoke_node(state, cap.node, effects);
                    }
                }
                state.derivs.remove_splice(cap.node);
                release_object_ref(state, cap.object, effects);
            }
        }
    }
}
