//! Whole-state invariant checking
//!
//! `check_invariants` walks the entire state and verifies the
//! structural properties every step is supposed to preserve. It is
//! meant for tests and debug builds; production paths never need it
//! because the operations maintain these properties by construction.

use crate::object::{KernelObject, ObjectKind};
use crate::state::KernelState;
use crate::tcb::ExecState;
use crate::types::{ObjRef, SlotRef, ThreadId};

/// A structural property that no reachable state may violate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvariantViolation {
    /// An endpoint has waiters on both queues at once.
    RendezvousBroken { endpoint: ObjRef },
    /// An occupied slot names an object that is not live.
    DanglingObject { slot: SlotRef, object: ObjRef },
    /// An occupied slot's capability names a dead derivation node.
    DanglingDerivNode { slot: SlotRef },
    /// A derivation node's recorded slot does not hold its capability.
    SlotMismatch { slot: SlotRef },
    /// An object's slot_refs differs from the occupied slots naming it.
    RefCountSkew { object: ObjRef, counted: u32, actual: u32 },
    /// A derived capability's badge differs from its badged parent's.
    BadgeForged { slot: SlotRef },
    /// A child's rights exceed its parent's.
    RightsAmplified { slot: SlotRef },
    /// A queued thread's exec state disagrees with the queue it is in.
    QueueStateSkew { tid: ThreadId },
    /// A sender is queued without a staged message.
    MissingOutgoing { tid: ThreadId },
    /// A reply entry's caller is not reply-blocked.
    StaleReply { tid: ThreadId },
    /// An Untyped has consumed space but no live children.
    WatermarkLeak { object: ObjRef },
    /// A retyped object's parent is not an Untyped, or the parent's
    /// child list does not include it.
    BrokenParentEdge { object: ObjRef },
}

/// Check every structural invariant, reporting the first violation.
pub fn check_invariants(state: &KernelState) -> Result<(), InvariantViolation> {
    check_slots(state)?;
    check_objects(state)?;
    check_queues(state)?;
    check_replies(state)?;
    Ok(())
}

fn check_slots(state: &KernelState) -> Result<(), InvariantViolation> {
    for (obj, entry) in state.objects.iter() {
        let cnode = match &entry.object {
            KernelObject::CNode(c) => c,
            _ => continue,
        };
        for index in cnode.occupied() {
            let slot = SlotRef::new(obj, index);
            let cap = match cnode.get(index) {
                Ok(Some(c)) => c,
                _ => continue,
            };
            if !state.objects.contains(cap.object) {
                return Err(InvariantViolation::DanglingObject {
                    slot,
                    object: cap.object,
                });
            }
            let node = match state.derivs.get(cap.node) {
                Some(n) => n,
                None => return Err(InvariantViolation::DanglingDerivNode { slot }),
            };
            if node.slot != slot || node.object != cap.object {
                return Err(InvariantViolation::SlotMismatch { slot });
            }
            // Derivation monotonicity: rights shrink, badges stick.
            // Retype edges (Untyped parent, typed child) are exempt;
            // the comparison only makes sense between capabilities to
            // the same object.
            if let Some(parent) = node.parent.and_then(|p| state.derivs.get(p)) {
                let pcap = state
                    .objects
                    .cnode(parent.slot.cnode)
                    .ok()
                    .and_then(|c| c.get(parent.slot.index).ok())
                    .and_then(|s| s.as_ref());
                if let Some(pcap) = pcap {
                    if parent.object == cap.object {
                        if !cap.rights.is_subset_of(pcap.rights) {
                            return Err(InvariantViolation::RightsAmplified { slot });
                        }
                        if pcap.badge.is_some() && cap.badge != pcap.badge {
                            return Err(InvariantViolation::BadgeForged { slot });
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn check_objects(state: &KernelState) -> Result<(), InvariantViolation> {
    for (obj, entry) in state.objects.iter() {
        // slot_refs must equal the occupied slots naming the object.
        let mut actual = 0u32;
        for (_, e) in state.objects.iter() {
            if let KernelObject::CNode(c) = &e.object {
                for index in c.occupied() {
                    if let Ok(Some(cap)) = c.get(index).map(|s| s.as_ref().cloned()) {
                        if cap.object == obj {
                            actual += 1;
                        }
                    }
                }
            }
        }
        if entry.slot_refs != actual {
            return Err(InvariantViolation::RefCountSkew {
                object: obj,
                counted: entry.slot_refs,
                actual,
            });
        }
        if let KernelObject::Untyped(ut) = &entry.object {
            if ut.cursor() > 0 && entry.children.is_empty() {
                return Err(InvariantViolation::WatermarkLeak { object: obj });
            }
        }
        if let Some(parent) = entry.parent {
            let ok = state
                .objects
                .get(parent)
                .map(|p| {
                    p.object.kind() == ObjectKind::Untyped && p.children.contains(&obj)
                })
                .unwrap_or(false);
            if !ok {
                return Err(InvariantViolation::BrokenParentEdge { object: obj });
            }
        }
    }
    Ok(())
}

fn check_queues(state: &KernelState) -> Result<(), InvariantViolation> {
    for (obj, entry) in state.objects.iter() {
        match &entry.object {
            KernelObject::Endpoint(ep) => {
                if !ep.send_queue.is_empty() && !ep.recv_queue.is_empty() {
                    return Err(InvariantViolation::RendezvousBroken { endpoint: obj });
                }
                for &tid in &ep.send_queue {
                    let tcb = state
                        .thread(tid)
                        .map_err(|_| InvariantViolation::QueueStateSkew { tid })?;
                    match tcb.exec {
                        ExecState::SendBlocked(e) | ExecState::CallBlocked(e) if e == obj => {}
                        _ => return Err(InvariantViolation::QueueStateSkew { tid }),
                    }
                    if tcb.outgoing.is_none() {
                        return Err(InvariantViolation::MissingOutgoing { tid });
                    }
                }
                for &tid in &ep.recv_queue {
                    let tcb = state
                        .thread(tid)
                        .map_err(|_| InvariantViolation::QueueStateSkew { tid })?;
                    if tcb.exec != ExecState::RecvBlocked(obj) {
                        return Err(InvariantViolation::QueueStateSkew { tid });
                    }
                }
            }
            KernelObject::Notification(n) => {
                for &tid in &n.waiters {
                    let tcb = state
                        .thread(tid)
                        .map_err(|_| InvariantViolation::QueueStateSkew { tid })?;
                    if tcb.exec != ExecState::NotificationBlocked(obj) {
                        return Err(InvariantViolation::QueueStateSkew { tid });
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_replies(state: &KernelState) -> Result<(), InvariantViolation> {
    for (_, entry) in state.objects.iter() {
        if let KernelObject::Tcb(t) = &entry.object {
            if let Some(r) = t.reply {
                if let Some(e) = state.replies.get(r) {
                    let blocked = state
                        .thread(e.caller)
                        .map(|c| c.exec == ExecState::ReplyBlocked)
                        .unwrap_or(false);
                    if !blocked {
                        return Err(InvariantViolation::StaleReply { tid: e.caller });
                    }
                }
            }
        }
    }
    Ok(())
}
