//! Thread control blocks
//!
//! A TCB holds the architecture-neutral register image, the thread's
//! capability-space root, scheduling parameters and the IPC bookkeeping
//! for whichever rendezvous the thread is currently parked in. All
//! thread-targeted operations (`Configure`, `Resume`, `Suspend`, the
//! register accessors) live here; the rendezvous paths in `endpoint`
//! manipulate the `exec`/`outgoing`/`incoming` fields directly.

use alloc::vec::Vec;

use crate::cspace::{Capability, DerivId};
use crate::endpoint::ReplyRef;
use crate::object::ObjectKind;
use crate::rights::CapRights;
use crate::state::KernelState;
use crate::step::Outcome;
use crate::types::{
    Badge, BlockReason, Delivered, KernelError, Message, ObjRef, RegisterSet, SchedEffect,
    SlotRef, ThreadId, Word,
};

/// What a thread is doing, from the kernel's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
    /// Never resumed, or suspended.
    Inactive,
    /// Runnable (the scheduler owns whether it is actually on a core).
    Running,
    /// Parked in an endpoint send queue (plain send).
    SendBlocked(ObjRef),
    /// Parked in an endpoint send queue with a pending reply (call).
    CallBlocked(ObjRef),
    /// Parked in an endpoint receive queue.
    RecvBlocked(ObjRef),
    /// Called, delivered, waiting for the reply object to fire.
    ReplyBlocked,
    /// Parked on a notification wait.
    NotificationBlocked(ObjRef),
    /// Killed by an unhandled fault or TCB destruction.
    Terminated,
}

/// A message staged in the sender's TCB while it waits for a receiver.
#[derive(Clone, Debug)]
pub struct Outgoing {
    pub msg: Message,
    /// Badge of the endpoint capability the send was invoked through.
    pub badge: Badge,
    /// Resolved capabilities to transfer, paired with their tree nodes.
    pub caps: Vec<(Capability, DerivId)>,
    /// True for Call: completing the rendezvous mints a reply object.
    pub call: bool,
    /// True when the message is a kernel-synthesised fault.
    pub fault: bool,
}

/// Thread control block.
#[derive(Clone, Debug)]
pub struct Tcb {
    pub registers: RegisterSet,
    /// Root CNode of this thread's capability space.
    pub cspace_root: Option<ObjRef>,
    pub vspace: Word,
    pub ipc_buffer: Word,
    /// Slot holding the fault endpoint capability, resolved per fault.
    pub fault_handler: Option<SlotRef>,
    pub priority: u8,
    pub exec: ExecState,
    /// Reply object held after receiving a call, consumed by Reply.
    pub reply: Option<ReplyRef>,
    /// Staged send while parked in a send queue.
    pub outgoing: Option<Outgoing>,
    /// Where transferred capabilities land for the next receive.
    pub recv_slots: Vec<SlotRef>,
    /// Completed rendezvous result, picked up when the thread resumes.
    pub incoming: Option<Result<Delivered, KernelError>>,
}

impl Tcb {
    pub fn new() -> Self {
        Self {
            registers: RegisterSet::default(),
            cspace_root: None,
            vspace: 0,
            ipc_buffer: 0,
            fault_handler: None,
            priority: 0,
            exec: ExecState::Inactive,
            reply: None,
            outgoing: None,
            recv_slots: Vec::new(),
            incoming: None,
        }
    }

    /// A thread cannot be resumed until it has a CSpace.
    pub fn is_configured(&self) -> bool {
        self.cspace_root.is_some()
    }
}

impl Default for Tcb {
    fn default() -> Self {
        Self::new()
    }
}

/// Unhook `tid` from whatever wait queue its exec state names.
///
/// Used by Suspend and by TCB destruction; the caller decides the new
/// exec state. Any staged send and pending reply obligations are torn
/// down with it.
pub(crate) fn detach_from_wait(state: &mut KernelState, tid: ThreadId) {
    let exec = match state.objects.tcb(tid.obj_ref()) {
        Ok(t) => t.exec,
        Err(_) => return,
    };
    match exec {
        ExecState::SendBlocked(ep) | ExecState::CallBlocked(ep) => {
            if let Ok(ep) = state.objects.endpoint_mut(ep) {
                ep.send_queue.retain(|&t| t != tid);
            }
        }
        ExecState::RecvBlocked(ep) => {
            if let Ok(ep) = state.objects.endpoint_mut(ep) {
                ep.recv_queue.retain(|&t| t != tid);
            }
        }
        ExecState::NotificationBlocked(n) => {
            if let Ok(n) = state.objects.notification_mut(n) {
                n.waiters.retain(|&t| t != tid);
            }
        }
        ExecState::ReplyBlocked => {
            // The server's reply object now points at a dead caller;
            // Reply through it reports InvalidCapability.
            state.replies.remove_by_caller(tid);
        }
        ExecState::Inactive | ExecState::Running | ExecState::Terminated => {}
    }
    if let Ok(t) = state.objects.tcb_mut(tid.obj_ref()) {
        t.outgoing = None;
    }
}

/// Bind a TCB to its CSpace root, VSpace handle and IPC buffer.
pub(crate) fn configure(
    state: &mut KernelState,
    target: SlotRef,
    cspace: SlotRef,
    vspace: Word,
    ipc_buffer: Word,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::WRITE, ObjectKind::Tcb)?;
    let cnode_cap = state.cap_checked(cspace, CapRights::NONE, ObjectKind::CNode)?;

    let tcb = state.objects.tcb_mut(tcb_cap.object)?;
    if tcb.exec != ExecState::Inactive {
        return Err(KernelError::InvalidArgument);
    }
    tcb.cspace_root = Some(cnode_cap.object);
    tcb.vspace = vspace;
    tcb.ipc_buffer = ipc_buffer;
    Ok(Outcome::Unit)
}

pub(crate) fn set_fault_handler(
    state: &mut KernelState,
    target: SlotRef,
    handler: Option<SlotRef>,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::WRITE, ObjectKind::Tcb)?;
    state.objects.tcb_mut(tcb_cap.object)?.fault_handler = handler;
    Ok(Outcome::Unit)
}

pub(crate) fn write_registers(
    state: &mut KernelState,
    target: SlotRef,
    regs: RegisterSet,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::WRITE, ObjectKind::Tcb)?;
    let tcb = state.objects.tcb_mut(tcb_cap.object)?;
    if tcb.exec == ExecState::Terminated {
        return Err(KernelError::InvalidArgument);
    }
    tcb.registers = regs;
    Ok(Outcome::Unit)
}

pub(crate) fn read_registers(
    state: &mut KernelState,
    target: SlotRef,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::READ, ObjectKind::Tcb)?;
    let regs = state.objects.tcb(tcb_cap.object)?.registers;
    Ok(Outcome::Registers(regs))
}

pub(crate) fn set_priority(
    state: &mut KernelState,
    target: SlotRef,
    priority: u8,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::WRITE, ObjectKind::Tcb)?;
    state.objects.tcb_mut(tcb_cap.object)?.priority = priority;
    effects.push(SchedEffect::SetPriority {
        tid: ThreadId::from_obj(tcb_cap.object),
        prio: priority,
    });
    Ok(Outcome::Unit)
}

pub(crate) fn resume(
    state: &mut KernelState,
    target: SlotRef,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::WRITE, ObjectKind::Tcb)?;
    let tcb = state.objects.tcb_mut(tcb_cap.object)?;
    match tcb.exec {
        ExecState::Inactive => {
            if !tcb.is_configured() {
                return Err(KernelError::InvalidArgument);
            }
            tcb.exec = ExecState::Running;
            effects.push(SchedEffect::Wake {
                tid: ThreadId::from_obj(tcb_cap.object),
            });
            Ok(Outcome::Unit)
        }
        ExecState::Terminated => Err(KernelError::InvalidArgument),
        // Resuming an already-live thread is a no-op.
        _ => Ok(Outcome::Unit),
    }
}

pub(crate) fn suspend(
    state: &mut KernelState,
    target: SlotRef,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let tcb_cap = state.cap_checked(target, CapRights::WRITE, ObjectKind::Tcb)?;
    let tid = ThreadId::from_obj(tcb_cap.object);
    match state.objects.tcb(tcb_cap.object)?.exec {
        ExecState::Inactive => return Ok(Outcome::Unit),
        ExecState::Terminated => return Err(KernelError::InvalidArgument),
        _ => {}
    }
    // Suspension aborts any in-flight IPC: the thread falls out of its
    // wait queue and the staged send is discarded.
    detach_from_wait(state, tid);
    let tcb = state.objects.tcb_mut(tcb_cap.object)?;
    tcb.exec = ExecState::Inactive;
    tcb.incoming = None;
    effects.push(SchedEffect::Block {
        tid,
        reason: BlockReason::Suspended,
    });
    Ok(Outcome::Unit)
}
