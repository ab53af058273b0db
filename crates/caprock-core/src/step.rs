//! The kernel step function
//!
//! One invocation in, one result plus a batch of scheduling effects
//! out. The core never touches hardware and never schedules; it is a
//! pure transition on [`KernelState`] that the runtime drives.

use alloc::vec::Vec;

use crate::cspace;
use crate::endpoint;
use crate::fault::{self, FaultCause};
use crate::notification;
use crate::object::ObjectKind;
use crate::rights::CapRights;
use crate::state::{self, KernelState};
use crate::tcb::{self, ExecState};
use crate::types::{
    Badge, Delivered, KernelError, Message, RegisterSet, SchedEffect, SlotRef, ThreadId, Word,
};
use crate::untyped;

/// Everything a thread can ask the kernel to do.
#[derive(Clone, Debug)]
pub enum Invocation {
    // Untyped
    Retype {
        untyped: SlotRef,
        kind: ObjectKind,
        size_bits: u8,
        dest: Vec<SlotRef>,
    },
    // CSpace
    Copy {
        src: SlotRef,
        dest: SlotRef,
        rights: CapRights,
    },
    Mint {
        src: SlotRef,
        dest: SlotRef,
        rights: CapRights,
        badge: Badge,
    },
    Move {
        src: SlotRef,
        dest: SlotRef,
    },
    Delete {
        slot: SlotRef,
    },
    Revoke {
        slot: SlotRef,
    },
    // Endpoint IPC
    Send {
        ep: SlotRef,
        msg: Message,
    },
    Recv {
        ep: SlotRef,
        recv_slots: Vec<SlotRef>,
    },
    Call {
        ep: SlotRef,
        msg: Message,
    },
    Reply {
        msg: Message,
    },
    ReplyRecv {
        ep: SlotRef,
        msg: Message,
        recv_slots: Vec<SlotRef>,
    },
    // Notifications
    Signal {
        ntfn: SlotRef,
    },
    Wait {
        ntfn: SlotRef,
    },
    Poll {
        ntfn: SlotRef,
    },
    // Threads
    Configure {
        tcb: SlotRef,
        cspace: SlotRef,
        vspace: Word,
        ipc_buffer: Word,
    },
    SetFaultHandler {
        tcb: SlotRef,
        handler: Option<SlotRef>,
    },
    WriteRegisters {
        tcb: SlotRef,
        regs: RegisterSet,
    },
    ReadRegisters {
        tcb: SlotRef,
    },
    SetPriority {
        tcb: SlotRef,
        priority: u8,
    },
    Resume {
        tcb: SlotRef,
    },
    Suspend {
        tcb: SlotRef,
    },
}

/// What an invocation produced for the calling thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Done, nothing to report.
    Unit,
    /// The thread is now parked; its result arrives on wake-up.
    Blocked,
    /// A message came straight through the rendezvous.
    Delivered(Delivered),
    /// The pending badge word drained by Wait or Poll.
    Badge(Badge),
    /// Poll found nothing pending.
    NoMessage,
    Registers(RegisterSet),
    /// The faulting thread had no handler and is gone.
    ThreadTerminated,
}

/// Result of one step: what the caller gets, and what the scheduler
/// must do about everyone affected.
#[derive(Debug)]
pub struct StepResult {
    pub result: Result<Outcome, KernelError>,
    pub effects: Vec<SchedEffect>,
}

/// Run one invocation on behalf of `tid`.
pub fn step(state: &mut KernelState, tid: ThreadId, invocation: Invocation) -> StepResult {
    let mut effects = Vec::new();
    let result = dispatch(state, tid, invocation, &mut effects);
    StepResult { result, effects }
}

/// Deliver a fault raised by `tid`. Kernel-internal entry: faults are
/// events, not invocations, so they bypass the runnable gate that
/// `step` applies.
pub fn deliver_fault(state: &mut KernelState, tid: ThreadId, cause: FaultCause) -> StepResult {
    let mut effects = Vec::new();
    let result = fault::deliver_fault(state, tid, cause, &mut effects);
    StepResult { result, effects }
}

/// Signal a notification on the kernel's own behalf, through the
/// capability in `slot`. Interrupt routing comes in here: the handle
/// is re-resolved on every delivery, so revoking it unbinds cleanly.
pub fn raise_signal(state: &mut KernelState, slot: SlotRef) -> StepResult {
    let mut effects = Vec::new();
    let result = notification::signal(state, slot, &mut effects);
    StepResult { result, effects }
}

fn dispatch(
    state: &mut KernelState,
    tid: ThreadId,
    invocation: Invocation,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    // Only a live, runnable thread can invoke.
    match state.thread(tid) {
        Ok(t) if t.exec == ExecState::Running => {}
        _ => return Err(KernelError::InvalidArgument),
    }
    match invocation {
        Invocation::Retype {
            untyped: src,
            kind,
            size_bits,
            dest,
        } => untyped::retype(state, src, kind, size_bits, &dest),
        Invocation::Copy { src, dest, rights } => cspace::cap_copy(state, src, dest, rights),
        Invocation::Mint {
            src,
            dest,
            rights,
            badge,
        } => cspace::cap_mint(state, src, dest, rights, badge),
        Invocation::Move { src, dest } => cspace::cap_move(state, src, dest),
        Invocation::Delete { slot } => state::cap_delete(state, slot, effects),
        Invocation::Revoke { slot } => state::cap_revoke(state, slot, effects),
        Invocation::Send { ep, msg } => endpoint::send(state, tid, ep, msg, effects),
        Invocation::Recv { ep, recv_slots } => endpoint::recv(state, tid, ep, recv_slots, effects),
        Invocation::Call { ep, msg } => endpoint::call(state, tid, ep, msg, effects),
        Invocation::Reply { msg } => endpoint::reply(state, tid, msg, effects),
        Invocation::ReplyRecv {
            ep,
            msg,
            recv_slots,
        } => endpoint::reply_recv(state, tid, ep, msg, recv_slots, effects),
        Invocation::Signal { ntfn } => notification::signal(state, ntfn, effects),
        Invocation::Wait { ntfn } => notification::wait(state, tid, ntfn, effects),
        Invocation::Poll { ntfn } => notification::poll(state, ntfn),
        Invocation::Configure {
            tcb: target,
            cspace,
            vspace,
            ipc_buffer,
        } => tcb::configure(state, target, cspace, vspace, ipc_buffer),
        Invocation::SetFaultHandler {
            tcb: target,
            handler,
        } => tcb::set_fault_handler(state, target, handler),
        Invocation::WriteRegisters { tcb: target, regs } => {
            tcb::write_registers(state, target, regs)
        }
        Invocation::ReadRegisters { tcb: target } => tcb::read_registers(state, target),
        Invocation::SetPriority {
            tcb: target,
            priority,
        } => tcb::set_priority(state, target, priority, effects),
        Invocation::Resume { tcb: target } => tcb::resume(state, target, effects),
        Invocation::Suspend { tcb: target } => tcb::suspend(state, target, effects),
    }
}
