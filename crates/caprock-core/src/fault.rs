//! Fault delivery
//!
//! A fault turns into a kernel-synthesised Call on the faulting
//! thread's handler endpoint: the handler receives an encoded fault
//! message stamped with its own capability's badge, and its reply
//! resumes the faulter (optionally rewriting the program counter). A
//! thread with no resolvable handler is terminated on the spot.

use alloc::vec::Vec;

use crate::object::ObjectKind;
use crate::rights::CapRights;
use crate::state::{self, KernelState};
use crate::step::Outcome;
use crate::tcb::ExecState;
use crate::types::{KernelError, Message, RegisterSet, SchedEffect, SlotRef, ThreadId, Word};

/// Message labels for synthesised fault messages.
pub const FAULT_LABEL_VM: Word = 1;
pub const FAULT_LABEL_ILLEGAL_INSTRUCTION: Word = 2;
pub const FAULT_LABEL_UNKNOWN_SYSCALL: Word = 3;
pub const FAULT_LABEL_CAP: Word = 4;
pub const FAULT_LABEL_DEBUG: Word = 5;

/// What went wrong in the faulting thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultCause {
    /// Access to an unmapped or protected address.
    VmFault { addr: Word, write: bool },
    IllegalInstruction,
    UnknownSyscall { syscall: Word },
    /// A capability lookup the thread could not recover from.
    CapFault { slot: SlotRef },
    DebugTrap,
}

impl FaultCause {
    pub fn label(&self) -> Word {
        match self {
            FaultCause::VmFault { .. } => FAULT_LABEL_VM,
            FaultCause::IllegalInstruction => FAULT_LABEL_ILLEGAL_INSTRUCTION,
            FaultCause::UnknownSyscall { .. } => FAULT_LABEL_UNKNOWN_SYSCALL,
            FaultCause::CapFault { .. } => FAULT_LABEL_CAP,
            FaultCause::DebugTrap => FAULT_LABEL_DEBUG,
        }
    }

    /// Encode the fault for the handler: faulting pc and sp first,
    /// then the cause-specific words.
    pub fn encode(&self, regs: &RegisterSet) -> Message {
        let mut words = alloc::vec![regs.pc, regs.sp];
        match *self {
            FaultCause::VmFault { addr, write } => {
                words.push(addr);
                words.push(write as Word);
            }
            FaultCause::IllegalInstruction | FaultCause::DebugTrap => {}
            FaultCause::UnknownSyscall { syscall } => words.push(syscall),
            FaultCause::CapFault { slot } => {
                words.push(slot.cnode.0 as Word);
                words.push(slot.index as Word);
            }
        }
        Message::with_words(self.label(), words)
    }
}

/// Deliver `cause` on behalf of `tid`.
///
/// `Outcome::Blocked` means the fault went out as a Call and the
/// thread now waits for the handler; `Outcome::ThreadTerminated`
/// means no handler could take it.
pub(crate) fn deliver_fault(
    state: &mut KernelState,
    tid: ThreadId,
    cause: FaultCause,
    effects: &mut Vec<SchedEffect>,
) -> Result<Outcome, KernelError> {
    let tcb = state.thread(tid)?;
    // Only a running thread can trap; a queued or suspended one must
    // not end up on a second wait queue.
    if tcb.exec != ExecState::Running {
        return Err(KernelError::InvalidArgument);
    }
    let handler_slot = tcb.fault_handler;
    let regs = tcb.registers;

    let handler = handler_slot.and_then(|slot| {
        state
            .cap_checked(slot, CapRights::WRITE, ObjectKind::Endpoint)
            .ok()
    });
    let cap = match handler {
        Some(cap) => cap,
        None => {
            state::terminate_thread(state, tid, effects);
            return Ok(Outcome::ThreadTerminated);
        }
    };

    let msg = cause.encode(&regs);
    let badge = cap.badge.unwrap_or(0);
    match crate::endpoint::send_resolved(
        state,
        tid,
        cap.object,
        msg,
        badge,
        Vec::new(),
        true,
        true,
        effects,
    ) {
        Ok(outcome) => Ok(outcome),
        // The endpoint vanished between the check and the send.
        Err(_) => {
            state::terminate_thread(state, tid, effects);
            Ok(Outcome::ThreadTerminated)
        }
    }
}
