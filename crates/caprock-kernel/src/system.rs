//! System struct - the pure kernel core wired to a platform.
//!
//! The core decides, the platform acts: every step returns a batch of
//! scheduling effects, and `System` forwards them to the [`Platform`]
//! before handing the caller its result. This is the single entry
//! point for invocations, faults and interrupts.
//!
//! ```text
//! Thread ──▶ System.invoke() ──▶ caprock-core step()
//!                 │                       │
//!                 │   effects (block/wake/kill)
//!                 ▼                       ▼
//!             Platform  ◀──────── StepResult
//! ```

use caprock_core::{
    deliver_fault, step, Delivered, FaultCause, Invocation, KernelError, KernelState, Outcome,
    RegisterSet, SchedEffect, SlotRef, StepResult, ThreadId, Word,
};
use caprock_hal::{BlockReason as HalBlockReason, Platform};

use crate::boot::{bootstrap, BootConfig, BootError, BootInfo};
use crate::irq::{IrqLine, IrqTable};

/// The kernel core plus the platform it schedules through.
pub struct System<P: Platform> {
    platform: P,
    state: KernelState,
    boot_info: BootInfo,
    irqs: IrqTable,
    boot_time: u64,
}

impl<P: Platform> System<P> {
    /// Bootstrap a system with the given platform and initial layout.
    pub fn new(platform: P, config: &BootConfig) -> Result<Self, BootError> {
        let (state, boot_info) = bootstrap(config)?;
        let boot_time = platform.now_nanos();
        platform.set_priority(boot_info.root_thread.0 as u64, config.root_priority);
        platform.wake(boot_info.root_thread.0 as u64);
        Ok(Self {
            platform,
            state,
            boot_info,
            irqs: IrqTable::new(),
            boot_time,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn state(&self) -> &KernelState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut KernelState {
        &mut self.state
    }

    pub fn boot_info(&self) -> &BootInfo {
        &self.boot_info
    }

    pub fn uptime_nanos(&self) -> u64 {
        self.platform.now_nanos().saturating_sub(self.boot_time)
    }

    /// Run one invocation for `tid`, applying its scheduling effects.
    pub fn invoke(&mut self, tid: ThreadId, invocation: Invocation) -> Result<Outcome, KernelError> {
        let result = step(&mut self.state, tid, invocation);
        self.apply(result)
    }

    /// Write an initial register frame into `tcb`, laid out by the
    /// platform's image loader. `caller` needs a writable capability
    /// in the slot.
    pub fn prepare_thread(
        &mut self,
        caller: ThreadId,
        tcb: SlotRef,
        entry: Word,
        stack_top: Word,
    ) -> Result<Outcome, KernelError> {
        let frame = self.platform.build_frame(entry, stack_top);
        self.invoke(
            caller,
            Invocation::WriteRegisters {
                tcb,
                regs: RegisterSet {
                    pc: frame.pc,
                    sp: frame.sp,
                    ..RegisterSet::default()
                },
            },
        )
    }

    /// Deliver a fault raised by `tid`.
    pub fn raise_fault(&mut self, tid: ThreadId, cause: FaultCause) -> Result<Outcome, KernelError> {
        let result = deliver_fault(&mut self.state, tid, cause);
        self.apply(result)
    }

    /// Pick up the rendezvous result for a thread the platform just
    /// resumed. `None` means nothing completed since the last call.
    pub fn take_resumption(&mut self, tid: ThreadId) -> Option<Result<Delivered, KernelError>> {
        self.state.thread_mut(tid).ok()?.incoming.take()
    }

    /// Bind an interrupt line to a notification capability.
    pub fn bind_irq(&mut self, irq: IrqLine, slot: SlotRef) -> Result<(), KernelError> {
        self.irqs.bind(&self.state, irq, slot)
    }

    pub fn unbind_irq(&mut self, irq: IrqLine) -> bool {
        self.irqs.unbind(irq)
    }

    /// Route a firing interrupt line to its bound notification.
    pub fn handle_irq(&mut self, irq: IrqLine) -> Result<Outcome, KernelError> {
        if self.irqs.binding(irq).is_none() {
            self.platform.debug_write("unbound irq");
        }
        let result = self.irqs.handle(&mut self.state, irq);
        self.apply(result)
    }

    fn apply(&mut self, result: StepResult) -> Result<Outcome, KernelError> {
        for effect in &result.effects {
            match *effect {
                SchedEffect::Block { tid, reason } => {
                    self.platform.block(tid.0 as u64, hal_reason(reason));
                }
                SchedEffect::Wake { tid } => self.platform.wake(tid.0 as u64),
                SchedEffect::SetPriority { tid, prio } => {
                    self.platform.set_priority(tid.0 as u64, prio);
                }
                SchedEffect::Killed { tid } => {
                    self.platform.debug_write("thread killed");
                    self.platform.thread_exited(tid.0 as u64);
                }
            }
        }
        result.result
    }
}

fn hal_reason(reason: caprock_core::BlockReason) -> HalBlockReason {
    match reason {
        caprock_core::BlockReason::SendWait => HalBlockReason::SendWait,
        caprock_core::BlockReason::RecvWait => HalBlockReason::RecvWait,
        caprock_core::BlockReason::ReplyWait => HalBlockReason::ReplyWait,
        caprock_core::BlockReason::NotificationWait => HalBlockReason::NotificationWait,
        caprock_core::BlockReason::FaultWait => HalBlockReason::FaultWait,
        caprock_core::BlockReason::Suspended => HalBlockReason::Suspended,
    }
}
