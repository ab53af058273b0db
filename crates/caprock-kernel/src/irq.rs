//! Interrupt routing
//!
//! Interrupt lines are bound to notification capabilities. A firing
//! line becomes a kernel-initiated signal through the bound slot; the
//! slot is re-resolved on every delivery, so revoking or deleting the
//! capability unbinds the line without any bookkeeping here.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use caprock_core::{
    raise_signal, CapRights, KernelError, KernelState, ObjectKind, SlotRef, StepResult,
};

/// Interrupt line number.
pub type IrqLine = u32;

/// Map from interrupt line to the slot holding its notification
/// capability.
pub struct IrqTable {
    bindings: BTreeMap<IrqLine, SlotRef>,
}

impl IrqTable {
    pub fn new() -> Self {
        Self {
            bindings: BTreeMap::new(),
        }
    }

    /// Bind `irq` to the notification capability in `slot`. The slot
    /// must currently hold a signal-capable notification capability;
    /// rebinding replaces the previous target.
    pub fn bind(
        &mut self,
        state: &KernelState,
        irq: IrqLine,
        slot: SlotRef,
    ) -> Result<(), KernelError> {
        state.cap_checked(slot, CapRights::WRITE, ObjectKind::Notification)?;
        self.bindings.insert(irq, slot);
        Ok(())
    }

    pub fn unbind(&mut self, irq: IrqLine) -> bool {
        self.bindings.remove(&irq).is_some()
    }

    pub fn binding(&self, irq: IrqLine) -> Option<SlotRef> {
        self.bindings.get(&irq).copied()
    }

    /// Deliver a firing interrupt line as a signal.
    pub fn handle(&self, state: &mut KernelState, irq: IrqLine) -> StepResult {
        match self.bindings.get(&irq) {
            Some(&slot) => raise_signal(state, slot),
            None => StepResult {
                result: Err(KernelError::FailedLookup),
                effects: Vec::new(),
            },
        }
    }
}

impl Default for IrqTable {
    fn default() -> Self {
        Self::new()
    }
}
