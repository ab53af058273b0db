//! Caprock Kernel Runtime
//!
//! This crate wraps the pure state machine in `caprock-core` with
//! everything a running system needs:
//! - the boot protocol and initial capability layout
//! - platform integration through the `caprock-hal` trait
//! - interrupt-to-notification routing
//!
//! The [`System`] type is the single entry point: invocations, faults
//! and interrupts all flow through it, and the scheduling effects the
//! core emits are applied to the platform before results return.

#![no_std]
extern crate alloc;

pub mod boot;
pub mod irq;
pub mod system;

// Re-export the platform trait and the core surface so embedders only
// need this crate.
pub use caprock_hal::{BlockReason as PlatformBlockReason, Frame, Platform, TestPlatform};

pub use caprock_core::{
    check_invariants, CapRights, Delivered, FaultCause, Invocation, KernelError, KernelState,
    Message, ObjectKind, Outcome, RegisterSet, SlotRef, ThreadId, Word, MSG_MAX_CAPS,
    MSG_MAX_WORDS,
};

pub use boot::{BootConfig, BootError, BootInfo, BOOT_SLOT_CNODE, BOOT_SLOT_TCB, BOOT_SLOT_UNTYPED};
pub use irq::{IrqLine, IrqTable};
pub use system::System;
