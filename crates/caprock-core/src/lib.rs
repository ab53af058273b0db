//! Caprock Kernel Core - Pure Capability State Machine
//!
//! This crate contains the **pure, platform-free** capability kernel
//! that the rest of the system drives: typed kernel objects carved out
//! of Untyped memory, capability spaces with a full derivation tree,
//! rendezvous IPC with badging and capability transfer, notifications,
//! and fault delivery.
//!
//! # Design Principles
//!
//! 1. **No platform dependency**: scheduling, timing and debug output
//!    live behind the `caprock-hal` trait in `caprock-kernel`
//! 2. **No I/O or side effects**: every operation is a pure transition
//!    on [`KernelState`]
//! 3. **Deterministic**: same state and invocation, same result
//! 4. **Explicit authority**: nothing happens without a capability;
//!    `step` reports the scheduling consequences instead of acting
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      caprock-core                        │
//! │                 (Pure State Machine)                     │
//! │                                                          │
//! │   ┌───────────────┐     ┌───────────────┐               │
//! │   │  KernelState  │     │    step()     │               │
//! │   │  - objects    │────▶│  invocation   │               │
//! │   │  - derivs     │     │  dispatcher   │               │
//! │   │  - replies    │     └───────────────┘               │
//! │   └───────────────┘                                      │
//! │                                                          │
//! │   untyped · cspace · endpoint · notification · tcb       │
//! │   fault · invariants                                     │
//! └──────────────────────────────────────────────────────────┘
//!                            │ used by
//!                            ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                     caprock-kernel                       │
//! │   - platform integration (scheduler hooks, debug)        │
//! │   - boot protocol and initial capability layout          │
//! │   - interrupt-to-notification routing                    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Handles, messages, errors, scheduling effects
//! - `rights` - The packed read/write/grant rights mask
//! - `object` - The kernel object arena
//! - `cspace` - CNodes, capabilities and the derivation tree
//! - `untyped` - Watermark allocation and Retype
//! - `endpoint` - Rendezvous IPC, Call/Reply, capability transfer
//! - `notification` - Badge-coalescing signals
//! - `tcb` - Thread control blocks and thread operations
//! - `fault` - Fault encoding and delivery
//! - `state` - KernelState plus Delete/Revoke and teardown
//! - `step` - The `step(state, tid, invocation)` entry point
//! - `invariants` - Whole-state structural checks for tests

#![no_std]
extern crate alloc;

pub mod cspace;
pub mod endpoint;
pub mod fault;
pub mod invariants;
pub mod notification;
pub mod object;
pub mod rights;
pub mod state;
pub mod step;
pub mod tcb;
pub mod types;
pub mod untyped;

// Re-export the public surface for convenient access
pub use cspace::{CNode, Capability, DerivId, DerivTree, CNODE_RADIX_MAX, CNODE_RADIX_MIN};
pub use endpoint::{Endpoint, ReplyEntry, ReplyRef, ReplyTable};
pub use fault::FaultCause;
pub use invariants::{check_invariants, InvariantViolation};
pub use notification::Notification;
pub use object::{KernelObject, ObjectEntry, ObjectKind, ObjectTable};
pub use rights::CapRights;
pub use state::KernelState;
pub use step::{deliver_fault, raise_signal, step, Invocation, Outcome, StepResult};
pub use tcb::{ExecState, Tcb};
pub use types::{
    Badge, BlockReason, Delivered, KernelError, Message, ObjRef, RegisterSet, SchedEffect,
    SlotRef, ThreadId, Word, MSG_MAX_CAPS, MSG_MAX_WORDS, NUM_GP_REGS,
};
pub use untyped::{object_alignment, object_size, Untyped, UNTYPED_BITS_MAX, UNTYPED_BITS_MIN};
