//! Core kernel types
//!
//! Identifier newtypes, message types and the limits the IPC layer
//! enforces. All types here are pure data.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// A machine word.
pub type Word = u64;

/// Badge word stamped on a minted capability.
pub type Badge = u64;

/// Stable handle into the kernel object arena.
///
/// Handles are never reused while the entry is live; a freed index may
/// be handed out again, which is safe because every slot naming an
/// object is cleared before the object's entry is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjRef(pub u32);

/// Thread identifier.
///
/// A thread *is* its TCB object; the identifier wraps the TCB's arena
/// handle so the scheduler and the object store agree on identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub u32);

impl ThreadId {
    /// The TCB object this thread identifier names.
    pub fn obj_ref(self) -> ObjRef {
        ObjRef(self.0)
    }

    /// Thread identifier for a TCB object handle.
    pub fn from_obj(obj: ObjRef) -> Self {
        ThreadId(obj.0)
    }
}

/// Address of a capability slot: a CNode and an index into it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    /// The CNode holding the slot.
    pub cnode: ObjRef,
    /// Slot index inside the CNode.
    pub index: u32,
}

impl SlotRef {
    pub fn new(cnode: ObjRef, index: u32) -> Self {
        Self { cnode, index }
    }
}

/// Maximum message payload in machine words.
pub const MSG_MAX_WORDS: usize = 64;

/// Maximum capabilities transferred in one message.
pub const MSG_MAX_CAPS: usize = 4;

/// An IPC message payload.
///
/// A label, up to [`MSG_MAX_WORDS`] data words, and up to
/// [`MSG_MAX_CAPS`] slot addresses naming capabilities the sender wants
/// transferred (transfer additionally requires Grant on the invoked
/// endpoint capability).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol tag, uninterpreted by the kernel.
    pub label: Word,
    /// Data words.
    pub words: Vec<Word>,
    /// Sender-side slots of capabilities to transfer.
    pub cap_slots: Vec<SlotRef>,
}

impl Message {
    /// Empty message with a label.
    pub fn new(label: Word) -> Self {
        Self {
            label,
            words: Vec::new(),
            cap_slots: Vec::new(),
        }
    }

    /// Message with a label and data words.
    pub fn with_words(label: Word, words: Vec<Word>) -> Self {
        Self {
            label,
            words,
            cap_slots: Vec::new(),
        }
    }

    /// Check the static capacity limits.
    pub fn within_limits(&self) -> bool {
        self.words.len() <= MSG_MAX_WORDS && self.cap_slots.len() <= MSG_MAX_CAPS
    }
}

/// General-purpose register count in the portable register set.
pub const NUM_GP_REGS: usize = 8;

/// Portable register file for an execution context.
///
/// Real frame construction is the loader's business; the kernel only
/// stores and copies these words.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSet {
    /// Program counter.
    pub pc: Word,
    /// Stack pointer.
    pub sp: Word,
    /// General-purpose registers.
    pub gpr: [Word; NUM_GP_REGS],
}

/// What a delivered rendezvous (or notification wake-up) carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    /// The message body. Empty for notification deliveries and plain
    /// send acknowledgements.
    pub msg: Message,
    /// Badge of the capability the sender invoked (0 if unbadged), or
    /// the accumulated signal word for notification deliveries.
    pub badge: Badge,
    /// Number of capabilities actually transferred into the receiver's
    /// declared slots.
    pub transferred: usize,
}

impl Delivered {
    /// An empty delivery (plain-send acknowledgement).
    pub fn ack() -> Self {
        Self {
            msg: Message::default(),
            badge: 0,
            transferred: 0,
        }
    }

    /// A notification delivery carrying a signal word.
    pub fn signal(badge: Badge) -> Self {
        Self {
            msg: Message::default(),
            badge,
            transferred: 0,
        }
    }
}

/// Kernel errors.
///
/// Every operation returns one of these synchronously; nothing is
/// swallowed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    /// Empty or unresolvable capability slot.
    FailedLookup,
    /// Destination slot already occupied.
    SlotInUse,
    /// Bad size, alignment, count or message shape.
    InvalidArgument,
    /// Untyped region cannot satisfy the allocation.
    NotEnoughMemory,
    /// Delete blocked by live derivations.
    RevokeFirst,
    /// Wrong object kind, consumed reply, or rights missing.
    InvalidCapability,
    /// Woken because the target object was destroyed.
    ObjectDestroyed,
}

/// Why a thread is being parked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    /// Queued on an endpoint's sender queue.
    SendWait,
    /// Queued on an endpoint's receiver queue.
    RecvWait,
    /// Rendezvous complete, waiting for the paired reply.
    ReplyWait,
    /// Queued on a notification's waiter queue.
    NotificationWait,
    /// Fault delivered, waiting for the handler's reply.
    FaultWait,
    /// Explicitly suspended.
    Suspended,
}

/// Scheduling effects produced by a step.
///
/// The core never schedules; it reports what the external scheduler
/// must do. The runtime wrapper forwards these to the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedEffect {
    /// Park a thread.
    Block { tid: ThreadId, reason: BlockReason },
    /// Make a thread runnable.
    Wake { tid: ThreadId },
    /// Priority changed.
    SetPriority { tid: ThreadId, prio: u8 },
    /// Thread is gone for good.
    Killed { tid: ThreadId },
}
