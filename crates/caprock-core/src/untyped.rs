//! Untyped memory and Retype
//!
//! An Untyped region hands out space with a bump watermark: Retype
//! aligns the cursor up, claims the run, and never frees individual
//! objects. The cursor only resets when the last retyped child is
//! destroyed, at which point the whole region is fresh again.

use serde::{Deserialize, Serialize};

use crate::cspace::{CNODE_RADIX_MAX, CNODE_RADIX_MIN, CNode};
use crate::endpoint::Endpoint;
use crate::notification::Notification;
use crate::object::{KernelObject, ObjectKind};
use crate::rights::CapRights;
use crate::state::KernelState;
use crate::step::Outcome;
use crate::tcb::Tcb;
use crate::types::{KernelError, SlotRef};

/// Smallest and largest expressible Untyped regions.
pub const UNTYPED_BITS_MIN: u8 = 4;
pub const UNTYPED_BITS_MAX: u8 = 47;

/// An untyped memory region with a bump-allocation watermark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Untyped {
    size_bits: u8,
    cursor: usize,
}

impl Untyped {
    pub fn new(size_bits: u8) -> Self {
        Self {
            size_bits,
            cursor: 0,
        }
    }

    pub fn size_bits(&self) -> u8 {
        self.size_bits
    }

    pub fn size(&self) -> usize {
        1usize << self.size_bits
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.size() - self.cursor
    }

    /// Claim `count * size` bytes at `align`, advancing the cursor.
    pub fn try_allocate(&mut self, size: usize, align: usize) -> Result<usize, KernelError> {
        let aligned = (self.cursor + align - 1) & !(align - 1);
        let end = aligned
            .checked_add(size)
            .ok_or(KernelError::NotEnoughMemory)?;
        if end > self.size() {
            return Err(KernelError::NotEnoughMemory);
        }
        self.cursor = end;
        Ok(aligned)
    }

    /// Forget all allocations. Only valid once no children remain.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }
}

/// Bytes consumed in an Untyped region by one object of `kind`.
///
/// `size_bits` only applies to the variable-size kinds and must be 0
/// for the fixed-size ones.
pub fn object_size(kind: ObjectKind, size_bits: u8) -> Result<usize, KernelError> {
    match kind {
        ObjectKind::Untyped => {
            if !(UNTYPED_BITS_MIN..=UNTYPED_BITS_MAX).contains(&size_bits) {
                return Err(KernelError::InvalidArgument);
            }
            Ok(1usize << size_bits)
        }
        ObjectKind::CNode => {
            if !(CNODE_RADIX_MIN..=CNODE_RADIX_MAX).contains(&size_bits) {
                return Err(KernelError::InvalidArgument);
            }
            // 16 bytes per slot.
            Ok(16usize << size_bits)
        }
        ObjectKind::Endpoint | ObjectKind::Notification => {
            if size_bits != 0 {
                return Err(KernelError::InvalidArgument);
            }
            Ok(64)
        }
        ObjectKind::Tcb => {
            if size_bits != 0 {
                return Err(KernelError::InvalidArgument);
            }
            Ok(1024)
        }
    }
}

/// Objects are naturally aligned to their own size.
pub fn object_alignment(kind: ObjectKind, size_bits: u8) -> Result<usize, KernelError> {
    object_size(kind, size_bits)
}

fn fresh_object(kind: ObjectKind, size_bits: u8) -> KernelObject {
    match kind {
        ObjectKind::Untyped => KernelObject::Untyped(Untyped::new(size_bits)),
        ObjectKind::Endpoint => KernelObject::Endpoint(Endpoint::new()),
        ObjectKind::Notification => KernelObject::Notification(Notification::new()),
        ObjectKind::Tcb => KernelObject::Tcb(Tcb::new()),
        ObjectKind::CNode => KernelObject::CNode(CNode::new(size_bits)),
    }
}

/// Carve `dest.len()` fresh objects of `kind` out of the Untyped in
/// `src`, installing a full-rights capability to each in order.
///
/// All-or-nothing: destination slots are validated and the watermark
/// run is claimed before any object is created.
pub(crate) fn retype(
    state: &mut KernelState,
    src: SlotRef,
    kind: ObjectKind,
    size_bits: u8,
    dest: &[SlotRef],
) -> Result<Outcome, KernelError> {
    let cap = state.cap_checked(src, CapRights::WRITE, ObjectKind::Untyped)?;
    if dest.is_empty() {
        return Err(KernelError::InvalidArgument);
    }
    for (i, &d) in dest.iter().enumerate() {
        if dest[..i].contains(&d) {
            return Err(KernelError::InvalidArgument);
        }
        if !state.slot_is_empty(d)? {
            return Err(KernelError::SlotInUse);
        }
    }

    let size = object_size(kind, size_bits)?;
    let align = object_alignment(kind, size_bits)?;
    let total = size
        .checked_mul(dest.len())
        .ok_or(KernelError::NotEnoughMemory)?;
    state
        .objects
        .untyped_mut(cap.object)?
        .try_allocate(total, align)?;

    for &d in dest {
        let obj = state
            .objects
            .insert(fresh_object(kind, size_bits), Some(cap.object));
        state.install_cap(d, obj, CapRights::ALL, None, Some(cap.node))?;
    }
    Ok(Outcome::Unit)
}
