//! Capability access rights
//!
//! Rights are orthogonal and can be independently attenuated (reduced)
//! but never escalated. Interpretation is object-kind specific:
//!
//! - **Read**: receive from an endpoint, wait on a notification
//! - **Write**: send to an endpoint, signal a notification
//! - **Grant**: transfer capabilities through IPC

use core::fmt;
use core::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

/// Access rights for capabilities, packed into a single byte.
///
/// Layout:
/// - Bit 0: Read
/// - Bit 1: Write
/// - Bit 2: Grant
/// - Bits 3-7: reserved, must be zero
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct CapRights(u8);

impl CapRights {
    /// No rights.
    pub const NONE: Self = Self(0);

    /// Read permission (receive / wait).
    pub const READ: Self = Self(1 << 0);

    /// Write permission (send / signal).
    pub const WRITE: Self = Self(1 << 1);

    /// Grant permission (capability transfer through IPC).
    pub const GRANT: Self = Self(1 << 2);

    /// All rights.
    pub const ALL: Self = Self(0b111);

    /// Raw byte value.
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Build from a raw byte, masking reserved bits.
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    /// True if every right in `other` is present in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if `self` grants nothing `other` does not.
    pub const fn is_subset_of(self, other: Self) -> bool {
        other.contains(self)
    }

    /// Intersection of two right sets. Derived capabilities always go
    /// through this, which is what makes escalation impossible.
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }
}

impl BitOr for CapRights {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for CapRights {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl fmt::Debug for CapRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Self::READ) { 'r' } else { '-' },
            if self.contains(Self::WRITE) { 'w' } else { '-' },
            if self.contains(Self::GRANT) { 'g' } else { '-' },
        )
    }
}
