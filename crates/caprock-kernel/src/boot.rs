//! Boot protocol
//!
//! All authority in the system descends from the capabilities laid
//! down here. The root thread starts with its CNode's own capability
//! in slot 0, its TCB capability in slot 1, and one full-rights
//! Untyped capability per configured region from slot 2 upward.
//! Nothing else exists until the root thread retypes it.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use caprock_core::{
    CNode, KernelObject, KernelState, ObjRef, SlotRef, Tcb, ThreadId, Untyped,
    CapRights, ExecState, CNODE_RADIX_MAX, CNODE_RADIX_MIN, UNTYPED_BITS_MAX, UNTYPED_BITS_MIN,
};

/// Root CNode slot holding the CNode's capability to itself.
pub const BOOT_SLOT_CNODE: u32 = 0;
/// Root CNode slot holding the root thread's TCB capability.
pub const BOOT_SLOT_TCB: u32 = 1;
/// First root CNode slot holding an Untyped capability.
pub const BOOT_SLOT_UNTYPED: u32 = 2;

/// Initial system layout.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootConfig {
    /// Radix of the root CNode (`1 << radix` slots).
    pub root_cnode_radix: u8,
    /// Size in bits of each initial Untyped region.
    pub untyped_regions: Vec<u8>,
    /// Scheduling priority of the root thread.
    pub root_priority: u8,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            root_cnode_radix: 8,
            untyped_regions: alloc::vec![20], // 1 MiB
            root_priority: 255,
        }
    }
}

/// What bootstrap handed the root thread.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootInfo {
    pub root_cnode: ObjRef,
    pub root_thread: ThreadId,
    /// Slots holding the initial Untyped capabilities, in order.
    pub untyped_slots: Vec<SlotRef>,
    /// First root CNode slot the root thread may use freely.
    pub first_free_slot: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootError {
    BadCNodeRadix,
    BadUntypedBits,
    NoUntypedRegions,
    /// More regions than the root CNode has slots for.
    TooManyRegions,
    /// A boot capability landed in an occupied slot.
    SlotConflict,
}

/// Build the initial state: root CNode, root TCB, untyped regions,
/// and the boot capabilities tying them together.
pub fn bootstrap(config: &BootConfig) -> Result<(KernelState, BootInfo), BootError> {
    if !(CNODE_RADIX_MIN..=CNODE_RADIX_MAX).contains(&config.root_cnode_radix) {
        return Err(BootError::BadCNodeRadix);
    }
    if config.untyped_regions.is_empty() {
        return Err(BootError::NoUntypedRegions);
    }
    for &bits in &config.untyped_regions {
        if !(UNTYPED_BITS_MIN..=UNTYPED_BITS_MAX).contains(&bits) {
            return Err(BootError::BadUntypedBits);
        }
    }
    let num_slots = 1usize << config.root_cnode_radix;
    if BOOT_SLOT_UNTYPED as usize + config.untyped_regions.len() > num_slots {
        return Err(BootError::TooManyRegions);
    }

    let mut state = KernelState::new();
    let cnode = state
        .objects
        .insert(KernelObject::CNode(CNode::new(config.root_cnode_radix)), None);
    let tcb_obj = state.objects.insert(KernelObject::Tcb(Tcb::new()), None);

    // Boot capabilities are derivation roots; install_cap cannot fail
    // here because every slot of a fresh CNode is empty.
    let install = |state: &mut KernelState, index: u32, obj: ObjRef| {
        state
            .install_cap(SlotRef::new(cnode, index), obj, CapRights::ALL, None, None)
            .map_err(|_| BootError::SlotConflict)
    };
    install(&mut state, BOOT_SLOT_CNODE, cnode)?;
    install(&mut state, BOOT_SLOT_TCB, tcb_obj)?;

    let mut untyped_slots = Vec::with_capacity(config.untyped_regions.len());
    for (i, &bits) in config.untyped_regions.iter().enumerate() {
        let ut = state
            .objects
            .insert(KernelObject::Untyped(Untyped::new(bits)), None);
        let index = BOOT_SLOT_UNTYPED + i as u32;
        install(&mut state, index, ut)?;
        untyped_slots.push(SlotRef::new(cnode, index));
    }

    let root_thread = ThreadId::from_obj(tcb_obj);
    let tcb = state
        .objects
        .tcb_mut(tcb_obj)
        .map_err(|_| BootError::SlotConflict)?;
    tcb.cspace_root = Some(cnode);
    tcb.priority = config.root_priority;
    tcb.exec = ExecState::Running;

    let info = BootInfo {
        root_cnode: cnode,
        root_thread,
        untyped_slots,
        first_free_slot: BOOT_SLOT_UNTYPED + config.untyped_regions.len() as u32,
    };
    Ok((state, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use caprock_core::{check_invariants, ObjectKind};

    #[test]
    fn test_bootstrap_layout() {
        let (state, info) = bootstrap(&BootConfig::default()).unwrap();

        let self_cap = state
            .lookup_cap(SlotRef::new(info.root_cnode, BOOT_SLOT_CNODE))
            .unwrap();
        assert_eq!(self_cap.object, info.root_cnode);
        assert_eq!(self_cap.rights, CapRights::ALL);

        let tcb_cap = state
            .lookup_cap(SlotRef::new(info.root_cnode, BOOT_SLOT_TCB))
            .unwrap();
        assert_eq!(tcb_cap.object, info.root_thread.obj_ref());

        assert_eq!(info.untyped_slots.len(), 1);
        let ut_cap = state.lookup_cap(info.untyped_slots[0]).unwrap();
        assert_eq!(state.objects.kind(ut_cap.object), Some(ObjectKind::Untyped));

        assert_eq!(info.first_free_slot, 3);
        check_invariants(&state).unwrap();
    }

    #[test]
    fn test_bootstrap_rejects_bad_config() {
        let mut config = BootConfig::default();
        config.root_cnode_radix = 0;
        assert_eq!(bootstrap(&config).unwrap_err(), BootError::BadCNodeRadix);

        let mut config = BootConfig::default();
        config.untyped_regions.clear();
        assert_eq!(bootstrap(&config).unwrap_err(), BootError::NoUntypedRegions);

        let mut config = BootConfig::default();
        config.untyped_regions = alloc::vec![2];
        assert_eq!(bootstrap(&config).unwrap_err(), BootError::BadUntypedBits);

        let mut config = BootConfig::default();
        config.root_cnode_radix = 2;
        config.untyped_regions = alloc::vec![16, 16, 16];
        assert_eq!(bootstrap(&config).unwrap_err(), BootError::TooManyRegions);
    }

    #[test]
    fn test_root_thread_is_runnable() {
        let (state, info) = bootstrap(&BootConfig::default()).unwrap();
        let tcb = state.thread(info.root_thread).unwrap();

        assert_eq!(tcb.exec, ExecState::Running);
        assert_eq!(tcb.cspace_root, Some(info.root_cnode));
        assert_eq!(tcb.priority, 255);
    }
}
