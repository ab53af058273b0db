//! Capability spaces and the derivation tree
//!
//! A capability is a slot-resident value: object handle, rights mask,
//! optional badge, and the node tying it into the derivation tree. The
//! tree records where every capability came from (retype, copy, mint)
//! so that Revoke can find all descendants and Delete can splice a
//! single generation out without orphaning the rest.
//!
//! Invariants maintained here:
//! - every occupied slot's capability names a live tree node, and that
//!   node's recorded slot points back at the occupying slot;
//! - rights only ever shrink along a tree edge;
//! - a badge is attached at most once on any root-to-leaf path.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::object::ObjectKind;
use crate::rights::CapRights;
use crate::state::KernelState;
use crate::step::Outcome;
use crate::types::{Badge, KernelError, ObjRef, SlotRef};

/// Handle into the derivation tree arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DerivId(pub u32);

/// A capability: unforgeable authority over one kernel object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub object: ObjRef,
    pub rights: CapRights,
    /// `None` until minted; minting is a one-way door.
    pub badge: Option<Badge>,
    /// This capability's node in the derivation tree.
    pub node: DerivId,
}

/// Fixed-size table of capability slots.
#[derive(Clone, Debug)]
pub struct CNode {
    radix: u8,
    slots: Vec<Option<Capability>>,
}

/// CNode radix is bounded so `object_size` stays meaningful.
pub const CNODE_RADIX_MIN: u8 = 1;
pub const CNODE_RADIX_MAX: u8 = 12;

impl CNode {
    /// A CNode with `1 << radix` slots, all empty.
    pub fn new(radix: u8) -> Self {
        Self {
            radix,
            slots: alloc::vec![None; 1usize << radix],
        }
    }

    pub fn radix(&self) -> u8 {
        self.radix
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: u32) -> Result<&Option<Capability>, KernelError> {
        self.slots
            .get(index as usize)
            .ok_or(KernelError::FailedLookup)
    }

    pub fn get_mut(&mut self, index: u32) -> Result<&mut Option<Capability>, KernelError> {
        self.slots
            .get_mut(index as usize)
            .ok_or(KernelError::FailedLookup)
    }

    /// Consume the CNode, yielding its slot contents. Used when the
    /// node is destroyed and its capabilities must be drained.
    pub fn into_slots(self) -> Vec<Option<Capability>> {
        self.slots
    }

    /// Indices of every occupied slot.
    pub fn occupied(&self) -> Vec<u32> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
            .collect()
    }
}

/// One derivation record: parent edge, children, and the slot the
/// capability currently sits in (kept current by Move).
#[derive(Clone, Debug)]
pub struct DerivNode {
    pub parent: Option<DerivId>,
    pub children: Vec<DerivId>,
    pub slot: SlotRef,
    pub object: ObjRef,
}

/// Arena for derivation records, with free-list index reuse.
#[derive(Debug)]
pub struct DerivTree {
    nodes: Vec<Option<DerivNode>>,
    free: Vec<u32>,
}

impl DerivTree {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert a node under `parent` (or as a root).
    pub fn insert(&mut self, parent: Option<DerivId>, slot: SlotRef, object: ObjRef) -> DerivId {
        let node = DerivNode {
            parent,
            children: Vec::new(),
            slot,
            object,
        };
        let index = match self.free.pop() {
            Some(i) => {
                self.nodes[i as usize] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                (self.nodes.len() - 1) as u32
            }
        };
        let id = DerivId(index);
        if let Some(p) = parent {
            if let Some(pn) = self.get_mut(p) {
                pn.children.push(id);
            }
        }
        id
    }

    pub fn get(&self, id: DerivId) -> Option<&DerivNode> {
        self.nodes.get(id.0 as usize).and_then(|n| n.as_ref())
    }

    pub fn get_mut(&mut self, id: DerivId) -> Option<&mut DerivNode> {
        self.nodes.get_mut(id.0 as usize).and_then(|n| n.as_mut())
    }

    pub fn contains(&self, id: DerivId) -> bool {
        self.get(id).is_some()
    }

    /// Record that the capability moved to a new slot.
    pub fn set_slot(&mut self, id: DerivId, slot: SlotRef) {
        if let Some(n) = self.get_mut(id) {
            n.slot = slot;
        }
    }

    /// Remove a node, reparenting its children onto its parent.
    ///
    /// This is the Delete semantics: grandchildren survive deletion of
    /// the middle generation and remain revocable from above.
    pub fn remove_splice(&mut self, id: DerivId) -> Option<DerivNode> {
        let node = self.nodes.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        if let Some(p) = node.parent {
            if let Some(pn) = self.get_mut(p) {
                pn.children.retain(|&c| c != id);
                pn.children.extend(node.children.iter().copied());
            }
        }
        for &c in &node.children {
            if let Some(cn) = self.get_mut(c) {
                cn.parent = node.parent;
            }
        }
        Some(node)
    }

    /// Remove a childless node. Used by Revoke, which visits leaves
    /// first, and by teardown paths that already emptied the subtree.
    pub fn remove_leaf(&mut self, id: DerivId) -> Option<DerivNode> {
        let node = self.nodes.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        if let Some(p) = node.parent {
            if let Some(pn) = self.get_mut(p) {
                pn.children.retain(|&c| c != id);
            }
        }
        Some(node)
    }

    /// Proper descendants of `id`, deepest first.
    ///
    /// Explicit work stack: derivation chains grow one node per Copy,
    /// so their depth is unbounded and must not hit the call stack.
    pub fn descendants_post_order(&self, id: DerivId) -> Vec<DerivId> {
        let mut out = Vec::new();
        let mut stack = alloc::vec![(id, false)];
        while let Some((n, expanded)) = stack.pop() {
            if expanded {
                out.push(n);
                continue;
            }
            if let Some(node) = self.get(n) {
                stack.push((n, true));
                for &c in node.children.iter().rev() {
                    stack.push((c, false));
                }
            }
        }
        out.pop(); // drop `id` itself
        out
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live nodes.
    pub fn iter(&self) -> impl Iterator<Item = (DerivId, &DerivNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (DerivId(i as u32), n)))
    }
}

impl Default for DerivTree {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Slot operations: Copy, Mint, Move
// ============================================================================

/// Derive a copy of `src` into `dest` with `rights` masked down.
pub(crate) fn cap_copy(
    state: &mut KernelState,
    src: SlotRef,
    dest: SlotRef,
    rights: CapRights,
) -> Result<Outcome, KernelError> {
    derive_into(state, src, dest, rights, None)
}

/// Like Copy, but attaches `badge`. Fails if `src` is already badged.
pub(crate) fn cap_mint(
    state: &mut KernelState,
    src: SlotRef,
    dest: SlotRef,
    rights: CapRights,
    badge: Badge,
) -> Result<Outcome, KernelError> {
    derive_into(state, src, dest, rights, Some(badge))
}

fn derive_into(
    state: &mut KernelState,
    src: SlotRef,
    dest: SlotRef,
    rights: CapRights,
    badge: Option<Badge>,
) -> Result<Outcome, KernelError> {
    let src_cap = state.lookup_cap(src)?;
    // The requested mask attenuates against the source; asking for
    // more than the source has yields less, never an error.
    let rights = rights.intersect(src_cap.rights);
    if badge.is_some() {
        // A badge can only be attached once along any derivation path.
        if src_cap.badge.is_some() {
            return Err(KernelError::InvalidArgument);
        }
        // Badging is an endpoint/notification concern.
        match state.objects.kind(src_cap.object) {
            Some(ObjectKind::Endpoint) | Some(ObjectKind::Notification) => {}
            _ => return Err(KernelError::InvalidArgument),
        }
    }
    if !state.slot_is_empty(dest)? {
        return Err(KernelError::SlotInUse);
    }
    let effective_badge = badge.or(src_cap.badge);
    state.install_cap(dest, src_cap.object, rights, effective_badge, Some(src_cap.node))?;
    Ok(Outcome::Unit)
}

/// Relocate the capability in `src` to `dest`, identity intact.
///
/// The derivation node travels with the capability: no new edge is
/// created and descendants stay attached.
pub(crate) fn cap_move(
    state: &mut KernelState,
    src: SlotRef,
    dest: SlotRef,
) -> Result<Outcome, KernelError> {
    state.lookup_cap(src)?;
    if !state.slot_is_empty(dest)? {
        return Err(KernelError::SlotInUse);
    }
    let cap = state
        .objects
        .cnode_mut(src.cnode)?
        .get_mut(src.index)?
        .take()
        .ok_or(KernelError::FailedLookup)?;
    state.derivs.set_slot(cap.node, dest);
    let dest_slot = state.objects.cnode_mut(dest.cnode)?.get_mut(dest.index)?;
    *dest_slot = Some(cap);
    Ok(Outcome::Unit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ObjRef;

    fn slot(cnode: u32, index: u32) -> SlotRef {
        SlotRef::new(ObjRef(cnode), index)
    }

    #[test]
    fn test_cnode_slot_bounds() {
        let node = CNode::new(3);
        assert_eq!(node.num_slots(), 8);
        assert!(node.get(7).is_ok());
        assert_eq!(node.get(8).unwrap_err(), KernelError::FailedLookup);
    }

    #[test]
    fn test_deriv_insert_links_parent() {
        let mut tree = DerivTree::new();
        let root = tree.insert(None, slot(0, 0), ObjRef(1));
        let child = tree.insert(Some(root), slot(0, 1), ObjRef(1));

        assert_eq!(tree.get(root).unwrap().children, alloc::vec![child]);
        assert_eq!(tree.get(child).unwrap().parent, Some(root));
    }

    #[test]
    fn test_remove_splice_reparents_grandchildren() {
        let mut tree = DerivTree::new();
        let root = tree.insert(None, slot(0, 0), ObjRef(1));
        let mid = tree.insert(Some(root), slot(0, 1), ObjRef(1));
        let leaf = tree.insert(Some(mid), slot(0, 2), ObjRef(1));

        tree.remove_splice(mid);

        assert_eq!(tree.get(leaf).unwrap().parent, Some(root));
        assert_eq!(tree.get(root).unwrap().children, alloc::vec![leaf]);
        assert!(!tree.contains(mid));
    }

    #[test]
    fn test_descendants_post_order_is_deepest_first() {
        let mut tree = DerivTree::new();
        let root = tree.insert(None, slot(0, 0), ObjRef(1));
        let a = tree.insert(Some(root), slot(0, 1), ObjRef(1));
        let b = tree.insert(Some(root), slot(0, 2), ObjRef(1));
        let a1 = tree.insert(Some(a), slot(0, 3), ObjRef(1));

        let order = tree.descendants_post_order(root);

        assert_eq!(order, alloc::vec![a1, a, b]);
    }

    #[test]
    fn test_post_order_survives_deep_chains() {
        let mut tree = DerivTree::new();
        let root = tree.insert(None, slot(0, 0), ObjRef(1));
        let mut tip = root;
        for i in 1..100_000u32 {
            tip = tree.insert(Some(tip), slot(0, i), ObjRef(1));
        }

        let order = tree.descendants_post_order(root);

        assert_eq!(order.len(), 99_999);
        assert_eq!(order[0], tip);
    }

    #[test]
    fn test_node_index_reuse() {
        let mut tree = DerivTree::new();
        let a = tree.insert(None, slot(0, 0), ObjRef(1));
        tree.remove_leaf(a);
        let b = tree.insert(None, slot(0, 5), ObjRef(2));

        assert_eq!(a, b);
        assert_eq!(tree.get(b).unwrap().object, ObjRef(2));
    }
}
