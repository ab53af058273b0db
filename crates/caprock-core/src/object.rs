//! Kernel object store
//!
//! All kernel-managed objects live in one arena indexed by stable
//! [`ObjRef`] handles. Entries are never moved; a freed index may be
//! reused only after every slot naming the object has been cleared.
//!
//! Each entry also carries the object-level derivation edges (which
//! Untyped region an object was carved from, and which objects were
//! carved from an Untyped) and a count of the capability slots naming
//! it. Revocation walks these indices instead of chasing pointers.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::cspace::CNode;
use crate::endpoint::Endpoint;
use crate::notification::Notification;
use crate::tcb::Tcb;
use crate::types::{KernelError, ObjRef};
use crate::untyped::Untyped;

/// The closed set of kernel object kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    /// Raw memory not yet carved into typed objects.
    Untyped,
    /// Synchronous rendezvous IPC endpoint.
    Endpoint,
    /// Asynchronous badge-aggregating notification.
    Notification,
    /// Execution context (thread control block).
    Tcb,
    /// Capability-space node.
    CNode,
}

/// A kernel object, tagged over the closed kind set.
#[derive(Clone, Debug)]
pub enum KernelObject {
    Untyped(Untyped),
    Endpoint(Endpoint),
    Notification(Notification),
    Tcb(Tcb),
    CNode(CNode),
}

impl KernelObject {
    /// The kind tag of this object.
    pub fn kind(&self) -> ObjectKind {
        match self {
            KernelObject::Untyped(_) => ObjectKind::Untyped,
            KernelObject::Endpoint(_) => ObjectKind::Endpoint,
            KernelObject::Notification(_) => ObjectKind::Notification,
            KernelObject::Tcb(_) => ObjectKind::Tcb,
            KernelObject::CNode(_) => ObjectKind::CNode,
        }
    }
}

/// Arena entry: the object plus its derivation edges and slot count.
#[derive(Clone, Debug)]
pub struct ObjectEntry {
    /// The object payload.
    pub object: KernelObject,
    /// The Untyped this object was retyped from, if any.
    pub parent: Option<ObjRef>,
    /// Objects retyped from this one (Untyped only).
    pub children: Vec<ObjRef>,
    /// Number of capability slots currently naming this object.
    pub slot_refs: u32,
}

/// The object arena.
#[derive(Debug)]
pub struct ObjectTable {
    entries: Vec<Option<ObjectEntry>>,
    free: Vec<u32>,
}

impl ObjectTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }

    /// Insert an object, linking it under `parent`'s children if given.
    pub fn insert(&mut self, object: KernelObject, parent: Option<ObjRef>) -> ObjRef {
        let entry = ObjectEntry {
            object,
            parent,
            children: Vec::new(),
            slot_refs: 0,
        };
        let index = match self.free.pop() {
            Some(i) => {
                self.entries[i as usize] = Some(entry);
                i
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };
        let obj = ObjRef(index);
        if let Some(p) = parent {
            if let Some(pe) = self.get_mut(p) {
                pe.children.push(obj);
            }
        }
        obj
    }

    /// Get an entry.
    pub fn get(&self, obj: ObjRef) -> Option<&ObjectEntry> {
        self.entries.get(obj.0 as usize).and_then(|e| e.as_ref())
    }

    /// Get a mutable entry.
    pub fn get_mut(&mut self, obj: ObjRef) -> Option<&mut ObjectEntry> {
        self.entries.get_mut(obj.0 as usize).and_then(|e| e.as_mut())
    }

    /// Object kind, if the entry is live.
    pub fn kind(&self, obj: ObjRef) -> Option<ObjectKind> {
        self.get(obj).map(|e| e.object.kind())
    }

    /// True if the entry is live.
    pub fn contains(&self, obj: ObjRef) -> bool {
        self.get(obj).is_some()
    }

    /// Remove an entry, unlinking it from its parent's children.
    ///
    /// When the removal leaves an Untyped parent childless, the
    /// parent's watermark resets: the region is reclaimable again.
    pub fn remove(&mut self, obj: ObjRef) -> Option<ObjectEntry> {
        let entry = self.entries.get_mut(obj.0 as usize)?.take()?;
        self.free.push(obj.0);
        if let Some(p) = entry.parent {
            if let Some(pe) = self.get_mut(p) {
                pe.children.retain(|&c| c != obj);
                if pe.children.is_empty() {
                    if let KernelObject::Untyped(ref mut ut) = pe.object {
                        ut.reset();
                    }
                }
            }
        }
        Some(entry)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// True if no entries are live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate live entries.
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, &ObjectEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|e| (ObjRef(i as u32), e)))
    }

    /// Bump the slot reference count.
    pub fn inc_refs(&mut self, obj: ObjRef) {
        if let Some(e) = self.get_mut(obj) {
            e.slot_refs += 1;
        }
    }

    /// Drop one slot reference; returns the remaining count (0 if the
    /// entry is already gone).
    pub fn dec_refs(&mut self, obj: ObjRef) -> u32 {
        match self.get_mut(obj) {
            Some(e) => {
                e.slot_refs = e.slot_refs.saturating_sub(1);
                e.slot_refs
            }
            None => 0,
        }
    }

    // ========================================================================
    // Typed accessors - each operation site dispatches on kind through
    // one of these, so a kind mismatch is always InvalidCapability.
    // ========================================================================

    pub fn untyped(&self, obj: ObjRef) -> Result<&Untyped, KernelError> {
        match self.get(obj).map(|e| &e.object) {
            Some(KernelObject::Untyped(u)) => Ok(u),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn untyped_mut(&mut self, obj: ObjRef) -> Result<&mut Untyped, KernelError> {
        match self.get_mut(obj).map(|e| &mut e.object) {
            Some(KernelObject::Untyped(u)) => Ok(u),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn endpoint_mut(&mut self, obj: ObjRef) -> Result<&mut Endpoint, KernelError> {
        match self.get_mut(obj).map(|e| &mut e.object) {
            Some(KernelObject::Endpoint(ep)) => Ok(ep),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn notification_mut(&mut self, obj: ObjRef) -> Result<&mut Notification, KernelError> {
        match self.get_mut(obj).map(|e| &mut e.object) {
            Some(KernelObject::Notification(n)) => Ok(n),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn tcb(&self, obj: ObjRef) -> Result<&Tcb, KernelError> {
        match self.get(obj).map(|e| &e.object) {
            Some(KernelObject::Tcb(t)) => Ok(t),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn tcb_mut(&mut self, obj: ObjRef) -> Result<&mut Tcb, KernelError> {
        match self.get_mut(obj).map(|e| &mut e.object) {
            Some(KernelObject::Tcb(t)) => Ok(t),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn cnode(&self, obj: ObjRef) -> Result<&CNode, KernelError> {
        match self.get(obj).map(|e| &e.object) {
            Some(KernelObject::CNode(c)) => Ok(c),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }

    pub fn cnode_mut(&mut self, obj: ObjRef) -> Result<&mut CNode, KernelError> {
        match self.get_mut(obj).map(|e| &mut e.object) {
            Some(KernelObject::CNode(c)) => Ok(c),
            Some(_) => Err(KernelError::InvalidCapability),
            None => Err(KernelError::FailedLookup),
        }
    }
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let mut table = ObjectTable::new();
        let ep = table.insert(KernelObject::Endpoint(Endpoint::new()), None);

        assert!(table.contains(ep));
        assert_eq!(table.kind(ep), Some(ObjectKind::Endpoint));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parent_child_linking() {
        let mut table = ObjectTable::new();
        let ut = table.insert(KernelObject::Untyped(Untyped::new(12)), None);
        let ep = table.insert(KernelObject::Endpoint(Endpoint::new()), Some(ut));

        assert_eq!(table.get(ut).unwrap().children, alloc::vec![ep]);
        assert_eq!(table.get(ep).unwrap().parent, Some(ut));
    }

    #[test]
    fn test_remove_resets_childless_untyped() {
        let mut table = ObjectTable::new();
        let ut = table.insert(KernelObject::Untyped(Untyped::new(12)), None);
        table.untyped_mut(ut).unwrap().try_allocate(64, 64).unwrap();
        let ep = table.insert(KernelObject::Endpoint(Endpoint::new()), Some(ut));
        assert_ne!(table.untyped(ut).unwrap().cursor(), 0);

        table.remove(ep);

        assert!(table.get(ut).unwrap().children.is_empty());
        assert_eq!(table.untyped(ut).unwrap().cursor(), 0);
    }

    #[test]
    fn test_index_reuse_after_remove() {
        let mut table = ObjectTable::new();
        let a = table.insert(KernelObject::Endpoint(Endpoint::new()), None);
        table.remove(a);
        let b = table.insert(KernelObject::Notification(Notification::new()), None);

        // Freed index is reused, and the new entry has the new kind.
        assert_eq!(a, b);
        assert_eq!(table.kind(b), Some(ObjectKind::Notification));
    }

    #[test]
    fn test_ref_counting() {
        let mut table = ObjectTable::new();
        let ep = table.insert(KernelObject::Endpoint(Endpoint::new()), None);

        table.inc_refs(ep);
        table.inc_refs(ep);
        assert_eq!(table.get(ep).unwrap().slot_refs, 2);
        assert_eq!(table.dec_refs(ep), 1);
        assert_eq!(table.dec_refs(ep), 0);
        assert_eq!(table.dec_refs(ep), 0); // saturates
    }

    #[test]
    fn test_typed_accessor_kind_mismatch() {
        let mut table = ObjectTable::new();
        let ep = table.insert(KernelObject::Endpoint(Endpoint::new()), None);

        assert_eq!(table.untyped(ep).unwrap_err(), KernelError::InvalidCapability);
        assert_eq!(table.tcb(ep).unwrap_err(), KernelError::InvalidCapability);
        assert_eq!(
            table.untyped(ObjRef(99)).unwrap_err(),
            KernelError::FailedLookup
        );
    }
}
