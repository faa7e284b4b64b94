//! Non-heap roots.
//!
//! The runtime exposes its roots (frames, class table, string table, native
//! handles) through [`RootProvider`]. The visitor receives each root slot by
//! mutable reference so that evacuation can store forwarded addresses back.

use parking_lot::Mutex;

use crate::address::Address;

/// Kind of a root slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RootType {
    /// Interpreter or compiled frame slot
    Frame,
    /// Class table entry
    ClassTable,
    /// Interned string
    StringTable,
    /// Native handle
    Handle,
}

impl RootType {
    /// Roots that concurrent marking re-scans without a pause.
    pub fn is_concurrent(self) -> bool {
        matches!(self, RootType::ClassTable | RootType::StringTable)
    }
}

/// Source of non-heap roots.
pub trait RootProvider: Send + Sync {
    /// Visit every root slot; null slots may be skipped.
    fn visit_roots(&self, visitor: &mut dyn FnMut(RootType, &mut Address));
}

/// Index of a slot in a [`HandleTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

/// Growable table of root slots.
pub struct HandleTable {
    kind: RootType,
    slots: Mutex<Vec<Option<Address>>>,
}

impl HandleTable {
    /// Empty table whose slots report `kind`.
    pub fn new(kind: RootType) -> Self {
        Self {
            kind,
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Root `addr`.
    pub fn create(&self, addr: Address) -> Handle {
        let mut slots = self.slots.lock();
        if let Some(free) = slots.iter().position(Option::is_none) {
            slots[free] = Some(addr);
            return Handle(free);
        }
        slots.push(Some(addr));
        Handle(slots.len() - 1)
    }

    /// Current value of a handle.
    pub fn get(&self, handle: Handle) -> Address {
        self.slots
            .lock()
            .get(handle.0)
            .copied()
            .flatten()
            .unwrap_or(Address::NULL)
    }

    /// Overwrite a handle.
    pub fn set(&self, handle: Handle, addr: Address) {
        if let Some(slot) = self.slots.lock().get_mut(handle.0) {
            *slot = Some(addr);
        }
    }

    /// Drop a handle.
    pub fn release(&self, handle: Handle) {
        if let Some(slot) = self.slots.lock().get_mut(handle.0) {
            *slot = None;
        }
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.is_some()).count()
    }

    /// Whether the table holds no handle.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RootProvider for HandleTable {
    fn visit_roots(&self, visitor: &mut dyn FnMut(RootType, &mut Address)) {
        for slot in self.slots.lock().iter_mut().flatten() {
            if !slot.is_null() {
                visitor(self.kind, slot);
            }
        }
    }
}
