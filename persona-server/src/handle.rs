//! Per-process handle-table shim.
//!
//! The real handle table is an external collaborator; the core needs
//! just enough of it to resolve, allocate, duplicate and close handles
//! with access checks. Handles encode the slot index scaled by four,
//! matching the ticket-id texture on the wire.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use persona_protocol::status::SvcResult;
use persona_protocol::{AccessMask, Handle, Status};

use crate::object::SyncObject;

struct HandleEntry {
    obj: Rc<dyn SyncObject>,
    access: AccessMask,
}

/// Handle table of one process.
#[derive(Default)]
pub struct HandleTable {
    entries: RefCell<Vec<Option<HandleEntry>>>,
}

impl HandleTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle to `obj`. Generic access bits are mapped to
    /// object-specific rights before they are stored.
    pub fn alloc(&self, obj: Rc<dyn SyncObject>, access: AccessMask) -> Handle {
        let access = if access.has_generic() { obj.map_access(access) } else { access };
        let entry = HandleEntry { obj, access };
        let mut entries = self.entries.borrow_mut();
        for (index, slot) in entries.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(entry);
                return index_to_handle(index);
            }
        }
        entries.push(Some(entry));
        index_to_handle(entries.len() - 1)
    }

    /// Resolve a handle, checking that it grants `access`.
    pub fn get(&self, handle: Handle, access: AccessMask) -> SvcResult<Rc<dyn SyncObject>> {
        let entries = self.entries.borrow();
        let entry = handle_to_index(handle)
            .and_then(|index| entries.get(index))
            .and_then(|slot| slot.as_ref())
            .ok_or(Status::INVALID_HANDLE)?;
        if !entry.access.contains(access) {
            return Err(Status::ACCESS_DENIED);
        }
        Ok(entry.obj.clone())
    }

    /// Access rights granted to a handle.
    pub fn get_access(&self, handle: Handle) -> SvcResult<AccessMask> {
        let entries = self.entries.borrow();
        handle_to_index(handle)
            .and_then(|index| entries.get(index))
            .and_then(|slot| slot.as_ref())
            .map(|entry| entry.access)
            .ok_or(Status::INVALID_HANDLE)
    }

    /// Close a handle, dropping its reference to the object.
    pub fn close(&self, handle: Handle) -> SvcResult<()> {
        let entry = {
            let mut entries = self.entries.borrow_mut();
            handle_to_index(handle)
                .and_then(|index| entries.get_mut(index))
                .and_then(Option::take)
        };
        // The object reference drops outside the borrow: the close may
        // destroy the object and destruction can re-enter the table.
        match entry {
            Some(_) => Ok(()),
            None => Err(Status::INVALID_HANDLE),
        }
    }

    /// Duplicate `handle` into `dst` with the same access rights.
    pub fn duplicate_same_access(&self, handle: Handle, dst: &HandleTable) -> SvcResult<Handle> {
        let (obj, access) = {
            let entries = self.entries.borrow();
            let entry = handle_to_index(handle)
                .and_then(|index| entries.get(index))
                .and_then(|slot| slot.as_ref())
                .ok_or(Status::INVALID_HANDLE)?;
            (entry.obj.clone(), entry.access)
        };
        Ok(dst.alloc(obj, access))
    }

    /// Number of open handles.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.entries.borrow().iter().filter(|slot| slot.is_some()).count()
    }
}

/// Resolve a handle to a concrete object kind.
pub fn get_handle_obj<T: SyncObject>(
    table: &HandleTable,
    handle: Handle,
    access: AccessMask,
) -> SvcResult<Rc<T>> {
    let obj = table.get(handle, access)?;
    downcast_obj(obj)
}

/// Downcast a shared object to a concrete kind.
pub fn downcast_obj<T: SyncObject>(obj: Rc<dyn SyncObject>) -> SvcResult<Rc<T>> {
    obj.as_any_rc()
        .downcast::<T>()
        .map_err(|_| Status::OBJECT_TYPE_MISMATCH)
}

#[inline]
const fn index_to_handle(index: usize) -> Handle {
    Handle::from_raw(((index as u32) + 1) << 2)
}

#[inline]
const fn handle_to_index(handle: Handle) -> Option<usize> {
    let raw = handle.raw();
    if raw == 0 || raw & 3 != 0 {
        return None;
    }
    Some(((raw >> 2) - 1) as usize)
}
