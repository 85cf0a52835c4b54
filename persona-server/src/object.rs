//! Polymorphic object model.
//!
//! Every waitable object implements [`SyncObject`] and embeds a
//! [`WaitQueue`]. Objects are shared as `Rc<dyn SyncObject>`; the strong
//! count is the object's reference count and dropping the last reference
//! destroys it. New object kinds are added by collaborators outside this
//! crate, so the model is a trait, never a closed enum.
//!
//! # Wait-queue encoding
//!
//! A wait record and the queues of the objects it waits on form a
//! bipartite cycle. The thread side (the wait record) keeps the strong
//! reference to each object; the object side keeps a [`WaitRef`]: a weak
//! back reference to the thread plus a token that is unique to one
//! (wait record, entry) pair. A token appears in exactly one object
//! queue and belongs to exactly one live wait record.

use std::any::Any;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

use persona_protocol::{AccessMask, Status};

use crate::server::Server;
use crate::thread::Thread;

/// Object-side entry of the bipartite wait cycle.
#[derive(Clone)]
pub struct WaitRef {
    /// Thread owning the wait record this entry belongs to.
    pub(crate) thread: Weak<Thread>,
    /// Identity of the (wait record, entry) pair.
    pub(crate) token: u64,
}

/// Wait-queue head embedded in every waitable object.
///
/// Entries wake in insertion order.
#[derive(Default)]
pub struct WaitQueue {
    entries: RefCell<Vec<WaitRef>>,
}

impl WaitQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry at the tail.
    pub fn push(&self, entry: WaitRef) {
        self.entries.borrow_mut().push(entry);
    }

    /// Remove the entry carrying `token`, if present.
    pub fn remove(&self, token: u64) {
        self.entries.borrow_mut().retain(|e| e.token != token);
    }

    /// Check whether any waiter is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Copy out the entry at `index`. Fan-out iteration clones entries
    /// so no borrow is held while waiters run.
    pub(crate) fn entry_at(&self, index: usize) -> Option<WaitRef> {
        self.entries.borrow().get(index).cloned()
    }

    /// Check whether `token` is queued. Used by invariant tests.
    #[must_use]
    pub fn contains(&self, token: u64) -> bool {
        self.entries.borrow().iter().any(|e| e.token == token)
    }
}

/// Virtual operations of a waitable object.
pub trait SyncObject: Any {
    /// The embedded wait-queue head.
    fn queue(&self) -> &WaitQueue;

    /// One-line state description for debug dumps.
    fn dump(&self) -> String;

    /// Check whether the object is signalled for `waiter`.
    ///
    /// Must not mutate observable state; auto-reset behaviour belongs in
    /// [`satisfied`](Self::satisfied).
    fn signaled(&self, waiter: &Thread) -> bool;

    /// Consume the signal once the wait is granted.
    ///
    /// Returns `true` if the object was in the abandoned state, which
    /// colours the reported wake status.
    fn satisfied(&self, waiter: &Rc<Thread>) -> bool {
        let _ = waiter;
        false
    }

    /// Signal the object on behalf of `current` (signal-and-wait).
    fn signal(&self, srv: &Server, current: &Rc<Thread>, access: AccessMask) -> Result<(), Status> {
        let _ = (srv, current, access);
        Err(Status::OBJECT_TYPE_MISMATCH)
    }

    /// Map generic access bits to object-specific rights.
    fn map_access(&self, access: AccessMask) -> AccessMask {
        // Objects without their own rights grant only the standard bits.
        access.map_thread_generic()
    }

    /// Link a waiter into the wait queue. The strong reference lives in
    /// the caller's wait record.
    fn add_queue(&self, entry: WaitRef) -> Result<(), Status> {
        self.queue().push(entry);
        Ok(())
    }

    /// Unlink the waiter identified by `token`.
    fn remove_queue(&self, token: u64) {
        self.queue().remove(token);
    }

    /// View the object as `Rc<dyn Any>` for downcasting. Replaces the
    /// original vtable-pointer comparison when a handle must name a
    /// specific object kind.
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

impl std::fmt::Debug for dyn SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.dump())
    }
}

/// Check whether two shared objects are the same object.
#[inline]
#[must_use]
pub fn same_object(a: &Rc<dyn SyncObject>, b: &Rc<dyn SyncObject>) -> bool {
    std::ptr::eq(
        Rc::as_ptr(a) as *const u8,
        Rc::as_ptr(b) as *const u8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain {
        queue: WaitQueue,
    }

    impl SyncObject for Plain {
        fn queue(&self) -> &WaitQueue {
            &self.queue
        }

        fn dump(&self) -> String {
            "plain".into()
        }

        fn signaled(&self, _waiter: &Thread) -> bool {
            false
        }

        fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
            self
        }
    }

    #[test]
    fn test_queue_order_and_removal() {
        let queue = WaitQueue::new();
        for token in 1..=3 {
            queue.push(WaitRef { thread: Weak::new(), token });
        }
        assert_eq!(queue.len(), 3);
        queue.remove(2);
        assert_eq!(queue.entry_at(0).map(|e| e.token), Some(1));
        assert_eq!(queue.entry_at(1).map(|e| e.token), Some(3));
        assert!(!queue.contains(2));
    }

    #[test]
    fn test_same_object() {
        let a: Rc<dyn SyncObject> = Rc::new(Plain { queue: WaitQueue::new() });
        let b: Rc<dyn SyncObject> = Rc::new(Plain { queue: WaitQueue::new() });
        assert!(same_object(&a, &a.clone()));
        assert!(!same_object(&a, &b));
    }
}
