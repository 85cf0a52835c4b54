//! Thread registry.
//!
//! Tracks every live thread: the global list (newest first), the shared
//! ticket table that maps ids to threads and processes, and an optional
//! hash index from OS pid to ticket id. Lookups by id go through the
//! ticket table and report `INVALID_CID` on miss; lookups by OS tid walk
//! the list (bounded by client count). The pid index exists for hosts
//! where other kernel threads consult the registry concurrently, so it
//! alone is behind a reader-writer lock: writers exclude readers and
//! each other, readers do not exclude readers.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use persona_protocol::status::SvcResult;
use persona_protocol::{Ptid, Status};
use spin::RwLock;

use crate::process::Process;
use crate::thread::{Thread, ThreadState};
use crate::ticket::{TicketSlot, TicketTable};

/// Shared registry storage. Threads and processes keep a weak link back
/// here so destruction can return their ticket and list entry.
pub(crate) struct RegistryState {
    pub(crate) table: TicketTable,
    pub(crate) threads: Vec<Weak<Thread>>,
}

impl RegistryState {
    /// Remove a thread's list entry by address.
    pub(crate) fn unlink_thread(&mut self, thread: *const Thread) {
        self.threads.retain(|w| !std::ptr::eq(w.as_ptr(), thread));
    }
}

/// One row of a [`Registry::snapshot`].
pub struct ThreadSnapshot {
    /// The thread.
    pub thread: Rc<Thread>,
    /// Reference count at snapshot time.
    pub refcount: usize,
    /// Scheduling priority at snapshot time.
    pub priority: i32,
}

/// The thread registry.
pub struct Registry {
    state: Rc<RefCell<RegistryState>>,
    pid_index: RwLock<HashMap<i32, Ptid>>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RegistryState {
                table: TicketTable::new(),
                threads: Vec::new(),
            })),
            pid_index: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn state(&self) -> &Rc<RefCell<RegistryState>> {
        &self.state
    }

    /// Insert a new thread at the head of the global list and allocate
    /// its ticket. Returns the id, or `None` with the list entry rolled
    /// back when the namespace is exhausted.
    pub(crate) fn insert_thread(&self, thread: &Rc<Thread>) -> Option<Ptid> {
        let mut state = self.state.borrow_mut();
        state.threads.insert(0, Rc::downgrade(thread));
        match state.table.alloc(TicketSlot::Thread(Rc::downgrade(thread))) {
            Some(id) => Some(id),
            None => {
                state.unlink_thread(Rc::as_ptr(thread));
                None
            }
        }
    }

    /// Allocate a ticket for a process.
    pub(crate) fn insert_process(&self, process: &Rc<Process>) -> Option<Ptid> {
        self.state
            .borrow_mut()
            .table
            .alloc(TicketSlot::Process(Rc::downgrade(process)))
    }

    /// Get a thread from its ticket id.
    pub fn get_thread_from_id(&self, id: Ptid) -> SvcResult<Rc<Thread>> {
        let state = self.state.borrow();
        match state.table.get(id) {
            Some(TicketSlot::Thread(weak)) => weak.upgrade().ok_or(Status::INVALID_CID),
            _ => Err(Status::INVALID_CID),
        }
    }

    /// Get a process from its ticket id.
    pub fn get_process_from_id(&self, id: Ptid) -> SvcResult<Rc<Process>> {
        let state = self.state.borrow();
        match state.table.get(id) {
            Some(TicketSlot::Process(weak)) => weak.upgrade().ok_or(Status::INVALID_CID),
            _ => Err(Status::INVALID_CID),
        }
    }

    /// Find a thread from its OS tid.
    pub fn get_thread_from_tid(&self, tid: i32) -> Option<Rc<Thread>> {
        self.live_threads()
            .into_iter()
            .find(|t| t.unix_tid() == Some(tid))
    }

    /// Find a thread from its OS pid.
    ///
    /// The hash index is consulted first; threads the index does not
    /// cover are found by walking the list.
    pub fn get_thread_from_pid(&self, pid: i32) -> Option<Rc<Thread>> {
        if let Some(&id) = self.pid_index.read().get(&pid) {
            if let Ok(thread) = self.get_thread_from_id(id) {
                return Some(thread);
            }
        }
        self.live_threads()
            .into_iter()
            .find(|t| t.unix_pid() == Some(pid))
    }

    /// Record the OS pid of an initialised thread. First writer wins;
    /// later threads of the same process stay reachable via the list.
    pub(crate) fn index_unix_pid(&self, pid: i32, id: Ptid) {
        self.pid_index.write().entry(pid).or_insert(id);
    }

    /// Drop a dying thread's pid-index entry, if it owns one.
    pub(crate) fn drop_unix_pid(&self, thread: &Thread) {
        let Some(pid) = thread.unix_pid() else { return };
        let mut index = self.pid_index.write();
        if index.get(&pid) == Some(&thread.id()) {
            index.remove(&pid);
        }
    }

    /// Snapshot of all threads that have not terminated.
    pub fn snapshot(&self) -> Vec<ThreadSnapshot> {
        self.live_threads()
            .into_iter()
            .filter(|t| t.state() != ThreadState::Terminated)
            .map(|thread| {
                let refcount = Rc::strong_count(&thread);
                let priority = thread.priority();
                ThreadSnapshot { thread, refcount, priority }
            })
            .collect()
    }

    /// Every live thread, list order (newest first).
    pub fn live_threads(&self) -> Vec<Rc<Thread>> {
        self.state
            .borrow()
            .threads
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Number of live tickets, threads and processes together.
    #[must_use]
    pub fn ticket_count(&self) -> usize {
        self.state.borrow().table.allocated()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
