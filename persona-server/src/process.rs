//! Process collaborator shim.
//!
//! The process object proper lives outside the core; this shim carries
//! exactly the state the thread core reads and writes: affinity and
//! priority class bounds, the process suspend counter, CPU type, the
//! per-process thread list, the handle table and the primary token.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use persona_protocol::status::SvcResult;
use persona_protocol::{Abstime, Affinity, ClientPtr, CpuType, PriorityClass, Ptid, Status};

use crate::handle::HandleTable;
use crate::object::{SyncObject, WaitQueue};
use crate::registry::RegistryState;
use crate::server::Server;
use crate::thread::Thread;
use crate::token::Token;

/// A client process, as seen by the thread core.
pub struct Process {
    pub(crate) id: Cell<Ptid>,
    pub(crate) registry: Weak<RefCell<RegistryState>>,
    pub(crate) unix_pid: Cell<Option<i32>>,
    pub(crate) affinity: Cell<Affinity>,
    pub(crate) suspend: Cell<i32>,
    pub(crate) priority: Cell<PriorityClass>,
    pub(crate) cpu: Cell<Option<CpuType>>,
    pub(crate) peb: Cell<ClientPtr>,
    pub(crate) init_done: Cell<bool>,
    pub(crate) is_terminating: Cell<bool>,
    pub(crate) running_threads: Cell<u32>,
    pub(crate) threads: RefCell<Vec<Rc<Thread>>>,
    pub(crate) handles: HandleTable,
    pub(crate) token: RefCell<Option<Rc<Token>>>,
    pub(crate) desktop: Cell<u32>,
    pub(crate) has_parent: bool,
    pub(crate) start_time: Abstime,
    queue: WaitQueue,
}

/// Create a process and register it in the ticket namespace.
pub fn create_process(srv: &Server, parent: Option<&Rc<Process>>) -> SvcResult<Rc<Process>> {
    let process = Rc::new(Process {
        id: Cell::new(0),
        registry: Rc::downgrade(srv.registry().state()),
        unix_pid: Cell::new(None),
        affinity: Cell::new(parent.map_or(!0, |p| p.affinity.get())),
        suspend: Cell::new(0),
        priority: Cell::new(parent.map_or(PriorityClass::Normal, |p| p.priority.get())),
        cpu: Cell::new(None),
        peb: Cell::new(0),
        init_done: Cell::new(false),
        is_terminating: Cell::new(false),
        running_threads: Cell::new(0),
        threads: RefCell::new(Vec::new()),
        handles: HandleTable::new(),
        token: RefCell::new(None),
        desktop: Cell::new(parent.map_or(0, |p| p.desktop.get())),
        has_parent: parent.is_some(),
        start_time: srv.now(),
        queue: WaitQueue::new(),
    });
    let id = srv.registry().insert_process(&process).ok_or(Status::NO_MEMORY)?;
    process.id.set(id);
    log::debug!("{:04x}: process created", id);
    Ok(process)
}

impl Process {
    /// Ticket id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Ptid {
        self.id.get()
    }

    /// Handle table.
    #[inline]
    #[must_use]
    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Process affinity mask.
    #[inline]
    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.affinity.get()
    }

    /// Priority class.
    #[inline]
    #[must_use]
    pub fn priority_class(&self) -> PriorityClass {
        self.priority.get()
    }

    /// CPU type, fixed by the first thread's initialisation.
    #[inline]
    #[must_use]
    pub fn cpu(&self) -> Option<CpuType> {
        self.cpu.get()
    }

    /// Check whether process bootstrap finished.
    #[inline]
    #[must_use]
    pub fn is_init_done(&self) -> bool {
        self.init_done.get()
    }

    /// Threads that have not terminated.
    #[inline]
    #[must_use]
    pub fn running_threads(&self) -> u32 {
        self.running_threads.get()
    }

    /// Mark the process as exiting; thread creation fails from here on.
    pub fn set_terminating(&self) {
        self.is_terminating.set(true);
    }

    /// Primary token, if one is installed.
    #[must_use]
    pub fn token(&self) -> Option<Rc<Token>> {
        self.token.borrow().clone()
    }

    /// Threads of this process, creation order.
    pub fn threads(&self) -> Vec<Rc<Thread>> {
        self.threads.borrow().clone()
    }

    /// Attach a new thread. The process holds the creation reference.
    pub(crate) fn add_thread(&self, thread: Rc<Thread>) {
        self.running_threads.set(self.running_threads.get() + 1);
        self.threads.borrow_mut().push(thread);
    }

    /// Detach a dead thread, dropping the creation reference.
    pub(crate) fn remove_thread(&self, thread: &Thread) {
        let removed = {
            let mut threads = self.threads.borrow_mut();
            let before = threads.len();
            threads.retain(|t| !std::ptr::eq(Rc::as_ptr(t), thread));
            before != threads.len()
        };
        if removed {
            self.running_threads.set(self.running_threads.get().saturating_sub(1));
        }
    }
}

impl SyncObject for Process {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        format!(
            "process id={:04x} running={} suspend={}",
            self.id(),
            self.running_threads.get(),
            self.suspend.get()
        )
    }

    fn signaled(&self, _waiter: &Thread) -> bool {
        self.running_threads.get() == 0 && self.init_done.get()
    }

    fn map_access(&self, access: persona_protocol::AccessMask) -> persona_protocol::AccessMask {
        access.map_process_generic()
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if self.id.get() != 0 {
                registry.borrow_mut().table.free(self.id.get());
            }
        }
    }
}
