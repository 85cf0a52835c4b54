//! Waitable synchronization objects.
//!
//! Events, mutexes and semaphores are the objects clients wait on most.
//! The wait engine drives them through the [`SyncObject`] operations:
//! `signaled` probes without side effects, `satisfied` consumes the
//! signal once a wait is granted, `signal` supports signal-and-wait.
//!
//! Mutex ownership is thread-bound: the owner holds the strong
//! reference (so an owned mutex cannot be destroyed), the mutex keeps a
//! weak back reference. A thread dying with owned mutexes abandons
//! them; the next wait satisfied by an abandoned mutex is reported with
//! the abandoned status offset.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use persona_protocol::status::SvcResult;
use persona_protocol::{AccessMask, Status};

use crate::object::{SyncObject, WaitQueue};
use crate::server::Server;
use crate::thread::Thread;
use crate::wait::wake_up;

/// A manual- or auto-reset event.
pub struct Event {
    manual_reset: bool,
    signaled: Cell<bool>,
    queue: WaitQueue,
}

impl Event {
    /// Create an event.
    #[must_use]
    pub fn new(manual_reset: bool, initial_state: bool) -> Rc<Self> {
        Rc::new(Self { manual_reset, signaled: Cell::new(initial_state), queue: WaitQueue::new() })
    }

    /// Set the event and wake waiters.
    pub fn set(&self, srv: &Server) {
        self.signaled.set(true);
        wake_up(srv, self, 0);
    }

    /// Reset the event.
    pub fn reset(&self) {
        self.signaled.set(false);
    }

    /// Set, wake waiters, then reset.
    pub fn pulse(&self, srv: &Server) {
        self.signaled.set(true);
        wake_up(srv, self, 0);
        self.signaled.set(false);
    }

    /// Current signal state.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.signaled.get()
    }
}

impl SyncObject for Event {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        format!(
            "event manual={} signaled={}",
            self.manual_reset,
            self.signaled.get()
        )
    }

    fn signaled(&self, _waiter: &Thread) -> bool {
        self.signaled.get()
    }

    fn satisfied(&self, _waiter: &Rc<Thread>) -> bool {
        // An auto-reset event is consumed by the granted wait.
        if !self.manual_reset {
            self.signaled.set(false);
        }
        false
    }

    fn signal(&self, srv: &Server, _current: &Rc<Thread>, access: AccessMask) -> Result<(), Status> {
        if !access.contains(AccessMask::EVENT_MODIFY_STATE) {
            return Err(Status::ACCESS_DENIED);
        }
        self.set(srv);
        Ok(())
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// A recursive, abandonable mutex.
pub struct Mutex {
    me: Weak<Mutex>,
    owner: RefCell<Option<Weak<Thread>>>,
    count: Cell<u32>,
    abandoned: Cell<bool>,
    queue: WaitQueue,
}

impl Mutex {
    /// Create a mutex, optionally owned by `owner` with count one.
    #[must_use]
    pub fn new(owner: Option<&Rc<Thread>>) -> Rc<Self> {
        let mutex = Rc::new_cyclic(|me| Self {
            me: me.clone(),
            owner: RefCell::new(None),
            count: Cell::new(0),
            abandoned: Cell::new(false),
            queue: WaitQueue::new(),
        });
        if let Some(owner) = owner {
            mutex.count.set(1);
            *mutex.owner.borrow_mut() = Some(Rc::downgrade(owner));
            owner.held_mutexes.borrow_mut().push(mutex.clone());
        }
        mutex
    }

    fn is_owned_by(&self, thread: &Thread) -> bool {
        self.owner
            .borrow()
            .as_ref()
            .is_some_and(|owner| std::ptr::eq(owner.as_ptr(), thread))
    }

    /// Release one ownership count on behalf of `current`.
    pub fn release(&self, srv: &Server, current: &Rc<Thread>) -> SvcResult<()> {
        if self.count.get() == 0 || !self.is_owned_by(current) {
            return Err(Status::MUTANT_NOT_OWNED);
        }
        self.do_release(srv);
        Ok(())
    }

    fn do_release(&self, srv: &Server) {
        self.count.set(self.count.get() - 1);
        if self.count.get() == 0 {
            self.unlink_owner();
            wake_up(srv, self, 0);
        }
    }

    fn unlink_owner(&self) {
        let owner = self.owner.borrow_mut().take();
        if let Some(owner) = owner.and_then(|w| w.upgrade()) {
            let me = self.me.as_ptr();
            owner.held_mutexes.borrow_mut().retain(|m| !std::ptr::eq(Rc::as_ptr(m), me));
        }
    }

    fn abandon(&self, srv: &Server) {
        self.count.set(0);
        self.abandoned.set(true);
        *self.owner.borrow_mut() = None;
        wake_up(srv, self, 0);
    }

    /// Recursion count.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.get()
    }

    /// Check the abandoned flag.
    #[inline]
    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.get()
    }
}

impl SyncObject for Mutex {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        format!("mutex count={} abandoned={}", self.count.get(), self.abandoned.get())
    }

    fn signaled(&self, waiter: &Thread) -> bool {
        self.count.get() == 0 || self.is_owned_by(waiter)
    }

    fn satisfied(&self, waiter: &Rc<Thread>) -> bool {
        self.count.set(self.count.get() + 1);
        if self.owner.borrow().is_none() {
            *self.owner.borrow_mut() = Some(Rc::downgrade(waiter));
            if let Some(me) = self.me.upgrade() {
                waiter.held_mutexes.borrow_mut().push(me);
            }
        }
        // Whoever satisfies an abandoned mutex clears the flag but is
        // told about the previous owner's death.
        let was_abandoned = self.abandoned.get();
        self.abandoned.set(false);
        was_abandoned
    }

    fn signal(&self, srv: &Server, current: &Rc<Thread>, access: AccessMask) -> Result<(), Status> {
        if !access.contains(AccessMask::SYNCHRONIZE) {
            return Err(Status::ACCESS_DENIED);
        }
        self.release(srv, current)
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

/// Abandon every mutex held by a dying thread.
pub fn abandon_mutexes(srv: &Server, thread: &Thread) {
    let held: Vec<Rc<Mutex>> = thread.held_mutexes.borrow_mut().drain(..).collect();
    for mutex in held {
        mutex.abandon(srv);
    }
}

/// A counted semaphore.
pub struct Semaphore {
    count: Cell<u32>,
    max: u32,
    queue: WaitQueue,
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count.get())
            .field("max", &self.max)
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore with an initial and a maximum count.
    pub fn new(initial: u32, max: u32) -> SvcResult<Rc<Self>> {
        if max == 0 || initial > max {
            return Err(Status::INVALID_PARAMETER);
        }
        Ok(Rc::new(Self { count: Cell::new(initial), max, queue: WaitQueue::new() }))
    }

    /// Release `delta` counts, waking waiters. Returns the previous
    /// count.
    pub fn release(&self, srv: &Server, delta: u32) -> SvcResult<u32> {
        let previous = self.count.get();
        if delta > self.max - previous {
            return Err(Status::SEMAPHORE_LIMIT_EXCEEDED);
        }
        self.count.set(previous + delta);
        wake_up(srv, self, 0);
        Ok(previous)
    }

    /// Current count.
    #[inline]
    #[must_use]
    pub fn count(&self) -> u32 {
        self.count.get()
    }
}

impl SyncObject for Semaphore {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        format!("semaphore count={} max={}", self.count.get(), self.max)
    }

    fn signaled(&self, _waiter: &Thread) -> bool {
        self.count.get() > 0
    }

    fn satisfied(&self, _waiter: &Rc<Thread>) -> bool {
        let count = self.count.get();
        debug_assert!(count > 0);
        self.count.set(count.saturating_sub(1));
        false
    }

    fn signal(&self, srv: &Server, _current: &Rc<Thread>, access: AccessMask) -> Result<(), Status> {
        if !access.contains(AccessMask::SEMAPHORE_MODIFY_STATE) {
            return Err(Status::ACCESS_DENIED);
        }
        self.release(srv, 1).map(|_| ())
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
