//! Thread objects and their lifecycle.
//!
//! One [`Thread`] exists per client thread. The server never runs client
//! code; it tracks identity, scheduling state, the wait stack, APC
//! queues, captured register contexts and the in-flight descriptor
//! cache, and it owns the per-thread channels to the client.
//!
//! Lifecycle: [`create_thread`] allocates and registers the thread,
//! `init_thread` (in `requests`) binds it to its OS identity, and
//! [`kill_thread`] tears it down. Destruction runs when the last
//! reference drops; [`cleanup_thread`] is idempotent so kill-time and
//! destroy-time cleanup can overlap.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::rc::{Rc, Weak};

use persona_protocol::status::SvcResult;
use persona_protocol::{
    Abstime, AccessMask, Affinity, ClientPtr, Context, Handle, Ptid, Status,
    MAXIMUM_SUSPEND_COUNT, MAX_INFLIGHT_FDS,
};

use crate::apc::{self, Apc};
use crate::channel::WakeChannel;
use crate::handle::get_handle_obj;
use crate::hooks::{DebugEvent, KickSignal};
use crate::object::{SyncObject, WaitQueue};
use crate::process::Process;
use crate::registry::RegistryState;
use crate::server::Server;
use crate::sync::{self, Mutex};
use crate::token::Token;
use crate::wait::{self, ThreadWait};

/// Thread lifecycle state. The only transition is `Running` to
/// `Terminated` and it is irreversible.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ThreadState {
    /// Alive; may wait, receive APCs and change attributes.
    #[default]
    Running = 0,
    /// Dead; no new wait, APC or affinity change is accepted.
    Terminated = 1,
}

/// A tracked client thread.
pub struct Thread {
    pub(crate) id: Cell<Ptid>,
    pub(crate) process: Rc<Process>,
    pub(crate) registry: Weak<RefCell<RegistryState>>,
    pub(crate) state: Cell<ThreadState>,
    pub(crate) unix_pid: Cell<Option<i32>>,
    pub(crate) unix_tid: Cell<Option<i32>>,
    pub(crate) teb: Cell<ClientPtr>,
    pub(crate) priority: Cell<i32>,
    pub(crate) affinity: Cell<Affinity>,
    pub(crate) suspend: Cell<i32>,
    pub(crate) desktop: Cell<u32>,
    pub(crate) creation_time: Abstime,
    pub(crate) exit_time: Cell<Abstime>,
    pub(crate) exit_code: Cell<u32>,
    pub(crate) request_channel: RefCell<Option<OwnedFd>>,
    pub(crate) reply_channel: RefCell<Option<OwnedFd>>,
    pub(crate) wake_channel: RefCell<Option<Box<dyn WakeChannel>>>,
    pub(crate) wait: RefCell<Option<Box<ThreadWait>>>,
    // While set, wake_thread leaves decidable waits installed; the
    // select in progress owns the verdict.
    pub(crate) defer_wake: Cell<bool>,
    pub(crate) system_apc: RefCell<VecDeque<Rc<Apc>>>,
    pub(crate) user_apc: RefCell<VecDeque<Rc<Apc>>>,
    pub(crate) held_mutexes: RefCell<Vec<Rc<Mutex>>>,
    pub(crate) inflight: RefCell<InflightCache>,
    pub(crate) token: RefCell<Option<Rc<Token>>>,
    pub(crate) captured: RefCell<Option<Rc<RefCell<Context>>>>,
    pub(crate) suspend_context: RefCell<Option<Rc<RefCell<Context>>>>,
    pub(crate) debug_break: Cell<bool>,
    queue: WaitQueue,
}

impl std::fmt::Debug for Thread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread").field("id", &self.id.get()).finish()
    }
}

/// Create a new thread in `process`, adopting its request channel.
///
/// The thread is inserted into the global list, given a ticket id and
/// attached to the process, which holds the creation reference. The
/// desktop and affinity are inherited from the process.
pub fn create_thread(
    srv: &Server,
    request_fd: Option<OwnedFd>,
    process: &Rc<Process>,
) -> SvcResult<Rc<Thread>> {
    if process.is_terminating.get() {
        return Err(Status::PROCESS_IS_TERMINATING);
    }

    let thread = Rc::new(Thread {
        id: Cell::new(0),
        process: process.clone(),
        registry: Rc::downgrade(srv.registry().state()),
        state: Cell::new(ThreadState::Running),
        unix_pid: Cell::new(None),
        unix_tid: Cell::new(None),
        teb: Cell::new(0),
        priority: Cell::new(0),
        affinity: Cell::new(process.affinity.get()),
        suspend: Cell::new(0),
        desktop: Cell::new(process.desktop.get()),
        creation_time: srv.now(),
        exit_time: Cell::new(0),
        exit_code: Cell::new(0),
        request_channel: RefCell::new(request_fd),
        reply_channel: RefCell::new(None),
        wake_channel: RefCell::new(None),
        wait: RefCell::new(None),
        defer_wake: Cell::new(false),
        system_apc: RefCell::new(VecDeque::new()),
        user_apc: RefCell::new(VecDeque::new()),
        held_mutexes: RefCell::new(Vec::new()),
        inflight: RefCell::new(InflightCache::new()),
        token: RefCell::new(None),
        captured: RefCell::new(None),
        suspend_context: RefCell::new(None),
        debug_break: Cell::new(false),
        queue: WaitQueue::new(),
    });

    let id = srv.registry().insert_thread(&thread).ok_or(Status::NO_MEMORY)?;
    thread.id.set(id);
    process.add_thread(thread.clone());
    log::debug!("{:04x}: thread created in process {:04x}", id, process.id());
    Ok(thread)
}

impl Thread {
    /// Ticket id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> Ptid {
        self.id.get()
    }

    /// Owning process.
    #[inline]
    #[must_use]
    pub fn process(&self) -> &Rc<Process> {
        &self.process
    }

    /// Lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ThreadState {
        self.state.get()
    }

    /// Check for the terminated state.
    #[inline]
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.state.get() == ThreadState::Terminated
    }

    /// OS process id, once initialised.
    #[inline]
    #[must_use]
    pub fn unix_pid(&self) -> Option<i32> {
        self.unix_pid.get()
    }

    /// OS thread id, once initialised.
    #[inline]
    #[must_use]
    pub fn unix_tid(&self) -> Option<i32> {
        self.unix_tid.get()
    }

    /// Client TEB address.
    #[inline]
    #[must_use]
    pub fn teb(&self) -> ClientPtr {
        self.teb.get()
    }

    /// Scheduling priority.
    #[inline]
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority.get()
    }

    /// Affinity mask; always a non-empty subset of the process mask.
    #[inline]
    #[must_use]
    pub fn affinity(&self) -> Affinity {
        self.affinity.get()
    }

    /// Suspend counter.
    #[inline]
    #[must_use]
    pub fn suspend_count(&self) -> i32 {
        self.suspend.get()
    }

    /// Thread plus process suspension.
    #[inline]
    #[must_use]
    pub fn effective_suspend(&self) -> i32 {
        self.suspend.get() + self.process.suspend.get()
    }

    /// Exit code recorded at termination.
    #[inline]
    #[must_use]
    pub fn exit_code(&self) -> u32 {
        self.exit_code.get()
    }

    /// Creation timestamp.
    #[inline]
    #[must_use]
    pub fn creation_time(&self) -> Abstime {
        self.creation_time
    }

    /// Termination timestamp, zero while running.
    #[inline]
    #[must_use]
    pub fn exit_time(&self) -> Abstime {
        self.exit_time.get()
    }

    /// Check whether `init_thread` ran. Guarded by the reply channel:
    /// it only exists once.
    #[inline]
    #[must_use]
    pub fn is_initialised(&self) -> bool {
        self.reply_channel.borrow().is_some()
    }

    /// Check whether the request channel is still attached.
    #[inline]
    #[must_use]
    pub fn has_request_channel(&self) -> bool {
        self.request_channel.borrow().is_some()
    }

    /// Default desktop inherited from the process; cleared at cleanup.
    #[inline]
    #[must_use]
    pub fn desktop(&self) -> u32 {
        self.desktop.get()
    }

    /// Install the wake channel.
    pub fn set_wake_channel(&self, channel: Box<dyn WakeChannel>) {
        *self.wake_channel.borrow_mut() = Some(channel);
    }

    /// Captured register context, from a debug event or a suspension.
    #[must_use]
    pub fn captured(&self) -> Option<Rc<RefCell<Context>>> {
        self.captured.borrow().clone()
    }

    /// Depth of the wait stack.
    #[must_use]
    pub fn wait_depth(&self) -> usize {
        let mut depth = 0;
        let guard = self.wait.borrow();
        let mut wait = guard.as_deref();
        while let Some(w) = wait {
            depth += 1;
            wait = w.next.as_deref();
        }
        depth
    }
}

/// The impersonation token, falling back to the process token.
#[must_use]
pub fn thread_get_impersonation_token(thread: &Thread) -> Option<Rc<Token>> {
    thread.token.borrow().clone().or_else(|| thread.process.token())
}

/// Resolve a thread handle in `current`'s process.
pub fn get_thread_from_handle(
    current: &Rc<Thread>,
    handle: Handle,
    access: AccessMask,
) -> SvcResult<Rc<Thread>> {
    get_handle_obj::<Thread>(current.process.handles(), handle, access)
}

// -- Suspension

/// Stop the client thread at the OS level.
///
/// A thread already inside a debug event has its context captured and
/// needs no signal; a process still initialising cannot take one yet.
pub fn stop_thread(srv: &Server, thread: &Thread) {
    if thread.captured.borrow().is_some() {
        return;
    }
    if thread.process.is_init_done() {
        srv.hooks().send_thread_signal(thread, KickSignal::Interrupt);
    }
}

/// Stop the thread if its effective suspension says it should be stopped.
pub fn stop_thread_if_suspended(srv: &Server, thread: &Thread) {
    if thread.effective_suspend() > 0 {
        stop_thread(srv, thread);
    }
}

/// Increment the suspend counter, stopping the thread on the first
/// transition. Returns the previous count.
pub fn suspend_thread(srv: &Server, thread: &Thread) -> SvcResult<i32> {
    let old = thread.suspend.get();
    if old >= MAXIMUM_SUSPEND_COUNT {
        return Err(Status::SUSPEND_COUNT_EXCEEDED);
    }
    if thread.process.suspend.get() + old == 0 {
        stop_thread(srv, thread);
    }
    thread.suspend.set(old + 1);
    Ok(old)
}

/// Decrement the suspend counter, waking the thread when effective
/// suspension reaches zero. Over-resume is tolerated; the previous
/// count is returned either way.
pub fn resume_thread(srv: &Server, thread: &Rc<Thread>) -> i32 {
    let old = thread.suspend.get();
    if old > 0 {
        thread.suspend.set(old - 1);
        if thread.effective_suspend() == 0 {
            wait::wake_thread(srv, thread);
        }
    }
    old
}

// -- Scheduling attributes

/// Apply an affinity mask to the OS thread and record it.
pub fn set_thread_affinity(srv: &Server, thread: &Thread, affinity: Affinity) -> io::Result<()> {
    if thread.unix_tid().is_some() {
        srv.hooks().set_os_affinity(thread, affinity)?;
    }
    thread.affinity.set(affinity);
    Ok(())
}

/// Read the OS scheduler affinity, defaulting to all CPUs.
#[must_use]
pub fn get_thread_affinity(srv: &Server, thread: &Thread) -> Affinity {
    let mask = if thread.unix_tid().is_some() {
        srv.hooks().get_os_affinity(thread).unwrap_or(0)
    } else {
        0
    };
    if mask == 0 {
        !0
    } else {
        mask
    }
}

// -- Death

/// Kill a thread on the spot.
///
/// Drains every nested wait, delivering the exit code to each, wakes
/// joiners, abandons held mutexes and detaches the thread from its
/// process. `violent` requests an OS quit signal, skipped when the
/// thread was blocked on its wake channel.
pub fn kill_thread(srv: &Server, thread: &Rc<Thread>, violent: bool) {
    if thread.is_terminated() {
        return;
    }
    thread.state.set(ThreadState::Terminated);
    thread.exit_time.set(srv.now());
    log::debug!("{:04x}: killed, exit_code={:#x}", thread.id(), thread.exit_code.get());

    let mut violent = violent;
    if thread.wait.borrow().is_some() {
        while thread.wait.borrow().is_some() {
            let cookie = thread.wait.borrow().as_ref().map_or(0, |w| w.cookie);
            wait::end_wait(srv, thread);
            let exit = Status::from_raw(thread.exit_code.get());
            let _ = wait::send_thread_wakeup(srv, thread, cookie, exit);
        }
        violent = false;
    }

    srv.hooks().kill_console_processes(thread);
    srv.hooks().debug_exit_thread(thread);
    sync::abandon_mutexes(srv, thread);
    wait::wake_up(srv, &**thread, 0);
    if violent {
        srv.hooks().send_thread_signal(thread, KickSignal::Quit);
    }
    cleanup_thread(srv, thread);
    srv.registry().drop_unix_pid(thread);
    thread.process.remove_thread(thread);
}

/// Release everything a dead thread no longer needs.
///
/// Runs at kill time while references remain and is safe to run again
/// at destruction.
pub(crate) fn cleanup_thread(srv: &Server, thread: &Rc<Thread>) {
    apc::clear_apc_queues(srv, thread);
    *thread.request_channel.borrow_mut() = None;
    *thread.reply_channel.borrow_mut() = None;
    *thread.wake_channel.borrow_mut() = None;
    thread.inflight.borrow_mut().clear();
    *thread.captured.borrow_mut() = None;
    *thread.suspend_context.borrow_mut() = None;
    thread.desktop.set(0);
}

/// Report a protocol violation and tear the thread down violently.
pub fn fatal_protocol_error(srv: &Server, thread: &Rc<Thread>, reason: &str) {
    log::error!("{:04x}: fatal protocol error: {reason}", thread.id());
    thread.exit_code.set(1);
    kill_thread(srv, thread, true);
}

// -- Debug breakpoints

/// Raise a synthetic breakpoint event on the captured context.
pub fn break_thread(srv: &Server, thread: &Thread) {
    let address = match thread.captured.borrow().as_ref() {
        Some(context) => context.borrow().ctl.ip,
        None => {
            debug_assert!(false, "break_thread without a captured context");
            return;
        }
    };
    srv.hooks().generate_debug_event(
        thread,
        DebugEvent::Breakpoint { first: true, code: Status::BREAKPOINT, address },
    );
    thread.debug_break.set(false);
}

impl SyncObject for Thread {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        format!(
            "thread id={:04x} unix pid={} tid={} state={:?}",
            self.id(),
            self.unix_pid.get().unwrap_or(-1),
            self.unix_tid.get().unwrap_or(-1),
            self.state.get()
        )
    }

    fn signaled(&self, _waiter: &Thread) -> bool {
        self.is_terminated()
    }

    fn map_access(&self, access: AccessMask) -> AccessMask {
        access.map_thread_generic()
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut state = registry.borrow_mut();
            state.unlink_thread(self as *const Thread);
            if self.id.get() != 0 {
                state.table.free(self.id.get());
            }
        }
    }
}

// -- In-flight descriptor cache

/// What `get` does when the client descriptor has no cached entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InflightMissPolicy {
    /// Report a miss. Correct when client and server have separate
    /// descriptor tables.
    #[default]
    Fail,
    /// Duplicate the client-numbered descriptor locally and hand it
    /// out. Only valid in hosts where client and server share one
    /// descriptor table.
    DupLocal,
}

struct InflightEntry {
    client: i32,
    server: OwnedFd,
}

/// Bounded cache of descriptors in transit from one client thread.
pub struct InflightCache {
    slots: Vec<Option<InflightEntry>>,
}

impl InflightCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(MAX_INFLIGHT_FDS, || None);
        Self { slots }
    }

    /// Store the server-side pairing of a client descriptor.
    ///
    /// An existing entry for the same client number is replaced and its
    /// old server descriptor closed. Returns the slot index, or `None`
    /// when the cache is full or the client number invalid; the server
    /// descriptor is closed in both failure cases.
    pub fn add(&mut self, client: i32, server: OwnedFd) -> Option<usize> {
        if client < 0 {
            return None;
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.as_ref().is_some_and(|e| e.client == client) {
                *slot = Some(InflightEntry { client, server });
                return Some(index);
            }
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(InflightEntry { client, server });
                return Some(index);
            }
        }
        None
    }

    /// Remove and return the server descriptor paired with `client`.
    ///
    /// With [`InflightMissPolicy::DupLocal`], a miss synthesises the
    /// descriptor by duplicating the client number locally.
    pub fn get(&mut self, client: i32, policy: InflightMissPolicy) -> Option<OwnedFd> {
        if client < 0 {
            return None;
        }
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(|e| e.client == client) {
                return slot.take().map(|e| e.server);
            }
        }
        match policy {
            InflightMissPolicy::Fail => None,
            InflightMissPolicy::DupLocal => {
                // SAFETY: the policy is only configured in hosts where the
                // client descriptor table is the server's own, so `client`
                // names a descriptor in this process for the duration of
                // the call.
                let borrowed = unsafe { BorrowedFd::borrow_raw(client) };
                match borrowed.try_clone_to_owned() {
                    Ok(fd) => Some(fd),
                    Err(err) => {
                        log::warn!("inflight dup of fd {client} failed: {err}");
                        None
                    }
                }
            }
        }
    }

    /// Drop every cached descriptor.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Check for an empty cache.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InflightCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull an in-flight descriptor for the current thread.
pub fn thread_get_inflight_fd(srv: &Server, thread: &Thread, client: i32) -> Option<OwnedFd> {
    thread.inflight.borrow_mut().get(client, srv.config().inflight_miss_policy)
}

/// Record an in-flight descriptor for the current thread.
pub fn thread_add_inflight_fd(thread: &Thread, client: i32, server: OwnedFd) -> Option<usize> {
    thread.inflight.borrow_mut().add(client, server)
}
