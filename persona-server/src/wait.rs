//! The wait engine.
//!
//! A thread entering a multi-object wait gets a wait record pushed onto
//! its wait stack; each record links the thread into the wait queue of
//! every named object. [`check_wait`] decides whether the top wait can
//! complete, [`wake_thread`] pops every decidable wait and writes one
//! wake-up record per wait to the thread's wake channel, and
//! [`wake_up`] fans a signalled object out over its queued waiters in
//! insertion order.
//!
//! Verdict precedence in [`check_wait`], in order: queued system APCs on
//! an interruptible wait; suspension (defers everything below, so a
//! suspended thread acquires no lock but still takes system APCs); the
//! objects themselves; queued user APCs on an alertable wait; the
//! deadline.

use std::cell::Cell;
use std::io;
use std::rc::Rc;

use persona_protocol::status::SvcResult;
use persona_protocol::{
    Abstime, AccessMask, ClientPtr, Handle, SelectFlags, Status, WakeUpReply,
    MAXIMUM_WAIT_OBJECTS, TIMEOUT_INFINITE,
};

use crate::object::{SyncObject, WaitRef};
use crate::server::Server;
use crate::thread::{self, Thread};
use crate::timer::TimerId;

/// One waited object inside a wait record; owns the strong reference
/// grabbed by `add_queue`.
pub(crate) struct WaitEntry {
    pub(crate) obj: Rc<dyn SyncObject>,
    pub(crate) token: u64,
}

/// A multi-object wait. Lives on the owning thread's wait stack;
/// `next` links older, nested waits.
pub struct ThreadWait {
    pub(crate) next: Option<Box<ThreadWait>>,
    pub(crate) flags: SelectFlags,
    pub(crate) deadline: Abstime,
    pub(crate) cookie: ClientPtr,
    pub(crate) timer: Cell<Option<TimerId>>,
    pub(crate) entries: Vec<WaitEntry>,
}

impl ThreadWait {
    /// Wait flags.
    #[inline]
    #[must_use]
    pub fn flags(&self) -> SelectFlags {
        self.flags
    }

    /// Client cookie echoed on wake-up.
    #[inline]
    #[must_use]
    pub fn cookie(&self) -> ClientPtr {
        self.cookie
    }

    /// Number of waited objects.
    #[inline]
    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

/// Build a wait record for `current` over `objects` and link it into
/// every object's wait queue.
///
/// A failing `add_queue` rolls back the entries already linked and
/// leaves the wait stack untouched.
pub fn wait_on(
    srv: &Server,
    current: &Rc<Thread>,
    objects: Vec<Rc<dyn SyncObject>>,
    flags: SelectFlags,
    deadline: Abstime,
    cookie: ClientPtr,
) -> SvcResult<()> {
    let mut entries: Vec<WaitEntry> = Vec::with_capacity(objects.len());
    for obj in objects {
        let token = srv.next_wait_token();
        let entry = WaitRef { thread: Rc::downgrade(current), token };
        if let Err(status) = obj.add_queue(entry) {
            for done in &entries {
                done.obj.remove_queue(done.token);
            }
            return Err(status);
        }
        entries.push(WaitEntry { obj, token });
    }

    let mut slot = current.wait.borrow_mut();
    let next = slot.take();
    *slot = Some(Box::new(ThreadWait {
        next,
        flags,
        deadline,
        cookie,
        timer: Cell::new(None),
        entries,
    }));
    Ok(())
}

/// Pop the top wait record: unlink every queue entry, cancel the armed
/// timer and free the record.
pub fn end_wait(srv: &Server, thread: &Rc<Thread>) {
    let wait = {
        let mut slot = thread.wait.borrow_mut();
        let Some(mut wait) = slot.take() else {
            debug_assert!(false, "end_wait without a wait");
            return;
        };
        *slot = wait.next.take();
        wait
    };
    for entry in &wait.entries {
        entry.obj.remove_queue(entry.token);
    }
    if let Some(id) = wait.timer.take() {
        srv.timers().borrow_mut().cancel(id);
    }
}

/// Decide the top wait of `thread`.
///
/// Returns `None` while the wait must keep waiting, otherwise the wake
/// status. Objects are all consulted on a WAIT-ALL grant because some
/// observe the probe; a WAIT-ANY grant goes to the first signalled
/// object in input order.
pub fn check_wait(srv: &Server, thread: &Rc<Thread>) -> Option<Status> {
    let guard = thread.wait.borrow();
    let wait = guard.as_deref()?;

    if wait.flags.interruptible() && !thread.system_apc.borrow().is_empty() {
        return Some(Status::USER_APC);
    }

    // Suspended threads may not acquire anything, but system APCs above
    // still get through.
    if thread.effective_suspend() > 0 {
        return None;
    }

    if wait.flags.wait_all() {
        let mut not_ok = false;
        for entry in &wait.entries {
            not_ok |= !entry.obj.signaled(thread);
        }
        if !not_ok {
            let mut status = Status::SUCCESS;
            for entry in &wait.entries {
                if entry.obj.satisfied(thread) {
                    status = Status::ABANDONED_WAIT_0;
                }
            }
            return Some(status);
        }
    } else {
        for (index, entry) in wait.entries.iter().enumerate() {
            if !entry.obj.signaled(thread) {
                continue;
            }
            let status = if entry.obj.satisfied(thread) {
                Status::from_abandoned_index(index as u32)
            } else {
                Status::from_wait_index(index as u32)
            };
            return Some(status);
        }
    }

    if wait.flags.alertable() && !thread.user_apc.borrow().is_empty() {
        return Some(Status::USER_APC);
    }
    if wait.deadline <= srv.now() {
        return Some(Status::TIMEOUT);
    }
    None
}

/// Write one wake-up record to the thread's wake channel.
///
/// A broken pipe is a normal death (the client went away); any other
/// transport failure is a protocol error and kills the thread
/// violently.
pub(crate) fn send_thread_wakeup(
    srv: &Server,
    thread: &Rc<Thread>,
    cookie: ClientPtr,
    signaled: Status,
) -> Result<(), ()> {
    let reply = WakeUpReply { cookie, signaled };
    let result = {
        let channel = thread.wake_channel.borrow();
        match channel.as_ref() {
            Some(channel) => channel.send(&reply),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
            thread::kill_thread(srv, thread, false);
            Err(())
        }
        Err(err) => {
            thread::fatal_protocol_error(srv, thread, &format!("wakeup write: {err}"));
            Err(())
        }
    }
}

/// Attempt to wake a thread, popping one wait per verdict until a wait
/// must keep waiting. Returns the number of waits completed.
pub fn wake_thread(srv: &Server, thread: &Rc<Thread>) -> u32 {
    // A select in progress answers this thread's verdict itself; the
    // wake channel must stay silent for it.
    if thread.defer_wake.get() {
        return 0;
    }
    let mut count = 0;
    while thread.wait.borrow().is_some() {
        let Some(signaled) = check_wait(srv, thread) else { break };
        let cookie = thread.wait.borrow().as_ref().map_or(0, |w| w.cookie);
        log::trace!("{:04x}: woken, signaled={signaled}", thread.id());
        end_wait(srv, thread);
        count += 1;
        if send_thread_wakeup(srv, thread, cookie, signaled).is_err() {
            break;
        }
    }
    count
}

/// Fan a signalled object out over its wait queue.
///
/// A successful wake may mutate the queue, so iteration restarts at the
/// head after each one; insertion order still decides who is offered
/// the object first. `max > 0` bounds the number of successful wakes.
pub fn wake_up(srv: &Server, obj: &dyn SyncObject, max: u32) {
    let mut woken = 0;
    let mut position = 0;
    loop {
        let Some(entry) = obj.queue().entry_at(position) else { break };
        let Some(thread) = entry.thread.upgrade() else {
            position += 1;
            continue;
        };
        if wake_thread(srv, &thread) == 0 {
            position += 1;
            continue;
        }
        woken += 1;
        if max != 0 && woken == max {
            break;
        }
        position = 0;
    }
}

/// Deadline callback for an armed wait timer.
///
/// Ignored when the wait is no longer the thread's top wait (it ended
/// already) and swallowed while the thread is suspended; the wait then
/// persists until resume, where the elapsed deadline reports `TIMEOUT`.
pub(crate) fn thread_timeout(srv: &Server, thread: &Rc<Thread>, timer: TimerId) {
    {
        let guard = thread.wait.borrow();
        let Some(wait) = guard.as_deref() else { return };
        if wait.timer.get() != Some(timer) {
            return;
        }
        wait.timer.set(None);
        if thread.effective_suspend() > 0 {
            return;
        }
    }

    let cookie = thread.wait.borrow().as_ref().map_or(0, |w| w.cookie);
    log::trace!("{:04x}: woken, signaled=TIMEOUT", thread.id());
    end_wait(srv, thread);
    if send_thread_wakeup(srv, thread, cookie, Status::TIMEOUT).is_err() {
        return;
    }
    // Other objects may have become signalled in the meantime.
    wake_thread(srv, thread);
}

/// Signal an object through a handle (the signal half of
/// signal-and-wait).
pub fn signal_object(srv: &Server, current: &Rc<Thread>, handle: Handle) -> SvcResult<()> {
    let handles = current.process().handles();
    let obj = handles.get(handle, AccessMask::NONE)?;
    let access = handles.get_access(handle)?;
    obj.signal(srv, current, access)
}

/// Install a wait over `handles` for the current thread.
///
/// The handles are resolved under `SYNCHRONIZE` access. A non-null
/// `signal` object is signalled first; a wait the signal itself
/// satisfies is cancelled and answered directly, with nothing written
/// to the wake channel. Returns the absolute deadline and the
/// immediate verdict, `PENDING` when the thread must block on its wake
/// channel.
pub fn select_on(
    srv: &Server,
    current: &Rc<Thread>,
    handles: &[Handle],
    flags: SelectFlags,
    timeout: Abstime,
    signal: Handle,
    cookie: ClientPtr,
) -> SvcResult<(Abstime, Status)> {
    // Non-positive timeouts are deltas from the current time.
    let deadline = if timeout <= 0 { srv.now() - timeout } else { timeout };

    if handles.len() > MAXIMUM_WAIT_OBJECTS {
        return Err(Status::INVALID_PARAMETER);
    }
    let mut objects = Vec::with_capacity(handles.len());
    for handle in handles {
        objects.push(current.process().handles().get(*handle, AccessMask::SYNCHRONIZE)?);
    }

    wait_on(srv, current, objects, flags, deadline, cookie)?;

    if !signal.is_null() {
        // The record above already queues this thread on the signalled
        // object, so its fan-out is deferred: the verdict check below
        // owns both ending the wait and answering the call, exactly
        // once.
        current.defer_wake.set(true);
        let signalled = signal_object(srv, current, signal);
        current.defer_wake.set(false);
        if let Err(status) = signalled {
            end_wait(srv, current);
            return Err(status);
        }
    }

    if let Some(status) = check_wait(srv, current) {
        end_wait(srv, current);
        if !signal.is_null() {
            // The signal may have made older, nested waits decidable.
            wake_thread(srv, current);
        }
        return Ok((deadline, status));
    }

    if deadline != TIMEOUT_INFINITE {
        let id = srv.timers().borrow_mut().arm(deadline, Rc::downgrade(current));
        if let Some(wait) = current.wait.borrow().as_ref() {
            wait.timer.set(Some(id));
        }
    }
    Ok((deadline, Status::PENDING))
}
