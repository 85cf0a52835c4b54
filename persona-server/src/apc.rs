//! Asynchronous procedure calls.
//!
//! An [`Apc`] is a refcounted, waitable unit of work queued on a thread
//! and executed by the client at its next delivery point. Each thread
//! carries two FIFO queues: system APCs interrupt any interruptible
//! wait and always dequeue first; user APCs need an alertable wait.
//! Queueing a system APC to a thread that is not at an APC-acceptable
//! point kicks the OS thread so it enters the server.
//!
//! APCs with an owner coalesce: queueing cancels any earlier queued APC
//! of the same kind with the same owner, so an async I/O object only
//! ever has its latest completion delivered.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use persona_protocol::{ApcCall, ApcKind, ApcQueueClass, ApcResult};

use crate::hooks::KickSignal;
use crate::object::{same_object, SyncObject, WaitQueue};
use crate::process::Process;
use crate::server::Server;
use crate::thread::Thread;
use crate::wait::{wake_thread, wake_up};

/// A queued asynchronous procedure call.
pub struct Apc {
    call: ApcCall,
    owner: Option<Rc<dyn SyncObject>>,
    caller: RefCell<Option<Rc<Thread>>>,
    executed: Cell<bool>,
    result: RefCell<ApcResult>,
    queue: WaitQueue,
}

impl Apc {
    /// Create an APC carrying `call`, optionally tied to the object
    /// that issued it.
    #[must_use]
    pub fn create(owner: Option<Rc<dyn SyncObject>>, call: ApcCall) -> Rc<Self> {
        Rc::new(Self {
            call,
            owner,
            caller: RefCell::new(None),
            executed: Cell::new(false),
            result: RefCell::new(ApcResult::None),
            queue: WaitQueue::new(),
        })
    }

    /// The call descriptor.
    #[inline]
    #[must_use]
    pub fn call(&self) -> &ApcCall {
        &self.call
    }

    /// The owning object, if any.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> Option<&Rc<dyn SyncObject>> {
        self.owner.as_ref()
    }

    /// The thread that queued this APC across processes.
    #[must_use]
    pub fn caller(&self) -> Option<Rc<Thread>> {
        self.caller.borrow().clone()
    }

    /// Record the cross-process caller.
    pub fn set_caller(&self, caller: Rc<Thread>) {
        *self.caller.borrow_mut() = Some(caller);
    }

    /// Check whether the client executed (or the server cancelled)
    /// this APC.
    #[inline]
    #[must_use]
    pub fn executed(&self) -> bool {
        self.executed.get()
    }

    /// The posted result.
    #[must_use]
    pub fn result(&self) -> ApcResult {
        self.result.borrow().clone()
    }

    /// Store the client's result.
    pub fn set_result(&self, result: ApcResult) {
        *self.result.borrow_mut() = result;
    }

    /// Mark the APC executed and wake joiners blocked on it.
    pub fn mark_executed(&self, srv: &Server) {
        self.executed.set(true);
        wake_up(srv, self, 0);
    }

    /// Set the executed flag without waking joiners; result bookkeeping
    /// runs between the flag and the wake.
    pub(crate) fn set_executed(&self) {
        self.executed.set(true);
    }
}

impl SyncObject for Apc {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        format!("apc kind={:?} executed={}", self.call.kind(), self.executed.get())
    }

    fn signaled(&self, _waiter: &Thread) -> bool {
        self.executed.get()
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

fn queue_of(thread: &Thread, class: ApcQueueClass) -> &RefCell<VecDeque<Rc<Apc>>> {
    match class {
        ApcQueueClass::User => &thread.user_apc,
        ApcQueueClass::System => &thread.system_apc,
    }
}

/// Check whether the thread is at an APC-acceptable point: suspended
/// (by itself or its process) or blocked in an interruptible wait.
#[must_use]
pub fn is_in_apc_wait(thread: &Thread) -> bool {
    thread.effective_suspend() > 0
        || thread
            .wait
            .borrow()
            .as_ref()
            .is_some_and(|wait| wait.flags().interruptible())
}

/// Queue an existing APC to `thread`, or to any suitable thread of
/// `process` when no thread is named. Returns whether it was queued.
pub fn queue_apc(
    srv: &Server,
    process: Option<&Rc<Process>>,
    thread: Option<&Rc<Thread>>,
    apc: &Rc<Apc>,
) -> bool {
    let target = match thread {
        Some(thread) => {
            if thread.is_terminated() {
                return false;
            }
            let class = apc.call().queue_class();
            if class == ApcQueueClass::System {
                // An idle target needs a kick so it enters the server and
                // drains the queue.
                let queue_empty = thread.system_apc.borrow().is_empty();
                if queue_empty
                    && !is_in_apc_wait(thread)
                    && !srv.hooks().send_thread_signal(thread, KickSignal::Interrupt)
                {
                    return false;
                }
            }
            if let Some(owner) = apc.owner() {
                thread_cancel_apc(srv, thread, owner, apc.call().kind());
            }
            thread.clone()
        }
        None => {
            let Some(process) = process else { return false };
            let threads = process.threads();
            let waiting = threads
                .iter()
                .find(|t| !t.is_terminated() && is_in_apc_wait(t));
            let target = waiting.cloned().or_else(|| {
                threads
                    .iter()
                    .find(|t| {
                        !t.is_terminated()
                            && srv.hooks().send_thread_signal(t, KickSignal::Interrupt)
                    })
                    .cloned()
            });
            match target {
                Some(target) => target,
                None => return false,
            }
        }
    };

    let queue = queue_of(&target, apc.call().queue_class());
    queue.borrow_mut().push_back(apc.clone());
    let first = queue.borrow().len() == 1;
    log::trace!(
        "{:04x}: queued {:?} apc, first={first}",
        target.id(),
        apc.call().kind()
    );
    if first {
        wake_thread(srv, &target);
    }
    true
}

/// Create and queue an APC on `thread`.
pub fn thread_queue_apc(
    srv: &Server,
    thread: &Rc<Thread>,
    owner: Option<Rc<dyn SyncObject>>,
    call: ApcCall,
) -> bool {
    let apc = Apc::create(owner, call);
    queue_apc(srv, None, Some(thread), &apc)
}

/// Cancel the queued APC of `kind` owned by `owner`, if any.
///
/// The cancelled APC counts as executed so joiners observe completion.
pub fn thread_cancel_apc(
    srv: &Server,
    thread: &Thread,
    owner: &Rc<dyn SyncObject>,
    kind: ApcKind,
) {
    let queue = queue_of(thread, kind.queue_class());
    let cancelled = {
        let mut queue = queue.borrow_mut();
        let position = queue
            .iter()
            .position(|apc| apc.owner().is_some_and(|o| same_object(o, owner)));
        position.and_then(|index| queue.remove(index))
    };
    if let Some(apc) = cancelled {
        apc.mark_executed(srv);
    }
}

/// Remove and return the next deliverable APC: the system-queue head,
/// else the user-queue head unless `system_only`.
pub fn thread_dequeue_apc(thread: &Thread, system_only: bool) -> Option<Rc<Apc>> {
    let apc = thread.system_apc.borrow_mut().pop_front();
    if apc.is_some() || system_only {
        return apc;
    }
    thread.user_apc.borrow_mut().pop_front()
}

/// Flush both APC queues of a dead thread.
///
/// Every cleared APC is marked executed and its joiners woken, so
/// clients blocked on APC completion keep their wait contract even
/// though the APC never ran.
pub(crate) fn clear_apc_queues(srv: &Server, thread: &Thread) {
    let drained: Vec<Rc<Apc>> = thread
        .system_apc
        .borrow_mut()
        .drain(..)
        .chain(thread.user_apc.borrow_mut().drain(..))
        .collect();
    for apc in drained {
        apc.mark_executed(srv);
    }
}
