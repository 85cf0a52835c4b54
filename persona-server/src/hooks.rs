//! Host collaborator hooks.
//!
//! Everything the core needs from its out-of-scope collaborators goes
//! through [`HostHooks`]: debugger event delivery, console teardown,
//! async I/O result forwarding, OS-level thread signalling and affinity,
//! process bootstrap and selector-entry queries. Every method has a
//! conservative default so an embedded host implements only what it has.

use std::io;
use std::rc::Rc;

use persona_protocol::status::SvcResult;
use persona_protocol::{Affinity, ClientPtr, Context, ContextFlags, Status};

use crate::object::SyncObject;
use crate::thread::Thread;

/// OS-level wakeup delivered to a client thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KickSignal {
    /// Interrupt the thread so it re-enters the server (SIGUSR1 class).
    Interrupt,
    /// Ask the thread to die (SIGQUIT class).
    Quit,
}

/// Debugger event raised by the core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugEvent {
    /// Synthetic breakpoint on a captured thread.
    Breakpoint {
        /// First-chance flag.
        first: bool,
        /// Exception code, `Status::BREAKPOINT` for injected breaks.
        code: Status,
        /// Faulting instruction address.
        address: ClientPtr,
    },
    /// A follow-up thread finished initialisation.
    CreateThread {
        /// Client entry point.
        entry: ClientPtr,
    },
}

/// One descriptor-table entry, as reported for x86 selectors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SelectorEntry {
    /// Segment base.
    pub base: u32,
    /// Segment limit.
    pub limit: u32,
    /// Descriptor flags.
    pub flags: u32,
}

/// Collaborator interface of the host embedding the core.
pub trait HostHooks {
    /// Deliver an OS-level signal to the client thread. Returns whether
    /// the signal reached it.
    fn send_thread_signal(&self, thread: &Thread, signal: KickSignal) -> bool {
        let _ = (thread, signal);
        false
    }

    /// Hand a debug event to the debugger pipeline.
    fn generate_debug_event(&self, thread: &Thread, event: DebugEvent) {
        let _ = (thread, event);
    }

    /// Detach the thread from any debug context it participates in.
    fn debug_exit_thread(&self, thread: &Thread) {
        let _ = thread;
    }

    /// Tear down console state bound to the dying thread.
    fn kill_console_processes(&self, thread: &Thread) {
        let _ = thread;
    }

    /// Forward an async I/O completion to its owning object.
    fn async_set_result(
        &self,
        owner: &Rc<dyn SyncObject>,
        status: Status,
        total: u32,
        apc: ClientPtr,
    ) {
        let _ = (owner, status, total, apc);
    }

    /// Finish process bootstrap once the first thread initialises.
    /// Returns the startup-info size reported to the client.
    fn init_process(&self, first_thread: &Rc<Thread>) -> u32 {
        let _ = first_thread;
        0
    }

    /// Read the OS scheduler affinity of the client thread.
    fn get_os_affinity(&self, thread: &Thread) -> Option<Affinity> {
        let _ = thread;
        None
    }

    /// Apply an affinity mask to the OS thread.
    fn set_os_affinity(&self, thread: &Thread, affinity: Affinity) -> io::Result<()> {
        let _ = (thread, affinity);
        Ok(())
    }

    /// Fetch a selector entry from the client's descriptor table.
    fn get_selector_entry(&self, thread: &Thread, entry: u32) -> SvcResult<SelectorEntry> {
        let _ = (thread, entry);
        Err(Status::NOT_SUPPORTED)
    }

    /// Read the system-register banks the client cannot access itself.
    fn read_system_regs(
        &self,
        thread: &Thread,
        context: &mut Context,
        flags: ContextFlags,
    ) -> SvcResult<()> {
        let _ = (thread, context, flags);
        Ok(())
    }

    /// Write the system-register banks.
    fn write_system_regs(
        &self,
        thread: &Thread,
        context: &Context,
        flags: ContextFlags,
    ) -> SvcResult<()> {
        let _ = (thread, context, flags);
        Ok(())
    }
}

/// Hooks implementation for hosts without any collaborator.
pub struct NullHooks;

impl HostHooks for NullHooks {}
