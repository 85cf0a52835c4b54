//! Thread and synchronization core of the persona personality server.
//!
//! A single-process arbiter that tracks every client thread of every
//! client process, owns the cross-process wait-object graph and
//! mediates suspension, wake-ups, asynchronous procedure calls and
//! debugger breakpoints. Clients talk to the server over per-thread
//! channels and block in the server whenever they wait on a
//! synchronizable object; the server schedules waits, never CPU time.
//!
//! The host embeds the engine by constructing one [`Server`], wiring
//! its collaborators through [`hooks::HostHooks`], advancing the clock
//! from its poll loop and feeding decoded requests to the entrypoints
//! in [`requests`].

pub mod apc;
pub mod channel;
pub mod handle;
pub mod hooks;
pub mod object;
pub mod process;
pub mod registry;
pub mod requests;
pub mod server;
pub mod sync;
pub mod thread;
pub mod ticket;
pub mod timer;
pub mod token;
pub mod wait;

#[cfg(test)]
pub(crate) mod testutil;

pub use server::{Server, ServerConfig};
