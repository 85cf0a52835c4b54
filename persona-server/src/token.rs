//! Impersonation-token shim.
//!
//! The security module is an external collaborator; the core only
//! stores and hands back token references. A token is an opaque
//! refcounted object here.

use std::any::Any;
use std::rc::Rc;

use crate::object::{SyncObject, WaitQueue};
use crate::thread::Thread;

/// Opaque security token.
pub struct Token {
    queue: WaitQueue,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token").finish()
    }
}

impl Token {
    /// Create a token.
    #[must_use]
    pub fn new() -> Rc<Self> {
        Rc::new(Self { queue: WaitQueue::new() })
    }
}

impl SyncObject for Token {
    fn queue(&self) -> &WaitQueue {
        &self.queue
    }

    fn dump(&self) -> String {
        "token".into()
    }

    fn signaled(&self, _waiter: &Thread) -> bool {
        false
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
