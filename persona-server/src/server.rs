//! The server engine value.
//!
//! One [`Server`] exists per personality server. It owns the registry,
//! the wait-deadline queue, the host hooks and the dispatcher clock.
//! The dispatcher is single-threaded cooperative: the host advances the
//! clock once per poll-loop tick and services one request to
//! completion at a time, so the engine needs no locking of its own.

use std::cell::{Cell, RefCell};

use persona_protocol::{Abstime, CpuMask};

use crate::hooks::{HostHooks, NullHooks};
use crate::registry::Registry;
use crate::thread::InflightMissPolicy;
use crate::timer::TimerQueue;
use crate::wait;

/// Server-wide configuration, fixed at construction.
pub struct ServerConfig {
    /// CPU types this server build can host.
    pub supported_cpus: CpuMask,
    /// CPU types the prefix configuration permits.
    pub prefix_cpu_mask: CpuMask,
    /// Miss behaviour of the in-flight descriptor caches.
    pub inflight_miss_policy: InflightMissPolicy,
    /// Timestamp reported as the server start time.
    pub start_time: Abstime,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            supported_cpus: CpuMask::host_default(),
            prefix_cpu_mask: CpuMask::ALL,
            inflight_miss_policy: InflightMissPolicy::Fail,
            start_time: 0,
        }
    }
}

/// The engine: registry, clock, timers and host hooks.
pub struct Server {
    config: ServerConfig,
    registry: Registry,
    timers: RefCell<TimerQueue>,
    hooks: Box<dyn HostHooks>,
    clock: Cell<Abstime>,
    debug_level: Cell<u32>,
    next_token: Cell<u64>,
}

impl Server {
    /// Create a server with the given configuration and host hooks.
    #[must_use]
    pub fn new(config: ServerConfig, hooks: Box<dyn HostHooks>) -> Self {
        let clock = Cell::new(config.start_time);
        Self {
            config,
            registry: Registry::new(),
            timers: RefCell::new(TimerQueue::new()),
            hooks,
            clock,
            debug_level: Cell::new(0),
            next_token: Cell::new(1),
        }
    }

    /// Create a server with default configuration and no collaborators.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default(), Box::new(NullHooks))
    }

    /// Configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The thread registry.
    #[inline]
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Host collaborator hooks.
    #[inline]
    #[must_use]
    pub fn hooks(&self) -> &dyn HostHooks {
        self.hooks.as_ref()
    }

    /// Current dispatcher time.
    #[inline]
    #[must_use]
    pub fn now(&self) -> Abstime {
        self.clock.get()
    }

    /// Server start timestamp.
    #[inline]
    #[must_use]
    pub fn start_time(&self) -> Abstime {
        self.config.start_time
    }

    /// Highest client debug level seen.
    #[inline]
    #[must_use]
    pub fn debug_level(&self) -> u32 {
        self.debug_level.get()
    }

    /// Raise the debug level; it never goes back down.
    pub fn raise_debug_level(&self, level: u32) {
        if level > self.debug_level.get() {
            self.debug_level.set(level);
        }
    }

    /// Move the clock to `now` and fire every wait deadline that has
    /// elapsed. The clock never goes backwards.
    pub fn set_time(&self, now: Abstime) {
        if now > self.clock.get() {
            self.clock.set(now);
        }
        loop {
            // Pop outside the callback: a timeout may arm or cancel
            // other deadlines.
            let due = self.timers.borrow_mut().pop_due(self.clock.get());
            if due.is_empty() {
                break;
            }
            for (timer, thread) in due {
                wait::thread_timeout(self, &thread, timer);
            }
        }
    }

    /// Advance the clock by `delta` ticks.
    pub fn advance_time(&self, delta: Abstime) {
        self.set_time(self.now().saturating_add(delta));
    }

    /// Earliest armed wait deadline; hosts size their poll timeout
    /// with this.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Abstime> {
        self.timers.borrow().next_deadline()
    }

    pub(crate) fn timers(&self) -> &RefCell<TimerQueue> {
        &self.timers
    }

    pub(crate) fn next_wait_token(&self) -> u64 {
        let token = self.next_token.get();
        self.next_token.set(token + 1);
        token
    }
}
