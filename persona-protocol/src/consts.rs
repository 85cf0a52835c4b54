//! Core limits and scheduling constants.

/// Maximum number of objects one wait may name.
pub const MAXIMUM_WAIT_OBJECTS: usize = 64;

/// Maximum value of a thread (or process) suspend counter.
pub const MAXIMUM_SUSPEND_COUNT: i32 = 127;

/// Slots in the per-thread in-flight descriptor cache.
pub const MAX_INFLIGHT_FDS: usize = 16;

/// Protocol version echoed by `init_thread`; bumped on any wire change.
pub const SERVER_PROTOCOL_VERSION: u32 = 3;

// -- Thread priority levels
//
// The base range applies inside normal priority classes; the realtime
// class widens it. The two sentinels are accepted in any class.

/// Lowest base priority.
pub const THREAD_PRIORITY_LOWEST: i32 = -2;
/// Highest base priority.
pub const THREAD_PRIORITY_HIGHEST: i32 = 2;
/// Lowest priority in the realtime class.
pub const THREAD_PRIORITY_REALTIME_LOWEST: i32 = -7;
/// Highest priority in the realtime class.
pub const THREAD_PRIORITY_REALTIME_HIGHEST: i32 = 6;
/// Idle sentinel, accepted outside the class range.
pub const THREAD_PRIORITY_IDLE: i32 = -15;
/// Time-critical sentinel, accepted outside the class range.
pub const THREAD_PRIORITY_TIME_CRITICAL: i32 = 15;

/// Scheduling class of a process; bounds the priorities its threads
/// may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum PriorityClass {
    /// Idle class.
    Idle = 1,
    /// Default class.
    #[default]
    Normal = 2,
    /// High class.
    High = 3,
    /// Realtime class; widens the per-thread priority range.
    Realtime = 4,
    /// Below-normal class.
    BelowNormal = 5,
    /// Above-normal class.
    AboveNormal = 6,
}

impl PriorityClass {
    /// Inclusive thread-priority range permitted by this class,
    /// not counting the idle/time-critical sentinels.
    #[must_use]
    pub const fn priority_range(self) -> (i32, i32) {
        match self {
            Self::Realtime => (THREAD_PRIORITY_REALTIME_LOWEST, THREAD_PRIORITY_REALTIME_HIGHEST),
            _ => (THREAD_PRIORITY_LOWEST, THREAD_PRIORITY_HIGHEST),
        }
    }

    /// Check whether `priority` is acceptable under this class.
    #[must_use]
    pub const fn allows_priority(self, priority: i32) -> bool {
        let (min, max) = self.priority_range();
        (priority >= min && priority <= max)
            || priority == THREAD_PRIORITY_IDLE
            || priority == THREAD_PRIORITY_TIME_CRITICAL
    }
}
