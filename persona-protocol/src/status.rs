//! Operation status codes.
//!
//! Statuses follow the personality's native encoding: a 32-bit word whose
//! top two bits carry the severity. Wake statuses are arithmetic
//! (`WAIT_0 + index`, `ABANDONED_WAIT_0 + index`), so [`Status`] is an
//! open newtype with named constants rather than a closed enum.

use core::fmt;

/// A 32-bit status word.
///
/// Severity lives in bits 31:30 (0 = success, 1 = informational,
/// 2 = warning, 3 = error). Values below `0x4000_0000` are success-class
/// and may still denote a deferred outcome (`PENDING`, `TIMEOUT`,
/// `USER_APC`) rather than plain success.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Status(u32);

impl Status {
    /// Plain success.
    pub const SUCCESS: Self = Self(0x0000_0000);
    /// First satisfied-wait index. `WAIT_0 + i` reports object `i`.
    pub const WAIT_0: Self = Self(0x0000_0000);
    /// First abandoned-wait index. `ABANDONED_WAIT_0 + i` reports object
    /// `i` satisfied by an abandoned owner.
    pub const ABANDONED_WAIT_0: Self = Self(0x0000_0080);
    /// A user APC terminated the wait.
    pub const USER_APC: Self = Self(0x0000_00C0);
    /// The wait deadline elapsed.
    pub const TIMEOUT: Self = Self(0x0000_0102);
    /// The operation has been queued; the result arrives later.
    pub const PENDING: Self = Self(0x0000_0103);

    /// Synthetic breakpoint exception code.
    pub const BREAKPOINT: Self = Self(0x8000_0003);

    /// Generic failure.
    pub const UNSUCCESSFUL: Self = Self(0xC000_0001);
    /// Handle does not name a live object in the caller's table.
    pub const INVALID_HANDLE: Self = Self(0xC000_0008);
    /// Ticket id does not name a live thread or process.
    pub const INVALID_CID: Self = Self(0xC000_000B);
    /// Malformed argument.
    pub const INVALID_PARAMETER: Self = Self(0xC000_000D);
    /// Out of server memory or ticket space.
    pub const NO_MEMORY: Self = Self(0xC000_0017);
    /// Handle names an object of a different kind.
    pub const OBJECT_TYPE_MISMATCH: Self = Self(0xC000_0024);
    /// Caller lacks the required access right.
    pub const ACCESS_DENIED: Self = Self(0xC000_0022);
    /// Release attempted by a thread that does not own the mutex.
    pub const MUTANT_NOT_OWNED: Self = Self(0xC000_0046);
    /// Semaphore release would exceed its maximum count.
    pub const SEMAPHORE_LIMIT_EXCEEDED: Self = Self(0xC000_0047);
    /// The suspend counter is already at its maximum.
    pub const SUSPEND_COUNT_EXCEEDED: Self = Self(0xC000_004A);
    /// Target thread is terminated; no new state may be attached to it.
    pub const THREAD_IS_TERMINATING: Self = Self(0xC000_004B);
    /// Requested CPU type is not supported by this server build.
    pub const NOT_SUPPORTED: Self = Self(0xC000_00BB);
    /// Target process is already exiting.
    pub const PROCESS_IS_TERMINATING: Self = Self(0xC000_010A);
    /// In-flight descriptor could not be materialised.
    pub const TOO_MANY_OPENED_FILES: Self = Self(0xC000_011F);
    /// CPU type is supported by the server but masked out by the prefix.
    pub const NOT_REGISTRY_FILE: Self = Self(0xC000_015C);

    /// Create a status from its raw word.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Get the raw status word.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Wake status for a satisfied wait on object `index`.
    #[inline]
    #[must_use]
    pub const fn from_wait_index(index: u32) -> Self {
        Self(Self::WAIT_0.0 + index)
    }

    /// Wake status for a wait on object `index` satisfied in the
    /// abandoned state.
    #[inline]
    #[must_use]
    pub const fn from_abandoned_index(index: u32) -> Self {
        Self(Self::ABANDONED_WAIT_0.0 + index)
    }

    /// Severity field (bits 31:30).
    #[inline]
    #[must_use]
    pub const fn severity(self) -> u32 {
        self.0 >> 30
    }

    /// Check for error severity. A reply carrying an error status is
    /// marked failed by the dispatcher.
    #[inline]
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.severity() == 3
    }

    /// Check for plain success (not merely success severity).
    #[inline]
    #[must_use]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Name of a well-known status, for logging.
    pub const fn name(self) -> &'static str {
        match self.0 {
            0x0000_0000 => "SUCCESS",
            0x0000_0080 => "ABANDONED_WAIT_0",
            0x0000_00C0 => "USER_APC",
            0x0000_0102 => "TIMEOUT",
            0x0000_0103 => "PENDING",
            0x8000_0003 => "BREAKPOINT",
            0xC000_0001 => "UNSUCCESSFUL",
            0xC000_0008 => "INVALID_HANDLE",
            0xC000_000B => "INVALID_CID",
            0xC000_000D => "INVALID_PARAMETER",
            0xC000_0017 => "NO_MEMORY",
            0xC000_0024 => "OBJECT_TYPE_MISMATCH",
            0xC000_0022 => "ACCESS_DENIED",
            0xC000_0046 => "MUTANT_NOT_OWNED",
            0xC000_0047 => "SEMAPHORE_LIMIT_EXCEEDED",
            0xC000_004A => "SUSPEND_COUNT_EXCEEDED",
            0xC000_004B => "THREAD_IS_TERMINATING",
            0xC000_00BB => "NOT_SUPPORTED",
            0xC000_010A => "PROCESS_IS_TERMINATING",
            0xC000_011F => "TOO_MANY_OPENED_FILES",
            0xC000_015C => "NOT_REGISTRY_FILE",
            _ => "",
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name.is_empty() {
            write!(f, "Status({:#010x})", self.0)
        } else {
            write!(f, "Status::{name}")
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.name();
        if name.is_empty() {
            write!(f, "{:#010x}", self.0)
        } else {
            f.write_str(name)
        }
    }
}

/// Result of a core operation. `Err` always carries error severity;
/// deferred outcomes travel in `Ok`.
pub type SvcResult<T> = Result<T, Status>;
