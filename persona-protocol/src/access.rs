//! Object access masks.
//!
//! An access mask is a 32-bit word: object-specific rights in the low
//! 16 bits, standard rights in bits 16-23, and the generic aliases in
//! the top nibble. Generic bits never reach an object; they are mapped
//! to specific rights when a handle is allocated.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

/// Access rights requested on, or granted to, a handle.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct AccessMask(u32);

impl AccessMask {
    /// No rights.
    pub const NONE: Self = Self(0);

    /// Wait on the object.
    pub const SYNCHRONIZE: Self = Self(0x0010_0000);
    /// Read the security descriptor and basic object state.
    pub const READ_CONTROL: Self = Self(0x0002_0000);

    /// Standard rights implied by a read-class grant.
    pub const STANDARD_RIGHTS_READ: Self = Self::READ_CONTROL;
    /// Standard rights implied by a write-class grant.
    pub const STANDARD_RIGHTS_WRITE: Self = Self::READ_CONTROL;
    /// Standard rights implied by an execute-class grant.
    pub const STANDARD_RIGHTS_EXECUTE: Self = Self::READ_CONTROL;
    /// All standard rights.
    pub const STANDARD_RIGHTS_REQUIRED: Self = Self(0x000F_0000);

    /// Generic read alias.
    pub const GENERIC_READ: Self = Self(0x8000_0000);
    /// Generic write alias.
    pub const GENERIC_WRITE: Self = Self(0x4000_0000);
    /// Generic execute alias.
    pub const GENERIC_EXECUTE: Self = Self(0x2000_0000);
    /// Generic all-access alias.
    pub const GENERIC_ALL: Self = Self(0x1000_0000);

    // -- Thread-specific rights

    /// Terminate the thread.
    pub const THREAD_TERMINATE: Self = Self(0x0001);
    /// Suspend or resume the thread.
    pub const THREAD_SUSPEND_RESUME: Self = Self(0x0002);
    /// Read the thread's register context.
    pub const THREAD_GET_CONTEXT: Self = Self(0x0008);
    /// Write the thread's register context (also gates user APCs).
    pub const THREAD_SET_CONTEXT: Self = Self(0x0010);
    /// Change scheduling attributes.
    pub const THREAD_SET_INFORMATION: Self = Self(0x0020);
    /// Query thread attributes.
    pub const THREAD_QUERY_INFORMATION: Self = Self(0x0040);
    /// Replace the impersonation token.
    pub const THREAD_SET_THREAD_TOKEN: Self = Self(0x0080);
    /// Every thread right.
    pub const THREAD_ALL_ACCESS: Self =
        Self(Self::STANDARD_RIGHTS_REQUIRED.0 | Self::SYNCHRONIZE.0 | 0x03FF);

    // -- Synchronization-object rights

    /// Set, reset or pulse an event.
    pub const EVENT_MODIFY_STATE: Self = Self(0x0002);
    /// Release a semaphore.
    pub const SEMAPHORE_MODIFY_STATE: Self = Self(0x0002);

    // -- Process-specific rights the core checks when routing APCs

    /// Create a thread in the process.
    pub const PROCESS_CREATE_THREAD: Self = Self(0x0002);
    /// Duplicate handles into or out of the process.
    pub const PROCESS_DUP_HANDLE: Self = Self(0x0040);
    /// Operate on the process address space.
    pub const PROCESS_VM_OPERATION: Self = Self(0x0008);
    /// Query process attributes.
    pub const PROCESS_QUERY_INFORMATION: Self = Self(0x0400);
    /// Every process right.
    pub const PROCESS_ALL_ACCESS: Self =
        Self(Self::STANDARD_RIGHTS_REQUIRED.0 | Self::SYNCHRONIZE.0 | 0x0FFF);

    /// Create a mask from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Get the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Check that every bit of `rights` is present in `self`.
    #[inline]
    #[must_use]
    pub const fn contains(self, rights: Self) -> bool {
        (self.0 & rights.0) == rights.0
    }

    /// Check whether any generic alias bit is set.
    #[inline]
    #[must_use]
    pub const fn has_generic(self) -> bool {
        (self.0
            & (Self::GENERIC_READ.0
                | Self::GENERIC_WRITE.0
                | Self::GENERIC_EXECUTE.0
                | Self::GENERIC_ALL.0))
            != 0
    }

    /// Map generic alias bits to thread-specific rights.
    ///
    /// The returned mask carries no generic bits.
    #[must_use]
    pub const fn map_thread_generic(self) -> Self {
        let mut bits = self.0;
        if self.contains(Self::GENERIC_READ) {
            bits |= Self::STANDARD_RIGHTS_READ.0 | Self::SYNCHRONIZE.0;
        }
        if self.contains(Self::GENERIC_WRITE) {
            bits |= Self::STANDARD_RIGHTS_WRITE.0 | Self::SYNCHRONIZE.0;
        }
        if self.contains(Self::GENERIC_EXECUTE) {
            bits |= Self::STANDARD_RIGHTS_EXECUTE.0;
        }
        if self.contains(Self::GENERIC_ALL) {
            bits |= Self::THREAD_ALL_ACCESS.0;
        }
        Self(
            bits & !(Self::GENERIC_READ.0
                | Self::GENERIC_WRITE.0
                | Self::GENERIC_EXECUTE.0
                | Self::GENERIC_ALL.0),
        )
    }

    /// Map generic alias bits to process-specific rights.
    #[must_use]
    pub const fn map_process_generic(self) -> Self {
        let mut bits = self.0;
        if self.contains(Self::GENERIC_READ) {
            bits |= Self::STANDARD_RIGHTS_READ.0 | Self::PROCESS_QUERY_INFORMATION.0;
        }
        if self.contains(Self::GENERIC_WRITE) {
            bits |= Self::STANDARD_RIGHTS_WRITE.0 | Self::PROCESS_VM_OPERATION.0;
        }
        if self.contains(Self::GENERIC_EXECUTE) {
            bits |= Self::STANDARD_RIGHTS_EXECUTE.0 | Self::SYNCHRONIZE.0;
        }
        if self.contains(Self::GENERIC_ALL) {
            bits |= Self::PROCESS_ALL_ACCESS.0;
        }
        Self(
            bits & !(Self::GENERIC_READ.0
                | Self::GENERIC_WRITE.0
                | Self::GENERIC_EXECUTE.0
                | Self::GENERIC_ALL.0),
        )
    }
}

impl BitOr for AccessMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for AccessMask {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for AccessMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccessMask({:#010x})", self.0)
    }
}
