//! Request flag words.

use core::fmt;
use core::ops::BitOr;

/// Flags accepted by the `select` entrypoint.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct SelectFlags(u32);

impl SelectFlags {
    /// Plain WAIT-ANY, not alertable.
    pub const NONE: Self = Self(0);
    /// WAIT-ALL: every object must be signalled at once.
    pub const ALL: Self = Self(1 << 0);
    /// Queued user APCs may terminate the wait.
    pub const ALERTABLE: Self = Self(1 << 1);
    /// Queued system APCs may terminate the wait.
    pub const INTERRUPTIBLE: Self = Self(1 << 2);

    /// Create flags from raw bits.
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

    /// Check for the WAIT-ALL bit.
    #[inline]
    #[must_use]
    pub const fn wait_all(self) -> bool {
        (self.0 & Self::ALL.0) != 0
    }

    /// Check for the alertable bit.
    #[inline]
    #[must_use]
    pub const fn alertable(self) -> bool {
        (self.0 & Self::ALERTABLE.0) != 0
    }

    /// Check for the interruptible bit.
    #[inline]
    #[must_use]
    pub const fn interruptible(self) -> bool {
        (self.0 & Self::INTERRUPTIBLE.0) != 0
    }
}

impl BitOr for SelectFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for SelectFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SelectFlags({:#x})", self.0)
    }
}

/// Field mask for `set_thread_info`.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash, Debug)]
#[repr(transparent)]
pub struct ThreadInfoMask(u32);

impl ThreadInfoMask {
    /// Update the scheduling priority.
    pub const PRIORITY: Self = Self(1 << 0);
    /// Update the affinity mask.
    pub const AFFINITY: Self = Self(1 << 1);
    /// Replace the impersonation token.
    pub const TOKEN: Self = Self(1 << 2);

    /// Create a mask from raw bits.
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Check that `field` is selected.
    #[inline]
    #[must_use]
    pub const fn has(self, field: Self) -> bool {
        (self.0 & field.0) != 0
    }
}

impl BitOr for ThreadInfoMask {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Register-bank selector for context transfer.
///
/// Each bit names one bank of a [`Context`](crate::Context); copies move
/// only the selected banks.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct ContextFlags(u32);

impl ContextFlags {
    /// No banks.
    pub const NONE: Self = Self(0);
    /// Control registers (instruction pointer, stack pointer, flags).
    pub const CONTROL: Self = Self(1 << 0);
    /// General-purpose integer registers.
    pub const INTEGER: Self = Self(1 << 1);
    /// Segment registers.
    pub const SEGMENTS: Self = Self(1 << 2);
    /// Floating-point state.
    pub const FLOATING_POINT: Self = Self(1 << 3);
    /// Hardware debug registers.
    pub const DEBUG_REGISTERS: Self = Self(1 << 4);
    /// Extended (vector) state.
    pub const EXTENDED: Self = Self(1 << 5);
    /// Every bank.
    pub const ALL: Self = Self(0x3F);

    /// Create flags from raw bits.
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

    /// Check whether any of `banks` is selected.
    #[inline]
    #[must_use]
    pub const fn intersects(self, banks: Self) -> bool {
        (self.0 & banks.0) != 0
    }

    /// Banks selected by both masks.
    #[inline]
    #[must_use]
    pub const fn and(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }

    /// Banks selected by `self` but not by `rhs`.
    #[inline]
    #[must_use]
    pub const fn minus(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }

    /// Check for the empty selection.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for ContextFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for ContextFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextFlags({:#x})", self.0)
    }
}
