//! Asynchronous procedure call descriptors.
//!
//! An APC is described twice on the wire: the call the server hands to
//! the client, and the result the client posts back on its next
//! `select`. Calls are routed to one of two per-thread queues by their
//! kind; system-queue calls can interrupt any interruptible wait, while
//! user-queue calls need an alertable wait.

use crate::status::Status;
use crate::{Abstime, ClientPtr, Handle};

/// Queue a call is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApcQueueClass {
    /// Delivered only at alertable points.
    User,
    /// Delivered whenever the client enters the server.
    System,
}

/// Discriminant of an APC call, used for coalescing and cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ApcKind {
    /// Wake-only call; discarded at delivery.
    None,
    /// Client-supplied user routine.
    User,
    /// Timer completion routine.
    Timer,
    /// Async I/O completion routine.
    AsyncIo,
    /// Reserve or commit client address space.
    VirtualAlloc,
    /// Release client address space.
    VirtualFree,
    /// Query a client address range.
    VirtualQuery,
    /// Change protection on a client range.
    VirtualProtect,
    /// Flush a client range.
    VirtualFlush,
    /// Lock a client range in memory.
    VirtualLock,
    /// Unlock a client range.
    VirtualUnlock,
    /// Map a section view into the client.
    MapView,
    /// Unmap a section view.
    UnmapView,
    /// Start a new thread in the client.
    CreateThread,
}

impl ApcKind {
    /// The queue this kind is routed to.
    #[must_use]
    pub const fn queue_class(self) -> ApcQueueClass {
        match self {
            Self::None | Self::User | Self::Timer => ApcQueueClass::User,
            _ => ApcQueueClass::System,
        }
    }
}

/// Call descriptor handed to the client for execution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApcCall {
    /// Wake the thread; nothing to execute.
    None,
    /// Run a user routine.
    User {
        /// Client routine address.
        func: ClientPtr,
        /// Arguments passed through unchanged.
        args: [u64; 3],
    },
    /// Run a timer completion routine.
    Timer {
        /// Expiry time the timer fired at.
        time: Abstime,
        /// Client argument.
        arg: ClientPtr,
    },
    /// Run an async I/O completion routine.
    AsyncIo {
        /// Client completion routine.
        func: ClientPtr,
        /// Client user data.
        user: ClientPtr,
        /// Client status block address.
        sb: ClientPtr,
        /// Completion status.
        status: Status,
    },
    /// Reserve or commit address space in the target.
    VirtualAlloc {
        /// Requested base address.
        addr: ClientPtr,
        /// Requested size in bytes.
        size: u64,
        /// Zero-bits constraint on the base.
        zero_bits: u32,
        /// Allocation operation type.
        op_type: u32,
        /// Page protection.
        prot: u32,
    },
    /// Release address space in the target.
    VirtualFree {
        /// Base address.
        addr: ClientPtr,
        /// Size in bytes.
        size: u64,
        /// Free operation type.
        op_type: u32,
    },
    /// Query an address range in the target.
    VirtualQuery {
        /// Address to query.
        addr: ClientPtr,
    },
    /// Change page protection in the target.
    VirtualProtect {
        /// Base address.
        addr: ClientPtr,
        /// Size in bytes.
        size: u64,
        /// New protection.
        prot: u32,
    },
    /// Flush an address range in the target.
    VirtualFlush {
        /// Base address.
        addr: ClientPtr,
        /// Size in bytes.
        size: u64,
    },
    /// Lock an address range in the target.
    VirtualLock {
        /// Base address.
        addr: ClientPtr,
        /// Size in bytes.
        size: u64,
    },
    /// Unlock an address range in the target.
    VirtualUnlock {
        /// Base address.
        addr: ClientPtr,
        /// Size in bytes.
        size: u64,
    },
    /// Map a section view into the target.
    MapView {
        /// Section handle, valid in the target process.
        handle: Handle,
        /// Requested base address.
        addr: ClientPtr,
        /// View size in bytes.
        size: u64,
        /// Section offset.
        offset: u64,
        /// Zero-bits constraint on the base.
        zero_bits: u32,
        /// Allocation type.
        alloc_type: u32,
        /// Page protection.
        prot: u32,
    },
    /// Unmap a section view from the target.
    UnmapView {
        /// View base address.
        addr: ClientPtr,
    },
    /// Create a thread in the target.
    CreateThread {
        /// Entry point.
        func: ClientPtr,
        /// Entry argument.
        arg: ClientPtr,
        /// Stack reserve size.
        reserve: u64,
        /// Stack commit size.
        commit: u64,
        /// Create the thread suspended.
        suspend: bool,
    },
}

impl ApcCall {
    /// Discriminant of this call.
    #[must_use]
    pub const fn kind(&self) -> ApcKind {
        match self {
            Self::None => ApcKind::None,
            Self::User { .. } => ApcKind::User,
            Self::Timer { .. } => ApcKind::Timer,
            Self::AsyncIo { .. } => ApcKind::AsyncIo,
            Self::VirtualAlloc { .. } => ApcKind::VirtualAlloc,
            Self::VirtualFree { .. } => ApcKind::VirtualFree,
            Self::VirtualQuery { .. } => ApcKind::VirtualQuery,
            Self::VirtualProtect { .. } => ApcKind::VirtualProtect,
            Self::VirtualFlush { .. } => ApcKind::VirtualFlush,
            Self::VirtualLock { .. } => ApcKind::VirtualLock,
            Self::VirtualUnlock { .. } => ApcKind::VirtualUnlock,
            Self::MapView { .. } => ApcKind::MapView,
            Self::UnmapView { .. } => ApcKind::UnmapView,
            Self::CreateThread { .. } => ApcKind::CreateThread,
        }
    }

    /// The queue this call is routed to.
    #[inline]
    #[must_use]
    pub const fn queue_class(&self) -> ApcQueueClass {
        self.kind().queue_class()
    }
}

/// Result descriptor posted by the client after executing an APC.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ApcResult {
    /// No result yet, or the call produced none.
    #[default]
    None,
    /// Outcome of a thread creation.
    CreateThread {
        /// Creation status.
        status: Status,
        /// New thread id.
        tid: u32,
        /// Thread handle; valid in the executing process until the
        /// server transfers it to the original caller.
        handle: Handle,
    },
    /// Outcome of an async I/O completion routine.
    AsyncIo {
        /// Completion status.
        status: Status,
        /// Bytes transferred.
        total: u32,
        /// Follow-up APC routine, if the completion chained one.
        apc: ClientPtr,
    },
    /// Outcome of an address-space operation.
    Virtual {
        /// Operation status.
        status: Status,
        /// Resulting base address.
        addr: ClientPtr,
        /// Resulting size in bytes.
        size: u64,
    },
    /// Outcome of a view map or unmap.
    View {
        /// Operation status.
        status: Status,
    },
}
