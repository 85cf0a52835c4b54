//! Register context records.
//!
//! The server never interprets client registers beyond the control bank;
//! each bank is an opaque blob tagged with the owning CPU type. Transfers
//! are bank-granular, selected by [`ContextFlags`].

use crate::cpu::CpuType;
use crate::flags::ContextFlags;
use crate::ClientPtr;

/// Control registers: the one bank the server reads (breakpoint
/// dispatch needs the instruction pointer).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlRegs {
    /// Instruction pointer.
    pub ip: ClientPtr,
    /// Stack pointer.
    pub sp: ClientPtr,
    /// CPU flags word.
    pub flags: u64,
}

/// A captured register context.
///
/// Banks not selected in `flags` hold unspecified data and must not be
/// copied out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    /// CPU this context belongs to. Transfers across CPU types are
    /// rejected before any bank is touched.
    pub cpu: CpuType,
    /// Banks that hold valid data.
    pub flags: ContextFlags,
    /// Control registers.
    pub ctl: ControlRegs,
    /// Integer registers.
    pub integer: [u64; 16],
    /// Segment registers.
    pub seg: [u32; 8],
    /// Floating-point state.
    pub fp: [u64; 32],
    /// Hardware debug registers.
    pub debug: [u64; 8],
    /// Extended (vector) state.
    pub ext: [u64; 16],
}

impl Context {
    /// Create an empty context for `cpu`; no bank is valid yet.
    #[must_use]
    pub fn new(cpu: CpuType) -> Self {
        Self {
            cpu,
            flags: ContextFlags::NONE,
            ctl: ControlRegs::default(),
            integer: [0; 16],
            seg: [0; 8],
            fp: [0; 32],
            debug: [0; 8],
            ext: [0; 16],
        }
    }

    /// Copy the banks selected by `flags` from `from` into `self` and
    /// mark them valid. Both contexts must carry the same CPU tag.
    pub fn copy_from(&mut self, from: &Context, flags: ContextFlags) {
        debug_assert_eq!(self.cpu, from.cpu);
        self.flags = self.flags | flags;
        if flags.intersects(ContextFlags::CONTROL) {
            self.ctl = from.ctl;
        }
        if flags.intersects(ContextFlags::INTEGER) {
            self.integer = from.integer;
        }
        if flags.intersects(ContextFlags::SEGMENTS) {
            self.seg = from.seg;
        }
        if flags.intersects(ContextFlags::FLOATING_POINT) {
            self.fp = from.fp;
        }
        if flags.intersects(ContextFlags::DEBUG_REGISTERS) {
            self.debug = from.debug;
        }
        if flags.intersects(ContextFlags::EXTENDED) {
            self.ext = from.ext;
        }
    }
}

/// Banks that only the server side can access for a given CPU.
///
/// On x86 CPUs the hardware debug registers cannot be read from the
/// client side; everywhere else the partition is empty.
#[inline]
#[must_use]
pub const fn system_regs(cpu: CpuType) -> ContextFlags {
    match cpu {
        CpuType::X86 | CpuType::X86_64 => ContextFlags::DEBUG_REGISTERS,
        CpuType::PowerPc | CpuType::Arm | CpuType::Arm64 => ContextFlags::NONE,
    }
}
