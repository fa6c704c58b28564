//! Fatal engine errors.
//!
//! Most failure modes in Glulx are non-fatal and encoded in-band (a zero
//! return from `malloc`, a `1` stored at a save destination, `hasundo`
//! returning false). This module covers only the handful of conditions
//! the spec declares fatal: the host is expected to tear down or restart
//! the VM when it sees one of these.

use thiserror::Error;

/// The kind of fatal condition encountered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmErrorKind {
    /// Story file failed the magic-number or length check at load time.
    BadImage,
    /// `div`/`mod` by zero, or `INT_MIN / -1`.
    DivideByZero,
    /// A push would exceed `stackSize`.
    StackOverflow,
    /// A pop/peek would cross below `FP + FrameLen`, or read past SP == 0.
    StackUnderflow,
    /// First opcode byte is not a valid variable-length prefix.
    IllegalOpcode,
    /// An operand's addressing-mode nibble is 4 or C, or otherwise invalid
    /// for the position (e.g. mode 0 used for a load where load is required).
    IllegalAddressingMode,
    /// A call stub popped at `return` time carries an unrecognised DestType,
    /// or a string-resume stub was found where a normal return was expected.
    BadCallStub,
    /// A memory-size constraint fixed at load time doesn't hold, e.g. the
    /// header's `stackSize` isn't a multiple of 256. Distinct from the
    /// in-band failure `setmemsize` returns at runtime, which just leaves
    /// memory at its current size rather than tearing down the VM.
    MemorySizeConstraint,
}

impl VmErrorKind {
    /// Stable, human-readable code — this is what gets logged and shown
    /// to the host, independent of `Display`'s full sentence form.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            VmErrorKind::BadImage => "bad-image",
            VmErrorKind::DivideByZero => "divide-by-zero",
            VmErrorKind::StackOverflow => "stack-overflow",
            VmErrorKind::StackUnderflow => "stack-underflow",
            VmErrorKind::IllegalOpcode => "illegal-opcode",
            VmErrorKind::IllegalAddressingMode => "illegal-addressing-mode",
            VmErrorKind::BadCallStub => "bad-call-stub",
            VmErrorKind::MemorySizeConstraint => "memory-size-constraint",
        }
    }
}

/// A fatal VM error, tagged with the program counter at the point of failure.
///
/// `pc` is `u32::MAX` for errors raised before execution starts (e.g. a bad
/// image at load time, which has no PC yet).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("glulx: {} at pc={pc:#010x}", kind.code())]
pub struct VmError {
    pub kind: VmErrorKind,
    pub pc: u32,
}

impl VmError {
    #[must_use]
    pub const fn new(kind: VmErrorKind, pc: u32) -> Self {
        Self { kind, pc }
    }

    #[must_use]
    pub const fn at_load(kind: VmErrorKind) -> Self {
        Self { kind, pc: u32::MAX }
    }
}

pub type VmResult<T> = Result<T, VmError>;
