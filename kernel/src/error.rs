//! Recoverable failures.
//!
//! Broken kernel invariants are not errors; they panic.

use core::fmt;

/// Failures reported to callers of the process-control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Every process slot is in use.
    NoFreeSlot,
    /// A frame for a kernel stack, page table or user page was unavailable.
    OutOfMemory,
    /// `await_child` found nothing to wait for.
    NoChildren,
    /// No live process has the requested pid.
    NoSuchProcess,
    /// The caller was marked for termination while waiting.
    Killed,
    /// Growth would reach into the kernel-reserved region.
    LimitExceeded,
    /// A user address is unmapped or not user-accessible.
    BadAddress,
    /// The file layer failed to deliver the requested bytes.
    IoError,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::NoFreeSlot => "process table full",
            KernelError::OutOfMemory => "out of physical memory",
            KernelError::NoChildren => "no children",
            KernelError::NoSuchProcess => "no such process",
            KernelError::Killed => "killed",
            KernelError::LimitExceeded => "size limit exceeded",
            KernelError::BadAddress => "bad address",
            KernelError::IoError => "i/o error",
        };
        f.write_str(msg)
    }
}

/// Failures of the address-space manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    LimitExceeded,
    BadAddress,
    IoError,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&KernelError::from(*self), f)
    }
}

impl From<VmError> for KernelError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfMemory => KernelError::OutOfMemory,
            VmError::LimitExceeded => KernelError::LimitExceeded,
            VmError::BadAddress => KernelError::BadAddress,
            VmError::IoError => KernelError::IoError,
        }
    }
}
