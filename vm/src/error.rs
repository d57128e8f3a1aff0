use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

pub type Result<T> = core::result::Result<T, VmError>;

/// Error type for VM operations.
///
/// Every variant is recovered at the process boundary: a `SegFault` or
/// `OutOfMemory` terminates the faulting process, never the kernel.
/// Write-back failures during eviction have no safe recovery (the page's
/// contents would be lost) and panic instead of appearing here.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The address was never mapped, or a write hit a read-only page.
    SegFault,
    /// `insert_mapping` called twice for the same virtual page.
    DuplicateMapping,
    /// No frame could be freed even after an eviction attempt, or the
    /// swap store is exhausted.
    OutOfMemory,
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::SegFault => write!(f, "SegFault"),
            VmError::DuplicateMapping => write!(f, "DuplicateMapping"),
            VmError::OutOfMemory => write!(f, "OutOfMemory"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::SegFault => write!(f, "address not mapped or not writable"),
            VmError::DuplicateMapping => write!(f, "virtual page already mapped"),
            VmError::OutOfMemory => write!(f, "no frame freeable and swap exhausted"),
        }
    }
}

impl Error for VmError {}
