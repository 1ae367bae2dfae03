//! Kernel error taxonomy
//!
//! Recoverable errors only: every variant can be handed back to user code
//! as a negative result code. Structural corruption is not an error value;
//! see [`crate::invariants::fatal`].

use core::fmt;

/// Errors returned at the syscall boundary
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Environment identifier does not resolve
    NotFound,
    /// Malformed argument (alignment, range, status value)
    InvalidArgument,
    /// Physical page allocator exhausted
    OutOfMemory,
    /// Environment table exhausted
    NoFreeSlot,
    /// Address not mapped, or mapped without the needed permission
    BadAddress,
    /// IPC target is not blocked in receive
    NotReceiving,
    /// Identifier refers to a previous occupant of a reused slot
    StaleReference,
    /// Caller may not act on the target environment
    PermissionDenied,
    /// Executable image header or layout rejected
    InvalidImage,
    /// Environment is frozen for migration
    MigrationInProgress,
    /// Device collaborator failed
    Device,
    /// Operation unavailable on this node
    NotSupported,
}

impl KernelError {
    /// Stable negative result code written into the result register
    pub fn code(self) -> i64 {
        match self {
            KernelError::NotFound => -2,
            KernelError::InvalidArgument => -3,
            KernelError::OutOfMemory => -4,
            KernelError::NoFreeSlot => -5,
            KernelError::BadAddress => -6,
            KernelError::NotReceiving => -7,
            KernelError::StaleReference => -8,
            KernelError::PermissionDenied => -9,
            KernelError::InvalidImage => -10,
            KernelError::MigrationInProgress => -11,
            KernelError::Device => -12,
            KernelError::NotSupported => -13,
        }
    }

    /// Inverse of [`KernelError::code`]
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            -2 => KernelError::NotFound,
            -3 => KernelError::InvalidArgument,
            -4 => KernelError::OutOfMemory,
            -5 => KernelError::NoFreeSlot,
            -6 => KernelError::BadAddress,
            -7 => KernelError::NotReceiving,
            -8 => KernelError::StaleReference,
            -9 => KernelError::PermissionDenied,
            -10 => KernelError::InvalidImage,
            -11 => KernelError::MigrationInProgress,
            -12 => KernelError::Device,
            -13 => KernelError::NotSupported,
            _ => return None,
        })
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::NotFound => "environment not found",
            KernelError::InvalidArgument => "invalid argument",
            KernelError::OutOfMemory => "out of memory",
            KernelError::NoFreeSlot => "no free environment slot",
            KernelError::BadAddress => "bad address",
            KernelError::NotReceiving => "target not receiving",
            KernelError::StaleReference => "stale environment reference",
            KernelError::PermissionDenied => "permission denied",
            KernelError::InvalidImage => "invalid executable image",
            KernelError::MigrationInProgress => "migration in progress",
            KernelError::Device => "device error",
            KernelError::NotSupported => "not supported",
        };
        f.write_str(msg)
    }
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Collapse a unit result into a result-register value
pub fn to_code(result: KernelResult<()>) -> i64 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative_and_invertible() {
        let all = [
            KernelError::NotFound,
            KernelError::InvalidArgument,
            KernelError::OutOfMemory,
            KernelError::NoFreeSlot,
            KernelError::BadAddress,
            KernelError::NotReceiving,
            KernelError::StaleReference,
            KernelError::PermissionDenied,
            KernelError::InvalidImage,
            KernelError::MigrationInProgress,
            KernelError::Device,
            KernelError::NotSupported,
        ];
        for e in all {
            assert!(e.code() < 0);
            assert_eq!(KernelError::from_code(e.code()), Some(e));
        }
        assert_eq!(KernelError::from_code(0), None);
    }

    #[test]
    fn test_to_code() {
        assert_eq!(to_code(Ok(())), 0);
        assert_eq!(to_code(Err(KernelError::NotReceiving)), -7);
    }
}
