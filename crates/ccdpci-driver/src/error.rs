//! Error types for board operations

use thiserror::Error;

/// Result type alias for board operations
pub type Result<T> = std::result::Result<T, DriverError>;

/// Errors that can occur during board operations
#[derive(Debug, Error)]
pub enum DriverError {
    /// Hardware did not respond within the bounded wait
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Wait budget that was exhausted, in milliseconds
        duration_ms: u64,
    },

    /// Hardware is still working on a previous request
    #[error("Board busy: {what}")]
    Busy {
        /// What was busy
        what: String,
    },

    /// Board index outside the board table
    #[error("Board index {index} out of range (table holds {count})")]
    BadDeviceNumber {
        /// Requested index
        index: usize,
        /// Table capacity
        count: usize,
    },

    /// No probed board of the requested kind at this index
    #[error("No probed board at index {index}")]
    NoSuchDevice {
        /// Requested index
        index: usize,
    },

    /// Another session owns the board
    #[error("Board {index} is already open")]
    AlreadyOpen {
        /// Board index
        index: usize,
    },

    /// Caller memory could not be read or written
    #[error("User buffer fault while {what}")]
    UserCopyFault {
        /// Which copy failed
        what: String,
    },

    /// A DMA block could not be allocated
    #[error("Out of DMA memory after {entries} blocks")]
    OutOfMemory {
        /// Blocks allocated before the failure
        entries: usize,
    },

    /// Requested buffer needs more blocks than the descriptor table holds
    #[error("Buffer needs {blocks} blocks, descriptor table holds {capacity}")]
    OutOfCapacity {
        /// Blocks required
        blocks: usize,
        /// Usable table entries
        capacity: usize,
    },

    /// Controller answered with an error or reset reply
    #[error("Protocol error: reply {reply:#x}")]
    ProtocolError {
        /// Reply word received
        reply: u32,
    },

    /// Command not marked as allowed during an image readout
    #[error("Command rejected: controller is reading out an image")]
    ReadoutConflict,

    /// Caller passed an argument the board cannot accept
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// No image buffer is mapped for this board
    #[error("No image buffer mapped")]
    NotMapped,

    /// Opcode not implemented by this board
    #[error("Unsupported control opcode {opcode:#x}")]
    Unsupported {
        /// Opcode received
        opcode: u32,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl DriverError {
    /// Create a busy error
    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy { what: what.into() }
    }

    /// Create a user copy fault
    pub fn user_fault(what: impl Into<String>) -> Self {
        Self::UserCopyFault { what: what.into() }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a timeout error from a wait budget
    pub fn timeout(budget: std::time::Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Negative errno reported to a control-call caller.
    pub fn errno(&self) -> i32 {
        -match self {
            Self::Timeout { .. } => libc::ETIMEDOUT,
            Self::Busy { .. } | Self::AlreadyOpen { .. } => libc::EBUSY,
            Self::BadDeviceNumber { .. } | Self::NoSuchDevice { .. } => libc::ENXIO,
            Self::UserCopyFault { .. } => libc::EFAULT,
            Self::OutOfMemory { .. } | Self::OutOfCapacity { .. } => libc::ENOMEM,
            Self::ProtocolError { .. } | Self::ReadoutConflict | Self::Io { .. } => libc::EIO,
            Self::InvalidArgument { .. } | Self::NotMapped => libc::EINVAL,
            Self::Unsupported { .. } => libc::ENOTTY,
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Busy { .. })
    }
}

/// Status code a control call returns: `0` on success, negative errno otherwise.
pub fn status_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.errno(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_negative_for_every_kind() {
        let errors = [
            DriverError::Timeout { duration_ms: 1 },
            DriverError::busy("hcvr"),
            DriverError::BadDeviceNumber { index: 9, count: 2 },
            DriverError::AlreadyOpen { index: 0 },
            DriverError::user_fault("reading arg"),
            DriverError::OutOfMemory { entries: 3 },
            DriverError::OutOfCapacity { blocks: 9000, capacity: 8191 },
            DriverError::ProtocolError { reply: 0x455252 },
            DriverError::ReadoutConflict,
            DriverError::Unsupported { opcode: 0x99 },
        ];
        for e in &errors {
            assert!(e.errno() < 0, "{e} mapped to {}", e.errno());
        }
    }

    #[test]
    fn status_code_maps_results() {
        assert_eq!(status_code(&Ok::<_, DriverError>(5)), 0);
        assert_eq!(
            status_code::<()>(&Err(DriverError::AlreadyOpen { index: 1 })),
            -libc::EBUSY
        );
        assert_eq!(
            status_code::<()>(&Err(DriverError::user_fault("x"))),
            -libc::EFAULT
        );
    }

    #[test]
    fn only_waits_are_transient() {
        assert!(DriverError::Timeout { duration_ms: 10 }.is_transient());
        assert!(!DriverError::ReadoutConflict.is_transient());
    }
}
