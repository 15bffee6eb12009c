//! Host-facing error types.
//!
//! Guest-visible faults never show up here: they are `ExceptionEvent`s that
//! the dispatcher turns into trap entry. What remains are defects in the
//! emulator itself (unknown CSR ids, unknown cause codes, out-of-range TLB
//! indices) and failures of host-facing operations such as snapshot restore.

use thiserror::Error;

/// Physical memory access failure reported by a `Bus` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Physical address out of bounds: {0:#x}")]
    OutOfBounds(u64),
    #[error("Invalid access size {size} at {addr:#x}")]
    InvalidSize { addr: u64, size: usize },
}

/// Fatal core error. Any of these aborts emulation of the core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("internal error: unknown CSR id {0:#x}")]
    UnknownCsr(u16),

    #[error("internal error: unknown exception cause {0:#x}")]
    UnknownException(u32),

    #[error("internal error: TLB index {0} outside both pools")]
    InvalidTlbIndex(usize),

    #[error("internal error: IR temporary t{0} read before being written")]
    UndefinedTemp(u32),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
}

impl From<bincode::Error> for CoreError {
    fn from(err: bincode::Error) -> Self {
        CoreError::Snapshot(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = CoreError::UnknownCsr(0x7ff);
        assert_eq!(err.to_string(), "internal error: unknown CSR id 0x7ff");

        let err: CoreError = MemoryError::OutOfBounds(0x1234).into();
        assert!(err.to_string().contains("0x1234"));
    }
}
