use thiserror::Error;

use crate::mem::BufferSpec;
use crate::queue::CmdKind;

pub type Result<T> = std::result::Result<T, HcqError>;

/// Errors surfaced by the runtime core.
///
/// The core never retries: a [`WaitTimeout`][HcqError::WaitTimeout] bubbles
/// up unless the backend's `on_device_hang` hook intercepts it, and kind
/// mismatches are programmer errors that fail immediately.
#[derive(Debug, Error)]
pub enum HcqError {
    /// A signal did not reach the target value in time.
    #[error("wait timeout: {timeout_ms} ms! (the signal is not set to {expected}, but {observed})")]
    WaitTimeout {
        expected: u64,
        observed: u64,
        timeout_ms: u64,
    },

    /// An `update_*` call named a command of a different kind.
    #[error("called update_{expected} on a {actual} command (index {idx})")]
    CommandKindMismatch {
        idx: usize,
        expected: CmdKind,
        actual: CmdKind,
    },

    /// A primitive hook the concrete backend did not override.
    #[error("backend does not implement {0}")]
    NotImplementedByBackend(&'static str),

    /// Raised by a backend's `on_device_hang` when it cannot recover.
    #[error("device hang")]
    DeviceHang,

    /// The allocator cannot satisfy a request.
    #[error("failed to allocate {size} bytes ({spec:?})")]
    AllocationFailed { size: usize, spec: BufferSpec },
}
