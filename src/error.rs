use crate::flash::FlashError;
use thiserror::Error;

/// Errors surfaced by the storage core.
///
/// Three response classes hide behind the variants: benign rejections leave
/// the storage untouched, [`AuthFailed`](StorageError::AuthFailed) on the
/// unlock path charges the retry counter, and [`Fault`](StorageError::Fault)
/// means the fault guard fired and the context refuses further service until
/// it is reinitialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("storage is not initialized")]
    Uninitialized,
    #[error("storage is locked")]
    Locked,
    #[error("no value stored under the key")]
    NotFound,
    #[error("key lies in a reserved namespace")]
    ReservedKey,
    #[error("destination buffer is too small")]
    BufferTooSmall,
    #[error("flash entry is malformed")]
    Corrupted,
    #[error("authentication failed")]
    AuthFailed,
    #[error("unsupported storage format version {0}")]
    UnsupportedVersion(u32),
    #[error("retry budget exhausted, storage wiped")]
    Wiped,
    #[error("fault detected, device halted")]
    Fault,
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),
}
