//! PIN-protected, tamper-evident key-value storage for secure devices.
//!
//! The crate layers an encryption and authentication envelope on top of an
//! append-only keyed flash log (the [`FlashLog`] contract). Values live under
//! 16-bit keys whose high byte selects an application namespace: entries with
//! the namespace top bit set are public (plaintext, readable while locked),
//! everything else is encrypted under a random data encryption key and
//! contributes to a whole-storage authentication tag, so deleting or
//! reordering entries on flash is detected.
//!
//! The data encryption key itself is wrapped under a key derived from the
//! user PIN and only lives in RAM between [`Storage::unlock`] and
//! [`Storage::lock`]. Failed PIN attempts burn a flash-backed counter with a
//! glitch-resistant encoding and exponential backoff; exhausting the budget
//! wipes the storage. Internal consistency failures are treated as fault
//! injection and routed through a central guard that charges the same
//! counter and refuses further service.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod aead;
mod auth;
mod error;
mod fault;
mod kdf;
mod pin_log;
mod storage;

pub mod flash;
pub mod mock_flash;

pub use error::StorageError;
pub use flash::{FlashError, FlashLog, FORMAT_VERSION};
pub use mock_flash::MockFlash;
pub use storage::{DelayFn, Storage, UiCallback, PIN_EMPTY, PIN_MAX_TRIES};
