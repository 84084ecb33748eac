//! Contract for the append-only keyed flash log backing the storage core.
//!
//! The log stores byte strings under 16-bit keys, supports in-place
//! programming inside an already allocated entry (NOR semantics: bits only
//! transition 1 → 0 without an erase), and tracks a format version so the
//! core can migrate legacy layouts. Firmware links a driver over the real
//! flash controller; hosts and tests use [`MockFlash`](crate::mock_flash).

use thiserror::Error;

/// On-flash format version the storage core reads and writes.
pub const FORMAT_VERSION: u32 = 1;

/// Errors raised by a [`FlashLog`] implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("no flash entry for the key")]
    Missing,
    #[error("flash log is full")]
    Full,
    #[error("update outside the entry bounds")]
    OutOfBounds,
    #[error("programming may only clear flash bits")]
    ProgramPolicy,
}

/// Append-only keyed flash log.
///
/// Entries are iterated in storage order by [`get_next`](FlashLog::get_next);
/// the cursor starts at zero and the iteration must keep reporting `None`
/// once exhausted. While a format upgrade is pending (the mounted version is
/// older than [`FORMAT_VERSION`]), reads serve the legacy area and writes go
/// to the live area until [`upgrade_finish`](FlashLog::upgrade_finish)
/// commits the migration.
pub trait FlashLog {
    /// Mount the log and report the on-flash format version.
    fn mount(&mut self) -> Result<u32, FlashError>;

    /// Borrow the live entry stored under `key`.
    fn get(&self, key: u16) -> Option<&[u8]>;

    /// Create or replace the entry stored under `key`.
    fn set(&mut self, key: u16, val: &[u8]) -> Result<(), FlashError>;

    /// Allocate an erased entry of `len` bytes under `key`, reporting whether
    /// the key already existed.
    fn reserve(&mut self, key: u16, len: usize) -> Result<bool, FlashError>;

    /// Remove the entry stored under `key`.
    fn delete(&mut self, key: u16) -> Result<(), FlashError>;

    /// Advance `cursor` to the next live entry.
    fn get_next(&self, cursor: &mut usize) -> Option<(u16, &[u8])>;

    /// Program one 32-bit word at a word-aligned byte offset inside the
    /// entry. Bits may only clear.
    fn update_word(&mut self, key: u16, offset: usize, word: u32) -> Result<(), FlashError>;

    /// Program bytes starting at `offset` inside a reserved entry.
    fn update_bytes(&mut self, key: u16, offset: usize, data: &[u8]) -> Result<(), FlashError>;

    /// Erase every entry.
    fn wipe(&mut self) -> Result<(), FlashError>;

    /// Commit a pending format upgrade.
    fn upgrade_finish(&mut self) -> Result<(), FlashError>;
}
