//! Fault response and glitch-hardening helpers.
//!
//! Any internal consistency failure (a tag mismatch outside the unlock
//! path, a malformed PIN log, a loop that did not run to completion) is
//! treated as an attempted fault injection and routed through
//! [`Storage::fault`]. Sensitive comparisons and branches go through
//! [`ct_eq`](Storage::ct_eq) and [`wait_random`](Storage::wait_random) so
//! neither timing nor a single skipped instruction decides an outcome.

use core::hint::black_box;

use rand_core::{CryptoRng, RngCore};

use crate::error::StorageError;
use crate::flash::FlashLog;
use crate::storage::Storage;

impl<F, R> Storage<F, R>
where
    F: FlashLog,
    R: RngCore + CryptoRng,
{
    /// Central fault response.
    ///
    /// The first detected fault burns one PIN attempt, verifies the burn
    /// landed on flash, and poisons the context so every further call fails.
    /// A fault raised while one is already being handled means the handler
    /// itself is under attack: the storage is wiped outright.
    pub(crate) fn fault<T>(&mut self) -> Result<T, StorageError> {
        if self.fault_in_progress {
            let _ = self.wipe_and_reinit();
            self.halted = true;
            return Err(StorageError::Fault);
        }
        self.fault_in_progress = true;

        let before = match self.pin_get_fails() {
            Ok(ctr) => ctr,
            Err(_) => {
                let _ = self.wipe_and_reinit();
                self.halted = true;
                return Err(StorageError::Fault);
            }
        };
        if self.pin_fails_increase().is_err() {
            let _ = self.wipe_and_reinit();
            self.halted = true;
            return Err(StorageError::Fault);
        }
        match self.pin_get_fails() {
            Ok(after) if after == before + 1 => {}
            _ => {
                let _ = self.wipe_and_reinit();
            }
        }
        self.halted = true;
        Err(StorageError::Fault)
    }

    /// Constant-time slice equality with a completion check on its own loop.
    pub(crate) fn ct_eq(&mut self, a: &[u8], b: &[u8]) -> Result<bool, StorageError> {
        if a.len() != b.len() {
            return self.fault();
        }
        let mut diff = 0u8;
        let mut count = 0usize;
        for (x, y) in a.iter().zip(b.iter()) {
            diff |= x ^ y;
            count += 1;
        }
        if black_box(count) != a.len() {
            return self.fault();
        }
        Ok(black_box(diff) == 0)
    }

    /// Delay for a random number of iterations to desynchronize glitch
    /// timing, double-checking the loop bookkeeping on the way.
    pub(crate) fn wait_random(&mut self) -> Result<(), StorageError> {
        let wait = (self.rng.next_u32() & 0xff) as i32;
        let mut up = black_box(0i32);
        let mut down = black_box(wait);
        while black_box(up) < wait {
            if black_box(up + down) != wait {
                return self.fault();
            }
            up += 1;
            down -= 1;
        }
        if black_box(up) != wait {
            return self.fault();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    use crate::mock_flash::MockFlash;
    use crate::storage::Storage;

    fn context() -> Storage<MockFlash, ChaCha20Rng> {
        let mut storage = Storage::new(MockFlash::new(), ChaCha20Rng::from_seed([9; 32]));
        storage.init(None, b"fault-tests").unwrap();
        storage
    }

    #[test]
    fn ct_eq_compares_full_slices() {
        let mut storage = context();
        assert!(storage.ct_eq(b"same bytes", b"same bytes").unwrap());
        assert!(!storage.ct_eq(b"same bytes", b"same bytez").unwrap());
        assert!(!storage.ct_eq(b"\x00aa", b"\x01aa").unwrap());
    }

    #[test]
    fn wait_random_terminates() {
        let mut storage = context();
        for _ in 0..32 {
            storage.wait_random().unwrap();
        }
    }

    #[test]
    fn fault_burns_an_attempt_and_poisons() {
        let mut storage = context();
        assert_eq!(storage.get_pin_rem(), 16);
        let err = storage.fault::<()>().unwrap_err();
        assert_eq!(err, crate::StorageError::Fault);
        // Poisoned: every call short-circuits, including the counter read.
        assert_eq!(storage.get_pin_rem(), 0);
        assert_eq!(storage.unlock(1), Err(crate::StorageError::Fault));

        // The burned attempt survives the "reboot".
        let flash = storage.into_flash();
        let mut storage = Storage::new(flash, ChaCha20Rng::from_seed([10; 32]));
        storage.init(None, b"fault-tests").unwrap();
        assert_eq!(storage.get_pin_rem(), 15);
    }
}
