//! Brute-force PIN counter stored as bit-drained flash words.
//!
//! The log is one guard word followed by a success log and an entry log of
//! 16 words each. A per-log random guard word spreads a checkable fingerprint
//! across half the bit positions of every word; the other half are data
//! bits, drained one pair per failed attempt by in-place programming (NOR
//! bits only clear), so counting an attempt never rewrites the entry. A
//! successful unlock acknowledges consumed attempts by copying entry words
//! into the success log. Any word whose guard bits do not match, or whose
//! data bits are not a single 0…01…1 run, counts as a fault.

use core::hint::black_box;

use rand_core::{CryptoRng, RngCore};

use crate::error::StorageError;
use crate::flash::FlashLog;
use crate::storage::{Storage, PIN_LOGS_KEY, PIN_MAX_TRIES};

const LOW_MASK: u32 = 0x5555_5555;
const GUARD_KEY_MODULUS: u32 = 6311;
const GUARD_KEY_REMAINDER: u32 = 15;
const GUARD_KEY_WORDS: usize = 1;
const PIN_LOG_WORDS: usize = 16;
const LOG_WORDS: usize = GUARD_KEY_WORDS + 2 * PIN_LOG_WORDS;
const LOG_BYTES: usize = 4 * LOG_WORDS;

/// A guard word must leave the right residue, carry exactly two set bits in
/// each byte of its odd positions, and avoid runs of five equal bits.
fn check_guard_key(guard_key: u32) -> bool {
    if guard_key % GUARD_KEY_MODULUS != GUARD_KEY_REMAINDER {
        return false;
    }

    let mut count = (guard_key & 0x2222_2222) + ((guard_key >> 2) & 0x2222_2222);
    count += count >> 4;
    if count & 0x0e0e_0e0e != 0x0404_0404 {
        return false;
    }

    let mut zero_runs = !guard_key;
    zero_runs &= zero_runs >> 2;
    zero_runs &= zero_runs >> 1;
    zero_runs &= zero_runs >> 1;

    let mut one_runs = guard_key;
    one_runs &= one_runs >> 2;
    one_runs &= one_runs >> 1;
    one_runs &= one_runs >> 1;

    one_runs == 0 && zero_runs == 0
}

impl<F, R> Storage<F, R>
where
    F: FlashLog,
    R: RngCore + CryptoRng,
{
    fn random_uniform(&mut self, n: u32) -> u32 {
        let limit = u32::MAX - u32::MAX % n;
        loop {
            let r = self.rng.next_u32();
            if r < limit {
                return r % n;
            }
        }
    }

    fn generate_guard_key(&mut self) -> u32 {
        loop {
            let candidate = self.random_uniform(u32::MAX / GUARD_KEY_MODULUS + 1)
                * GUARD_KEY_MODULUS
                + GUARD_KEY_REMAINDER;
            if check_guard_key(candidate) {
                return candidate;
            }
        }
    }

    /// Derive the positions that must match the guard pattern and the
    /// pattern itself. A guard word that fails its own integrity check is a
    /// fault, not a benign error.
    fn expand_guard_key(&mut self, guard_key: u32) -> Result<(u32, u32), StorageError> {
        if !check_guard_key(guard_key) {
            return self.fault();
        }
        let guard_mask = ((guard_key & LOW_MASK) << 1) | (!guard_key & LOW_MASK);
        let guard = (((guard_key & LOW_MASK) << 1) & guard_key)
            | ((!guard_key & LOW_MASK) & (guard_key >> 1));
        Ok((guard_mask, guard))
    }

    fn pin_log_words(&self) -> Option<[u32; LOG_WORDS]> {
        let raw = self.flash.get(PIN_LOGS_KEY)?;
        if raw.len() != LOG_BYTES {
            return None;
        }
        let mut words = [0u32; LOG_WORDS];
        for (word, chunk) in words.iter_mut().zip(raw.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(words)
    }

    /// Write a fresh log under a new guard word, with `fails` attempts
    /// already consumed in the first entry word.
    pub(crate) fn pin_logs_init(&mut self, fails: u32) -> Result<(), StorageError> {
        debug_assert!(fails < PIN_MAX_TRIES);
        let mut logs = [0u32; LOG_WORDS];
        logs[0] = self.generate_guard_key();

        self.wait_random()?;
        let (guard_mask, guard) = self.expand_guard_key(logs[0])?;
        let unused = guard | !guard_mask;
        for word in logs[GUARD_KEY_WORDS..].iter_mut() {
            *word = unused;
        }
        logs[GUARD_KEY_WORDS + PIN_LOG_WORDS] = ((u32::MAX >> (2 * fails)) & !guard_mask) | guard;

        let mut bytes = [0u8; LOG_BYTES];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(logs.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.flash.set(PIN_LOGS_KEY, &bytes)?;
        Ok(())
    }

    /// Acknowledge consumed attempts by mirroring the entry log into the
    /// success log; a fully exhausted log is reinitialized from scratch.
    pub(crate) fn pin_fails_reset(&mut self) -> Result<(), StorageError> {
        let words = match self.pin_log_words() {
            Some(words) => words,
            None => return Err(StorageError::Corrupted),
        };

        self.wait_random()?;
        let (guard_mask, guard) = self.expand_guard_key(words[0])?;
        let unused = guard | !guard_mask;

        for i in 0..PIN_LOG_WORDS {
            let success = words[GUARD_KEY_WORDS + i];
            let entry = words[GUARD_KEY_WORDS + PIN_LOG_WORDS + i];
            if entry == unused {
                return Ok(());
            }
            if success != guard {
                self.flash
                    .update_word(PIN_LOGS_KEY, 4 * (i + GUARD_KEY_WORDS), entry)?;
            }
        }
        self.pin_logs_init(0)
    }

    /// Drain one more data-bit pair of the current entry word.
    pub(crate) fn pin_fails_increase(&mut self) -> Result<(), StorageError> {
        self.wait_random()?;
        let words = match self.pin_log_words() {
            Some(words) => words,
            None => return self.fault(),
        };

        self.wait_random()?;
        let (guard_mask, guard) = self.expand_guard_key(words[0])?;

        for i in 0..PIN_LOG_WORDS {
            self.wait_random()?;
            let entry = words[GUARD_KEY_WORDS + PIN_LOG_WORDS + i];
            if entry & guard_mask != guard {
                return self.fault();
            }
            if entry != guard {
                self.wait_random()?;
                let mut word = entry & !guard_mask;
                word = ((word >> 1) | word) & LOW_MASK;
                word = (word >> 2) | (word >> 1);

                self.wait_random()?;
                if self
                    .flash
                    .update_word(
                        PIN_LOGS_KEY,
                        4 * (i + GUARD_KEY_WORDS + PIN_LOG_WORDS),
                        (word & !guard_mask) | guard,
                    )
                    .is_err()
                {
                    return self.fault();
                }
                return Ok(());
            }
        }
        self.fault()
    }

    /// Validate the whole log and return the number of consumed attempts.
    pub(crate) fn pin_get_fails(&mut self) -> Result<u32, StorageError> {
        self.wait_random()?;
        let words = match self.pin_log_words() {
            Some(words) => words,
            None => return self.fault(),
        };

        self.wait_random()?;
        let (guard_mask, guard) = self.expand_guard_key(words[0])?;
        let unused = guard | !guard_mask;

        let success = &words[GUARD_KEY_WORDS..GUARD_KEY_WORDS + PIN_LOG_WORDS];
        let entry = &words[GUARD_KEY_WORDS + PIN_LOG_WORDS..];
        let mut current: Option<usize> = None;
        let mut visited = 0usize;
        for i in 0..PIN_LOG_WORDS {
            if entry[i] & guard_mask != guard
                || success[i] & guard_mask != guard
                || entry[i] & success[i] != entry[i]
            {
                return self.fault();
            }

            match current {
                None => {
                    if entry[i] != guard {
                        current = Some(i);
                    }
                }
                // Words past the current one must still be untouched.
                Some(_) => {
                    if entry[i] != unused {
                        return self.fault();
                    }
                }
            }
            visited += 1;
        }

        let Some(mut current) = current else {
            return self.fault();
        };
        if current >= PIN_LOG_WORDS || black_box(visited) != PIN_LOG_WORDS {
            return self.fault();
        }

        // Strip the guard bits and duplicate each data bit; the result must
        // have the form 0*1*.
        self.wait_random()?;
        let mut word = entry[current] & !guard_mask;
        word = ((word >> 1) | word) & LOW_MASK;
        word |= word << 1;
        if word & word.wrapping_add(1) != 0 {
            return self.fault();
        }

        if current == 0 {
            current = 1;
        }

        self.wait_random()?;
        Ok((success[current - 1] ^ entry[current - 1]).count_ones()
            + (success[current] ^ entry[current]).count_ones())
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    use super::*;
    use crate::mock_flash::MockFlash;
    use crate::StorageError;

    fn context() -> Storage<MockFlash, ChaCha20Rng> {
        let mut storage = Storage::new(MockFlash::new(), ChaCha20Rng::from_seed([5; 32]));
        storage.init(None, b"pin-log-tests").unwrap();
        storage
    }

    #[test]
    fn generated_guard_keys_pass_their_own_check() {
        let mut storage = context();
        for _ in 0..8 {
            let guard_key = storage.generate_guard_key();
            assert!(check_guard_key(guard_key));
            assert_eq!(guard_key % GUARD_KEY_MODULUS, GUARD_KEY_REMAINDER);
            // Any single-bit glitch breaks at least one of the conditions.
            assert!(!check_guard_key(guard_key ^ 1));
        }
    }

    #[test]
    fn guard_expansion_covers_one_bit_per_pair() {
        let mut storage = context();
        let guard_key = storage.generate_guard_key();
        let (guard_mask, guard) = storage.expand_guard_key(guard_key).unwrap();
        assert_eq!(guard_mask.count_ones(), 16);
        // Exactly one bit of every 2-bit pair belongs to the mask.
        assert_eq!((guard_mask ^ (guard_mask >> 1)) & LOW_MASK, LOW_MASK);
        // The guard pattern lives entirely inside the mask.
        assert_eq!(guard & !guard_mask, 0);
    }

    #[test]
    fn counter_counts_up_and_resets() {
        let mut storage = context();
        storage.pin_logs_init(0).unwrap();
        assert_eq!(storage.pin_get_fails().unwrap(), 0);
        for expected in 1..=3 {
            storage.pin_fails_increase().unwrap();
            assert_eq!(storage.pin_get_fails().unwrap(), expected);
        }
        storage.pin_fails_reset().unwrap();
        assert_eq!(storage.pin_get_fails().unwrap(), 0);
    }

    #[test]
    fn init_preconsumes_attempts() {
        let mut storage = context();
        storage.pin_logs_init(5).unwrap();
        assert_eq!(storage.pin_get_fails().unwrap(), 5);
    }

    #[test]
    fn full_word_drain_is_still_readable() {
        let mut storage = context();
        storage.pin_logs_init(0).unwrap();
        for _ in 0..16 {
            storage.pin_fails_increase().unwrap();
        }
        assert_eq!(storage.pin_get_fails().unwrap(), 16);
        storage.pin_fails_reset().unwrap();
        assert_eq!(storage.pin_get_fails().unwrap(), 0);
    }

    #[test]
    fn malformed_log_is_a_fault() {
        let mut storage = context();
        storage.flash.set(PIN_LOGS_KEY, &[0u8; 16]).unwrap();
        assert_eq!(storage.pin_get_fails(), Err(StorageError::Fault));
        assert_eq!(storage.get_pin_rem(), 0);
    }
}
