//! Whole-storage authentication over the set of protected keys.
//!
//! The flash entry under `STORAGE_TAG_KEY` holds
//! `HMAC-SAK(⊕ HMAC-SAK(key))` over every protected key present in flash,
//! truncated to 16 bytes. Creating or deleting a protected entry XORs the
//! per-key HMAC into a cached running sum and rewrites the tag; reading
//! recomputes the sum from scratch in a single scan and verifies the stored
//! tag before any value is handed out, so a replayed, dropped or reordered
//! entry is caught even though values authenticate individually.

use alloc::vec::Vec;

use hmac::{Hmac, Mac};
use rand_core::{CryptoRng, RngCore};
use sha2::Sha256;

use crate::error::StorageError;
use crate::flash::FlashLog;
use crate::storage::{is_protected, Storage, DEK_SIZE, STORAGE_TAG_KEY, STORAGE_TAG_SIZE};

fn hmac_sak(sak: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256>>::new_from_slice(sak).expect("HMAC accepts any key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

impl<F, R> Storage<F, R>
where
    F: FlashLog,
    R: RngCore + CryptoRng,
{
    /// Zero the running sum and store the tag over the empty key set.
    pub(crate) fn auth_init(&mut self) -> Result<(), StorageError> {
        self.authentication_sum.fill(0);
        let tag = hmac_sak(&self.cached_keys[DEK_SIZE..], self.authentication_sum.as_ref());
        self.flash
            .set(STORAGE_TAG_KEY, &tag[..STORAGE_TAG_SIZE])?;
        Ok(())
    }

    /// Fold `key` into the running sum and rewrite the stored tag.
    /// Public and storage-internal keys are not part of the tag.
    pub(crate) fn auth_update(&mut self, key: u16) -> Result<(), StorageError> {
        if !is_protected(key) {
            return Ok(());
        }
        let mac = hmac_sak(&self.cached_keys[DEK_SIZE..], &key.to_le_bytes());
        for (sum, byte) in self.authentication_sum.iter_mut().zip(mac.iter()) {
            *sum ^= byte;
        }
        let tag = hmac_sak(&self.cached_keys[DEK_SIZE..], self.authentication_sum.as_ref());
        self.flash
            .set(STORAGE_TAG_KEY, &tag[..STORAGE_TAG_SIZE])?;
        Ok(())
    }

    /// Preallocate an entry and keep the tag consistent: the tag is over the
    /// key set, so it moves only when the key is newly created, and a failed
    /// tag write rolls the entry back.
    pub(crate) fn auth_reserve(&mut self, key: u16, len: usize) -> Result<(), StorageError> {
        let found = self.flash.reserve(key, len)?;
        if !found {
            if let Err(e) = self.auth_update(key) {
                let _ = self.flash.delete(key);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Scan every flash entry, recompute the running sum over the protected
    /// keys, verify the stored tag, and return a copy of the requested
    /// entry's value if it exists.
    ///
    /// The scan cross-checks itself against fault injection: the iteration
    /// must not restart after reporting exhaustion, and the per-entry counts
    /// must agree with whether the requested key was seen.
    pub(crate) fn auth_get(&mut self, key: u16) -> Result<Option<Vec<u8>>, StorageError> {
        let mut sum = [0u8; 32];
        let mut requested: Option<Vec<u8>> = None;
        let mut stored_tag: Option<Vec<u8>> = None;
        let mut entry_count: u32 = 0;
        let mut other_count: u32 = 0;

        let mut cursor = 0usize;
        loop {
            let Some((k, v)) = self.flash.get_next(&mut cursor) else {
                break;
            };
            entry_count += 1;
            if k == key {
                requested = Some(v.to_vec());
            } else {
                other_count += 1;
            }
            if !is_protected(k) {
                if k == STORAGE_TAG_KEY {
                    stored_tag = Some(v.to_vec());
                }
                continue;
            }
            let mac = hmac_sak(&self.cached_keys[DEK_SIZE..], &k.to_le_bytes());
            for (s, byte) in sum.iter_mut().zip(mac.iter()) {
                *s ^= byte;
            }
        }
        if self.flash.get_next(&mut cursor).is_some() {
            return self.fault();
        }

        let tag = hmac_sak(&self.cached_keys[DEK_SIZE..], &sum);
        self.authentication_sum.copy_from_slice(&sum);

        match stored_tag {
            Some(stored) if stored.len() == STORAGE_TAG_SIZE => {
                if !self.ct_eq(&tag[..STORAGE_TAG_SIZE], &stored)? {
                    return self.fault();
                }
            }
            _ => return self.fault(),
        }

        if requested.is_none() && other_count != entry_count {
            return self.fault();
        }
        Ok(requested)
    }
}

#[cfg(test)]
mod tests {
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    use crate::flash::FlashLog;
    use crate::mock_flash::MockFlash;
    use crate::storage::Storage;
    use crate::StorageError;

    fn unlocked() -> Storage<MockFlash, ChaCha20Rng> {
        let mut storage = Storage::new(MockFlash::new(), ChaCha20Rng::from_seed([3; 32]));
        storage.init(None, b"auth-tests").unwrap();
        storage.unlock(1).unwrap();
        storage
    }

    #[test]
    fn tag_follows_the_protected_key_set() {
        let mut storage = unlocked();
        storage.set(0x0101, b"a").unwrap();
        storage.set(0x0102, b"b").unwrap();
        let with_two = storage.flash.get(0x0005).unwrap().to_vec();

        // Overwriting does not move the tag; the key set is unchanged.
        storage.set(0x0101, b"aa").unwrap();
        assert_eq!(storage.flash.get(0x0005).unwrap(), with_two.as_slice());

        // Deleting XORs the key back out.
        storage.delete(0x0102).unwrap();
        storage.set(0x0102, b"b2").unwrap();
        assert_eq!(storage.flash.get(0x0005).unwrap(), with_two.as_slice());
    }

    #[test]
    fn public_entries_stay_outside_the_tag() {
        let mut storage = unlocked();
        let initial = storage.flash.get(0x0005).unwrap().to_vec();
        storage.set(0x8101, b"public").unwrap();
        assert_eq!(storage.flash.get(0x0005).unwrap(), initial.as_slice());
    }

    #[test]
    fn scan_detects_a_missing_protected_entry() {
        let mut storage = unlocked();
        storage.set(0x0101, b"a").unwrap();
        storage.flash.delete(0x0101).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(storage.get(0x0101, &mut buf), Err(StorageError::Fault));
    }
}
