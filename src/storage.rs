//! The storage context: lifecycle, PIN handling, value envelope, upgrade.

use alloc::boxed::Box;
use alloc::vec::Vec;

use rand_core::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::aead::{ChaChaPoly, BLOCK_SIZE, IV_SIZE, TAG_SIZE};
use crate::error::StorageError;
use crate::flash::{FlashLog, FORMAT_VERSION};
use crate::kdf;

/// The APP namespace reserved for storage-internal entries.
pub(crate) const APP_STORAGE: u8 = 0x00;
/// Namespace bit marking an entry as public: plaintext, readable while
/// locked, excluded from the storage authentication tag.
pub(crate) const FLAG_PUBLIC: u8 = 0x80;

/// Guard word, PIN success log and PIN entry log.
pub(crate) const PIN_LOGS_KEY: u16 = 0x0001;
/// Random salt, encrypted DEK and SAK, and the PIN verification code.
pub(crate) const EDEK_PVC_KEY: u16 = 0x0002;
/// One byte: 0x01 iff the stored PIN is the empty-PIN sentinel.
pub(crate) const PIN_NOT_SET_KEY: u16 = 0x0003;
/// Storage format version, stored encrypted.
pub(crate) const VERSION_KEY: u16 = 0x0004;
/// Authentication tag over the set of protected keys.
pub(crate) const STORAGE_TAG_KEY: u16 = 0x0005;

// Pre-upgrade layout: plaintext PIN word and bit-cleared fail counter.
const V0_PIN_KEY: u16 = 0x0000;
const V0_PIN_FAIL_KEY: u16 = 0x0001;

/// The PIN value standing in for "no PIN set". Callers must encode user
/// PINs so this value is unreachable.
pub const PIN_EMPTY: u32 = 1;

/// Failed unlock attempts tolerated before the storage wipes itself.
// The counter encoding relies on this fitting into a single log word.
pub const PIN_MAX_TRIES: u32 = 16;

pub(crate) const HARDWARE_SALT_SIZE: usize = 32;
pub(crate) const RANDOM_SALT_SIZE: usize = 4;
pub(crate) const DEK_SIZE: usize = 32;
pub(crate) const SAK_SIZE: usize = 16;
pub(crate) const KEYS_SIZE: usize = DEK_SIZE + SAK_SIZE;
pub(crate) const PVC_SIZE: usize = 8;
pub(crate) const STORAGE_TAG_SIZE: usize = 16;
const EDEK_PVC_SIZE: usize = RANDOM_SALT_SIZE + KEYS_SIZE + PVC_SIZE;

const TRUE_BYTE: u8 = 0x01;
const FALSE_BYTE: u8 = 0x00;

/// Progress callback pumped while the PIN backoff delay runs:
/// `(seconds_remaining, progress_permille)`.
pub type UiCallback = Box<dyn FnMut(u32, u32)>;

/// Millisecond delay hook backed by the platform timer.
pub type DelayFn = Box<dyn FnMut(u32)>;

pub(crate) fn is_protected(key: u16) -> bool {
    let app = (key >> 8) as u8;
    app & FLAG_PUBLIC == 0 && app != APP_STORAGE
}

/// PIN-protected key-value storage over an append-only flash log.
///
/// The context owns the flash driver and the RNG, and carries every piece of
/// transient state: the hashed hardware salt, the cached DEK and SAK (only
/// nonzero while unlocked), the running authentication sum, and the
/// lifecycle flags. Dropping the context zeroizes the cached key material.
pub struct Storage<F, R>
where
    F: FlashLog,
    R: RngCore + CryptoRng,
{
    pub(crate) flash: F,
    pub(crate) rng: R,
    ui_callback: Option<UiCallback>,
    delay_ms: Option<DelayFn>,
    pub(crate) hardware_salt: [u8; HARDWARE_SALT_SIZE],
    pub(crate) cached_keys: Zeroizing<[u8; KEYS_SIZE]>,
    pub(crate) authentication_sum: Zeroizing<[u8; 32]>,
    pub(crate) active_version: u32,
    pub(crate) initialized: bool,
    pub(crate) unlocked: bool,
    pub(crate) fault_in_progress: bool,
    pub(crate) halted: bool,
}

impl<F, R> Storage<F, R>
where
    F: FlashLog,
    R: RngCore + CryptoRng,
{
    /// Create an uninitialized context over the given flash and RNG.
    pub fn new(flash: F, rng: R) -> Self {
        Self {
            flash,
            rng,
            ui_callback: None,
            delay_ms: None,
            hardware_salt: [0u8; HARDWARE_SALT_SIZE],
            cached_keys: Zeroizing::new([0u8; KEYS_SIZE]),
            authentication_sum: Zeroizing::new([0u8; 32]),
            active_version: 0,
            initialized: false,
            unlocked: false,
            fault_in_progress: false,
            halted: false,
        }
    }

    /// Install the platform delay used by the PIN backoff. Without one the
    /// backoff still pumps the progress callback but does not block.
    pub fn with_delay(mut self, delay: DelayFn) -> Self {
        self.delay_ms = Some(delay);
        self
    }

    /// Release the flash driver, e.g. to model a power cycle in tests.
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Mount the flash, run a pending format upgrade, and provision freshly
    /// wiped storage with random keys and the empty PIN.
    ///
    /// Reinitializing clears a fault poisoning the way a reboot would.
    pub fn init(
        &mut self,
        ui: Option<UiCallback>,
        hardware_secret: &[u8],
    ) -> Result<(), StorageError> {
        self.initialized = false;
        self.unlocked = false;
        self.halted = false;
        self.fault_in_progress = false;
        self.active_version = self.flash.mount()?;
        self.initialized = true;
        self.ui_callback = ui;
        self.hardware_salt = Sha256::digest(hardware_secret).into();

        if self.active_version < FORMAT_VERSION {
            if let Err(e) = self.upgrade() {
                if !matches!(e, StorageError::Fault) {
                    let _ = self.wipe_and_reinit();
                    self.halted = true;
                }
                return Err(StorageError::Fault);
            }
        }

        // No key envelope means freshly wiped flash.
        if self.flash.get(EDEK_PVC_KEY).is_none() {
            self.init_wiped_storage()?;
        }
        self.cached_keys.zeroize();
        Ok(())
    }

    /// Verify the PIN and cache the decrypted DEK and SAK.
    ///
    /// The attempt is charged to the retry counter before the PIN is looked
    /// at and refunded on success. Running out of budget wipes the storage
    /// and returns [`StorageError::Wiped`]; each wait between attempts grows
    /// exponentially and is reported through the UI callback.
    pub fn unlock(&mut self, pin: u32) -> Result<(), StorageError> {
        if self.halted {
            return Err(StorageError::Fault);
        }
        let mut pin = pin;
        let ctr = match self.pin_get_fails() {
            Ok(ctr) => ctr,
            Err(e) => {
                pin.zeroize();
                return Err(e);
            }
        };
        if let Err(e) = self.wait_random() {
            pin.zeroize();
            return Err(e);
        }
        if ctr >= PIN_MAX_TRIES {
            pin.zeroize();
            self.wipe_and_reinit()?;
            return Err(StorageError::Wiped);
        }

        // Sleep 2^(ctr-1) seconds, pumping the progress callback at 10 Hz.
        let wait = (1u32 << ctr) >> 1;
        for rem in (1..=wait).rev() {
            for tick in 0..10u32 {
                if let Some(cb) = self.ui_callback.as_mut() {
                    let progress = if wait > 1_000_000 {
                        (wait - rem) / (wait / 1000)
                    } else {
                        ((wait - rem) * 10 + tick) * 100 / wait
                    };
                    cb(rem, progress);
                }
                if let Some(delay) = self.delay_ms.as_mut() {
                    delay(100);
                }
            }
        }
        if wait > 0 {
            if let Some(cb) = self.ui_callback.as_mut() {
                cb(0, 1000);
            }
        }

        // Charge the attempt before touching the PIN, and make sure the
        // charge actually landed on flash.
        if let Err(e) = self.pin_fails_increase() {
            pin.zeroize();
            return Err(e);
        }
        let ctr_ck = match self.pin_get_fails() {
            Ok(ctr_ck) => ctr_ck,
            Err(e) => {
                pin.zeroize();
                return Err(e);
            }
        };
        if ctr + 1 != ctr_ck {
            pin.zeroize();
            return self.fault();
        }

        if let Err(e) = self.unlock_inner(pin) {
            pin.zeroize();
            if matches!(e, StorageError::Fault) {
                return Err(e);
            }
            self.wait_random()?;
            if ctr + 1 >= PIN_MAX_TRIES {
                self.wipe_and_reinit()?;
                return Err(StorageError::Wiped);
            }
            return Err(e);
        }
        pin.zeroize();
        self.unlocked = true;
        self.pin_fails_reset()
    }

    /// Drop the cached keys and lock the storage.
    pub fn lock(&mut self) {
        self.unlocked = false;
        self.cached_keys.zeroize();
        self.authentication_sum.zeroize();
    }

    /// Whether a non-empty PIN is set.
    pub fn has_pin(&self) -> Result<bool, StorageError> {
        if self.halted {
            return Err(StorageError::Fault);
        }
        if !self.initialized {
            return Err(StorageError::Uninitialized);
        }
        Ok(match self.flash.get(PIN_NOT_SET_KEY) {
            None => false,
            Some(v) => v.first().map_or(true, |b| *b == FALSE_BYTE),
        })
    }

    /// Remaining unlock attempts; 0 when the counter cannot be read.
    pub fn get_pin_rem(&mut self) -> u32 {
        if self.halted {
            return 0;
        }
        match self.pin_get_fails() {
            Ok(ctr) => PIN_MAX_TRIES.saturating_sub(ctr),
            Err(_) => 0,
        }
    }

    /// Re-verify the old PIN through the throttled unlock path, then wrap
    /// the cached keys under the new one.
    pub fn change_pin(&mut self, old: u32, new: u32) -> Result<(), StorageError> {
        if self.halted {
            return Err(StorageError::Fault);
        }
        let mut old = old;
        let mut new = new;
        if !self.initialized || !self.unlocked {
            old.zeroize();
            new.zeroize();
            return Err(if self.initialized {
                StorageError::Locked
            } else {
                StorageError::Uninitialized
            });
        }
        if let Err(e) = self.unlock(old) {
            old.zeroize();
            new.zeroize();
            return Err(e);
        }
        let ret = self.set_pin(new);
        old.zeroize();
        new.zeroize();
        ret
    }

    /// Read the value stored under `key` into `dest` and return its length.
    ///
    /// Public keys are readable while locked; protected keys are decrypted
    /// and authenticated and require an unlocked storage.
    pub fn get(&mut self, key: u16, dest: &mut [u8]) -> Result<usize, StorageError> {
        self.guard_ready()?;
        let app = (key >> 8) as u8;
        if app == APP_STORAGE {
            return Err(StorageError::ReservedKey);
        }
        if app & FLAG_PUBLIC != 0 {
            let val = self.flash.get(key).ok_or(StorageError::NotFound)?;
            if val.len() > dest.len() {
                return Err(StorageError::BufferTooSmall);
            }
            let len = val.len();
            dest[..len].copy_from_slice(val);
            Ok(len)
        } else {
            if !self.unlocked {
                return Err(StorageError::Locked);
            }
            self.get_encrypted(key, dest)
        }
    }

    /// Length of the value stored under `key`, without reading it.
    pub fn value_len(&mut self, key: u16) -> Result<usize, StorageError> {
        self.guard_ready()?;
        let app = (key >> 8) as u8;
        if app == APP_STORAGE {
            return Err(StorageError::ReservedKey);
        }
        if app & FLAG_PUBLIC != 0 {
            return self
                .flash
                .get(key)
                .map(|v| v.len())
                .ok_or(StorageError::NotFound);
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        let stored = self.auth_get(key)?.ok_or(StorageError::NotFound)?;
        if stored.len() < IV_SIZE + TAG_SIZE {
            return self.fault();
        }
        Ok(stored.len() - IV_SIZE - TAG_SIZE)
    }

    /// Store `val` under `key`. Requires an unlocked storage; protected keys
    /// go through the encryption envelope.
    pub fn set(&mut self, key: u16, val: &[u8]) -> Result<(), StorageError> {
        self.guard_ready()?;
        let app = (key >> 8) as u8;
        if app == APP_STORAGE {
            return Err(StorageError::ReservedKey);
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        if app & FLAG_PUBLIC != 0 {
            self.flash.set(key, val)?;
            Ok(())
        } else {
            self.set_encrypted(key, val)
        }
    }

    /// Remove the entry stored under `key`.
    pub fn delete(&mut self, key: u16) -> Result<(), StorageError> {
        self.guard_ready()?;
        let app = (key >> 8) as u8;
        if app == APP_STORAGE {
            return Err(StorageError::ReservedKey);
        }
        if !self.unlocked {
            return Err(StorageError::Locked);
        }
        self.flash.delete(key)?;
        self.auth_update(key)
    }

    /// Erase the flash and reprovision factory state: fresh random DEK and
    /// SAK, empty PIN, zeroed retry counter.
    pub fn wipe(&mut self) -> Result<(), StorageError> {
        if self.halted {
            return Err(StorageError::Fault);
        }
        self.wipe_and_reinit()
    }

    fn guard_ready(&self) -> Result<(), StorageError> {
        if self.halted {
            return Err(StorageError::Fault);
        }
        if !self.initialized {
            return Err(StorageError::Uninitialized);
        }
        Ok(())
    }

    pub(crate) fn dek(&self) -> &[u8; DEK_SIZE] {
        self.cached_keys[..DEK_SIZE]
            .try_into()
            .expect("32-byte DEK half")
    }

    pub(crate) fn wipe_and_reinit(&mut self) -> Result<(), StorageError> {
        self.flash.wipe()?;
        self.active_version = FORMAT_VERSION;
        self.authentication_sum.zeroize();
        self.cached_keys.zeroize();
        self.init_wiped_storage()
    }

    fn init_wiped_storage(&mut self) -> Result<(), StorageError> {
        self.rng.fill_bytes(self.cached_keys.as_mut());
        self.auth_init()?;
        self.set_encrypted(VERSION_KEY, &FORMAT_VERSION.to_le_bytes())?;
        self.set_pin(PIN_EMPTY)?;
        self.pin_logs_init(0)?;
        if !self.unlocked {
            self.cached_keys.zeroize();
        }
        Ok(())
    }

    /// Wrap the cached keys under a key derived from `pin` and persist the
    /// envelope together with the truncated verification code.
    fn set_pin(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut pin = pin;
        let mut salt = [0u8; RANDOM_SALT_SIZE];
        self.rng.fill_bytes(&mut salt);
        let (kek, keiv) = kdf::derive_kek(pin, &self.hardware_salt, &salt);
        let mut iv = Zeroizing::new([0u8; IV_SIZE]);
        iv.copy_from_slice(&keiv[..IV_SIZE]);
        let mut ctx = ChaChaPoly::new(&kek, &iv);
        drop(kek);
        drop(keiv);

        let mut buffer = Zeroizing::new([0u8; EDEK_PVC_SIZE]);
        buffer[..RANDOM_SALT_SIZE].copy_from_slice(&salt);
        buffer[RANDOM_SALT_SIZE..RANDOM_SALT_SIZE + KEYS_SIZE]
            .copy_from_slice(self.cached_keys.as_ref());
        ctx.encrypt(&mut buffer[RANDOM_SALT_SIZE..RANDOM_SALT_SIZE + KEYS_SIZE]);
        let tag = Zeroizing::new(ctx.tag());
        buffer[RANDOM_SALT_SIZE + KEYS_SIZE..].copy_from_slice(&tag[..PVC_SIZE]);

        let mut result = self
            .flash
            .set(EDEK_PVC_KEY, buffer.as_ref())
            .map_err(StorageError::from);
        if result.is_ok() {
            let flag = if pin == PIN_EMPTY { TRUE_BYTE } else { FALSE_BYTE };
            result = self
                .flash
                .set(PIN_NOT_SET_KEY, &[flag])
                .map_err(StorageError::from);
        }
        pin.zeroize();
        result
    }

    /// Decrypt the key envelope under `pin` and, on a verification-code
    /// match, cache the keys, rebuild the authentication sum, and check the
    /// stored format version against the mounted one.
    fn unlock_inner(&mut self, pin: u32) -> Result<(), StorageError> {
        let mut pin = pin;
        if !self.initialized {
            pin.zeroize();
            return Err(StorageError::Uninitialized);
        }
        let mut stored = [0u8; EDEK_PVC_SIZE];
        match self.flash.get(EDEK_PVC_KEY) {
            Some(v) if v.len() == EDEK_PVC_SIZE => stored.copy_from_slice(v),
            _ => {
                pin.zeroize();
                return Err(StorageError::AuthFailed);
            }
        }
        let mut salt = [0u8; RANDOM_SALT_SIZE];
        salt.copy_from_slice(&stored[..RANDOM_SALT_SIZE]);

        let (kek, keiv) = kdf::derive_kek(pin, &self.hardware_salt, &salt);
        pin.zeroize();
        let mut iv = Zeroizing::new([0u8; IV_SIZE]);
        iv.copy_from_slice(&keiv[..IV_SIZE]);
        let mut ctx = ChaChaPoly::new(&kek, &iv);
        drop(kek);
        drop(keiv);

        let mut keys = Zeroizing::new([0u8; KEYS_SIZE]);
        keys.copy_from_slice(&stored[RANDOM_SALT_SIZE..RANDOM_SALT_SIZE + KEYS_SIZE]);
        ctx.decrypt(keys.as_mut());
        let tag = Zeroizing::new(ctx.tag());
        self.wait_random()?;
        if !self.ct_eq(&tag[..PVC_SIZE], &stored[RANDOM_SALT_SIZE + KEYS_SIZE..])? {
            return Err(StorageError::AuthFailed);
        }
        self.cached_keys.copy_from_slice(keys.as_ref());
        drop(keys);

        // Rebuild and verify the authentication sum for this session.
        self.auth_get(0)?;

        let mut version = [0u8; 4];
        match self.get_encrypted(VERSION_KEY, &mut version) {
            Ok(4) if u32::from_le_bytes(version) == self.active_version => Ok(()),
            Err(e @ StorageError::Fault) => Err(e),
            _ => self.fault(),
        }
    }

    /// Decrypt a protected entry into `dest`: IV, ciphertext, Poly1305 tag,
    /// with the key id bound as associated data.
    fn get_encrypted(&mut self, key: u16, dest: &mut [u8]) -> Result<usize, StorageError> {
        let stored = match self.auth_get(key)? {
            Some(v) => v,
            None => return Err(StorageError::NotFound),
        };
        if stored.len() < IV_SIZE + TAG_SIZE {
            return self.fault();
        }
        let len = stored.len() - IV_SIZE - TAG_SIZE;
        if len > dest.len() {
            return Err(StorageError::BufferTooSmall);
        }

        let iv: &[u8; IV_SIZE] = stored[..IV_SIZE].try_into().expect("12-byte IV");
        let mut ctx = ChaChaPoly::new(self.dek(), iv);
        ctx.aad(&key.to_le_bytes());
        dest[..len].copy_from_slice(&stored[IV_SIZE..IV_SIZE + len]);
        ctx.decrypt(&mut dest[..len]);
        let tag = ctx.tag();

        let matches = match self.ct_eq(&tag, &stored[IV_SIZE + len..]) {
            Ok(m) => m,
            Err(e) => {
                dest.zeroize();
                return Err(e);
            }
        };
        if !matches {
            dest.zeroize();
            return self.fault();
        }
        Ok(len)
    }

    /// Encrypt `val` under the cached DEK and stream it into a preallocated
    /// flash entry: random IV first, then one ChaCha20 block at a time, the
    /// Poly1305 tag last.
    fn set_encrypted(&mut self, key: u16, val: &[u8]) -> Result<(), StorageError> {
        self.auth_reserve(key, IV_SIZE + val.len() + TAG_SIZE)?;

        let mut iv = [0u8; IV_SIZE];
        self.rng.fill_bytes(&mut iv);
        self.flash.update_bytes(key, 0, &iv)?;
        let mut offset = IV_SIZE;

        let mut ctx = ChaChaPoly::new(self.dek(), &iv);
        ctx.aad(&key.to_le_bytes());

        let mut buffer = Zeroizing::new([0u8; BLOCK_SIZE + TAG_SIZE]);
        let mut i = 0;
        while i + BLOCK_SIZE < val.len() {
            buffer[..BLOCK_SIZE].copy_from_slice(&val[i..i + BLOCK_SIZE]);
            ctx.encrypt(&mut buffer[..BLOCK_SIZE]);
            self.flash.update_bytes(key, offset, &buffer[..BLOCK_SIZE])?;
            i += BLOCK_SIZE;
            offset += BLOCK_SIZE;
        }
        let rem = val.len() - i;
        buffer[..rem].copy_from_slice(&val[i..]);
        ctx.encrypt(&mut buffer[..rem]);
        let tag = ctx.tag();
        buffer[rem..rem + TAG_SIZE].copy_from_slice(&tag);
        self.flash.update_bytes(key, offset, &buffer[..rem + TAG_SIZE])?;
        Ok(())
    }

    /// Migrate a version-0 layout: fresh keys, authenticated version entry,
    /// the legacy PIN and fail counter carried over, every remaining entry
    /// re-stored (protected ones through the envelope).
    fn upgrade(&mut self) -> Result<(), StorageError> {
        if self.active_version != 0 {
            return Err(StorageError::UnsupportedVersion(self.active_version));
        }

        self.rng.fill_bytes(self.cached_keys.as_mut());
        self.auth_init()?;
        self.set_encrypted(VERSION_KEY, &FORMAT_VERSION.to_le_bytes())?;

        // The legacy PIN is taken at face value; it was stored without any
        // verification data to check it against.
        let pin = match self.flash.get(V0_PIN_KEY) {
            Some(v) => u32::from_le_bytes(v.try_into().map_err(|_| StorageError::Corrupted)?),
            None => PIN_EMPTY,
        };
        self.set_pin(pin)?;

        let fails = self.v0_pin_get_fails().min(PIN_MAX_TRIES - 1);
        self.pin_logs_init(fails)?;

        let mut entries: Vec<(u16, Vec<u8>)> = Vec::new();
        let mut cursor = 0;
        while let Some((key, val)) = self.flash.get_next(&mut cursor) {
            if key == V0_PIN_KEY || key == V0_PIN_FAIL_KEY {
                continue;
            }
            entries.push((key, val.to_vec()));
        }
        for (key, val) in entries {
            if (key >> 8) as u8 & FLAG_PUBLIC != 0 {
                self.flash.set(key, &val)?;
            } else {
                self.set_encrypted(key, &val)?;
            }
        }

        self.unlocked = false;
        self.cached_keys.zeroize();
        self.active_version = FORMAT_VERSION;
        self.flash.upgrade_finish()?;
        Ok(())
    }

    /// Version-0 fail counter: the first non-zero word of the entry, with
    /// one bit cleared per failed attempt.
    fn v0_pin_get_fails(&self) -> u32 {
        if let Some(val) = self.flash.get(V0_PIN_FAIL_KEY) {
            for chunk in val.chunks_exact(4) {
                let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                if word != 0 {
                    return (!word).count_ones();
                }
            }
        }
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_classification() {
        assert!(!is_protected(0x0004));
        assert!(!is_protected(0x8101));
        assert!(!is_protected(0xBEEF));
        assert!(is_protected(0x0101));
        assert!(is_protected(0x7FFF));
    }
}
