//! PIN key derivation.

use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::storage::{HARDWARE_SALT_SIZE, RANDOM_SALT_SIZE};

/// Total PBKDF2 iterations spent per derivation, split evenly between the
/// key half and the IV half.
const PIN_ITER_COUNT: u32 = 20_000;

/// Derive the key-encryption key and its IV source from the PIN.
///
/// The password is the PIN as a 4-byte little-endian word; the salt is the
/// hashed hardware secret followed by the per-PIN random salt. One 64-byte
/// PBKDF2-HMAC-SHA256 output yields two independent 32-byte halves (the
/// underlying block computations use distinct block indices), of which the
/// IV half contributes its first 12 bytes to the envelope nonce.
pub(crate) fn derive_kek(
    pin: u32,
    hardware_salt: &[u8; HARDWARE_SALT_SIZE],
    random_salt: &[u8; RANDOM_SALT_SIZE],
) -> (Zeroizing<[u8; 32]>, Zeroizing<[u8; 32]>) {
    let mut pin = pin;
    let password = Zeroizing::new(pin.to_le_bytes());
    pin.zeroize();

    let mut salt = Zeroizing::new([0u8; HARDWARE_SALT_SIZE + RANDOM_SALT_SIZE]);
    salt[..HARDWARE_SALT_SIZE].copy_from_slice(hardware_salt);
    salt[HARDWARE_SALT_SIZE..].copy_from_slice(random_salt);

    let mut output = Zeroizing::new([0u8; 64]);
    pbkdf2_hmac::<Sha256>(
        password.as_ref(),
        salt.as_ref(),
        PIN_ITER_COUNT / 2,
        output.as_mut(),
    );

    let mut kek = Zeroizing::new([0u8; 32]);
    let mut keiv = Zeroizing::new([0u8; 32]);
    kek.copy_from_slice(&output[..32]);
    keiv.copy_from_slice(&output[32..]);
    (kek, keiv)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HW: [u8; 32] = [0x42; 32];

    #[test]
    fn derivation_is_deterministic() {
        let (kek_a, keiv_a) = derive_kek(1, &HW, &[1, 2, 3, 4]);
        let (kek_b, keiv_b) = derive_kek(1, &HW, &[1, 2, 3, 4]);
        assert_eq!(*kek_a, *kek_b);
        assert_eq!(*keiv_a, *keiv_b);
        assert_ne!(*kek_a, *keiv_a);
    }

    #[test]
    fn every_input_separates_the_output() {
        let (base, _) = derive_kek(1, &HW, &[1, 2, 3, 4]);
        let (other_pin, _) = derive_kek(2, &HW, &[1, 2, 3, 4]);
        let (other_salt, _) = derive_kek(1, &HW, &[1, 2, 3, 5]);
        let (other_hw, _) = derive_kek(1, &[0x43; 32], &[1, 2, 3, 4]);
        assert_ne!(*base, *other_pin);
        assert_ne!(*base, *other_salt);
        assert_ne!(*base, *other_hw);
    }
}
