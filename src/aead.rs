//! ChaCha20-Poly1305 per RFC 7539, assembled from its component primitives.
//!
//! The storage envelope needs two things the one-shot AEAD API cannot give:
//! ciphertext streamed into flash one ChaCha20 block at a time, and the raw
//! Poly1305 tag (the PIN verification code stores only its first half). The
//! context below exposes both while keeping the standard construction:
//! Poly1305 one-time key from keystream block 0, payload keystream from
//! block 1, tag over the padded AAD, the padded ciphertext and the length
//! block.

use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::Poly1305;
use zeroize::Zeroizing;

pub(crate) const IV_SIZE: usize = 12;
pub(crate) const TAG_SIZE: usize = 16;
pub(crate) const BLOCK_SIZE: usize = 64;

pub(crate) struct ChaChaPoly {
    cipher: ChaCha20,
    mac: Poly1305,
    aad_len: u64,
    msg_len: u64,
}

impl ChaChaPoly {
    pub(crate) fn new(key: &[u8; 32], iv: &[u8; IV_SIZE]) -> Self {
        let mut cipher = ChaCha20::new(key.into(), iv.into());
        let mut mac_key = Zeroizing::new([0u8; 32]);
        cipher.apply_keystream(mac_key.as_mut());
        cipher.seek(BLOCK_SIZE as u64);
        let mac = Poly1305::new(poly1305::Key::from_slice(mac_key.as_ref()));
        Self {
            cipher,
            mac,
            aad_len: 0,
            msg_len: 0,
        }
    }

    /// Mix associated data into the tag. Call before any payload bytes.
    pub(crate) fn aad(&mut self, aad: &[u8]) {
        self.mac.update_padded(aad);
        self.aad_len += aad.len() as u64;
    }

    /// Encrypt a chunk in place and absorb the resulting ciphertext.
    ///
    /// Every chunk except the final one must be a multiple of the Poly1305
    /// block (16 bytes); the envelope streams whole 64-byte ChaCha20 blocks.
    pub(crate) fn encrypt(&mut self, buf: &mut [u8]) {
        self.cipher.apply_keystream(buf);
        self.mac.update_padded(buf);
        self.msg_len += buf.len() as u64;
    }

    /// Absorb a ciphertext chunk and decrypt it in place.
    pub(crate) fn decrypt(&mut self, buf: &mut [u8]) {
        self.mac.update_padded(buf);
        self.cipher.apply_keystream(buf);
        self.msg_len += buf.len() as u64;
    }

    /// Close the MAC over the length block and return the 16-byte tag.
    pub(crate) fn tag(mut self) -> [u8; TAG_SIZE] {
        let mut lengths = [0u8; 16];
        lengths[..8].copy_from_slice(&self.aad_len.to_le_bytes());
        lengths[8..].copy_from_slice(&self.msg_len.to_le_bytes());
        self.mac.update_padded(&lengths);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&self.mac.finalize());
        tag
    }
}
