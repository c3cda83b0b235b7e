//! AES-256-CBC envelope codec.
//!
//! EP pads plaintext to a 32-byte boundary before encrypting, not the
//! cipher's native 16-byte block — `cbc`'s built-in `Pkcs7` assumes the
//! padding modulus equals the block size, so the pad/unpad step here is
//! hand-rolled and `NoPadding` is used for the actual AES-CBC pass.

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{CryptoError, Result};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Padding modulus EP encrypts against — independent of AES's 16-byte block.
const PAD_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;

/// Derives the 32-byte AES key and 16-byte IV from `encoding_aes_key`, EP's
/// convention: base64-decode `encoding_aes_key + "="` to get exactly 32
/// raw key bytes, and reuse the first 16 of them as the CBC IV.
pub fn derive_key(encoding_aes_key: &str) -> Result<([u8; 32], [u8; 16])> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let padded = format!("{encoding_aes_key}=");
    let raw = STANDARD
        .decode(padded.as_bytes())
        .map_err(|e| CryptoError::Base64(e.to_string()))?;
    if raw.len() != 32 {
        return Err(CryptoError::InvalidKey(format!(
            "decoded key is {} bytes, expected 32",
            raw.len()
        )));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&raw);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&raw[..16]);
    Ok((key, iv))
}

/// PKCS#7-style padding at a 32-byte modulus: pads with `pad` bytes each
/// equal to `pad`, where `pad = 32 - (len % 32)`, using a full 32-byte block
/// of padding when `len` is already aligned (so the pad count is never 0 and
/// is always decodable unambiguously).
fn pad32(data: &[u8]) -> Vec<u8> {
    let pad = PAD_BLOCK - (data.len() % PAD_BLOCK);
    let mut out = Vec::with_capacity(data.len() + pad);
    out.extend_from_slice(data);
    out.extend(std::iter::repeat(pad as u8).take(pad));
    out
}

fn unpad32(data: &[u8]) -> Result<Vec<u8>> {
    let pad = *data.last().ok_or(CryptoError::BadPadding)? as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > data.len() {
        return Err(CryptoError::BadPadding);
    }
    let (body, tail) = data.split_at(data.len() - pad);
    if tail.iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::BadPadding);
    }
    Ok(body.to_vec())
}

/// Builds the fixed-format plaintext frame EP encrypts:
/// `random(16) || big-endian length(4) || msg || receiver_id`.
fn frame(msg: &[u8], receiver_id: &str) -> Vec<u8> {
    let mut random = [0u8; RANDOM_PREFIX_LEN];
    rand::thread_rng().fill_bytes(&mut random);

    let mut out = Vec::with_capacity(RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN + msg.len() + receiver_id.len());
    out.extend_from_slice(&random);
    out.extend_from_slice(&(msg.len() as u32).to_be_bytes());
    out.extend_from_slice(msg);
    out.extend_from_slice(receiver_id.as_bytes());
    out
}

/// Parses the fixed-format frame back into `(msg, receiver_id)`, verifying
/// the embedded receiver id matches `expected_receiver_id`.
fn unframe(plaintext: &[u8], expected_receiver_id: &str) -> Result<Vec<u8>> {
    let min_len = RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN;
    if plaintext.len() < min_len {
        return Err(CryptoError::ShortPlaintext);
    }
    let len_bytes: [u8; 4] = plaintext[RANDOM_PREFIX_LEN..min_len]
        .try_into()
        .map_err(|_| CryptoError::ShortPlaintext)?;
    let msg_len = u32::from_be_bytes(len_bytes) as usize;

    let msg_start = min_len;
    let msg_end = msg_start
        .checked_add(msg_len)
        .ok_or(CryptoError::ShortPlaintext)?;
    if msg_end > plaintext.len() {
        return Err(CryptoError::ShortPlaintext);
    }

    let msg = &plaintext[msg_start..msg_end];
    let receiver_id = &plaintext[msg_end..];
    if receiver_id != expected_receiver_id.as_bytes() {
        return Err(CryptoError::ReceiverIdMismatch);
    }
    Ok(msg.to_vec())
}

/// Encrypts `msg` into the base64 `Encrypt` field EP expects.
pub fn encrypt(encoding_aes_key: &str, receiver_id: &str, msg: &[u8]) -> Result<String> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let (key, iv) = derive_key(encoding_aes_key)?;
    let framed = frame(msg, receiver_id);
    let padded = pad32(&framed);

    let mut buf = padded;
    let ciphertext = Aes256CbcEnc::new(&key.into(), &iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, buf.len())
        .map_err(|_| CryptoError::UnalignedCiphertext)?;
    Ok(STANDARD.encode(ciphertext))
}

/// Decrypts a base64 `Encrypt` field back to the inner message bytes,
/// verifying the framed receiver id against `expected_receiver_id`.
pub fn decrypt(encoding_aes_key: &str, expected_receiver_id: &str, encrypt_b64: &str) -> Result<Vec<u8>> {
    use base64::{engine::general_purpose::STANDARD, Engine};

    let (key, iv) = derive_key(encoding_aes_key)?;
    let mut ciphertext = STANDARD
        .decode(encrypt_b64)
        .map_err(|e| CryptoError::Base64(e.to_string()))?;
    if ciphertext.len() % 16 != 0 || ciphertext.is_empty() {
        return Err(CryptoError::UnalignedCiphertext);
    }

    let plaintext = Aes256CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut ciphertext)
        .map_err(|_| CryptoError::BadPadding)?;
    let unpadded = unpad32(plaintext)?;
    unframe(&unpadded, expected_receiver_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    // `encoding_aes_key` must decode (with "=" appended) to exactly 32 bytes.
    const TEST_KEY: &str = "jWmYm7qr5nMoAEWo9FjciXYzjxM4OmKrPG1PGIoQJSv";

    #[test]
    fn round_trips_short_message() {
        let msg = b"hello from the bot channel";
        let enc = encrypt(TEST_KEY, "corp123", msg).unwrap();
        let dec = decrypt(TEST_KEY, "corp123", &enc).unwrap();
        assert_eq!(dec, msg);
    }

    #[test]
    fn round_trips_message_aligned_to_pad_block() {
        let msg = vec![b'a'; 64];
        let enc = encrypt(TEST_KEY, "corp123", &msg).unwrap();
        let dec = decrypt(TEST_KEY, "corp123", &enc).unwrap();
        assert_eq!(dec, msg);
    }

    #[test]
    fn decrypt_rejects_wrong_receiver_id() {
        let msg = b"payload";
        let enc = encrypt(TEST_KEY, "corp123", msg).unwrap();
        let err = decrypt(TEST_KEY, "someone-else", &enc).unwrap_err();
        assert_eq!(err.code(), "RECEIVER_ID_MISMATCH");
    }

    #[test]
    fn pad32_always_adds_at_least_one_byte() {
        assert_eq!(pad32(&[]).len(), 32);
        assert_eq!(pad32(&[0u8; 32]).len(), 64);
        assert_eq!(pad32(&[0u8; 31]).len(), 32);
    }

    #[test]
    fn unpad32_rejects_corrupted_padding() {
        let mut padded = pad32(b"abc");
        let last = padded.len() - 1;
        padded[last] ^= 0xFF;
        assert!(unpad32(&padded).is_err());
    }
}
