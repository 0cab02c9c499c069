use crate::{errors::VaultError, keyvault::crypto};
use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use num_bigint::BigUint;
use zeroize::Zeroizing;

const TAG_LEN: usize = 16;
/// Widest plaintext amount accepted, in bytes. Far beyond any real token supply.
pub const MAX_AMOUNT_BYTES: usize = 1024;

/// Parse a hex ciphertext balance (`0x` optional) into raw bytes.
pub fn decode_ciphertext(s: &str, max_bytes: usize) -> Result<Vec<u8>, VaultError> {
    let t = s.trim();
    let body = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    if body.len() / 2 > max_bytes {
        return Err(VaultError::DecryptionFailed);
    }
    hex::decode(body).map_err(|_e| VaultError::DecryptionFailed)
}

/// Decrypt `nonce || AES-256-GCM ciphertext || tag` into a base-unit amount.
///
/// The plaintext is a big-endian unsigned integer. Any failure (short input, tag mismatch,
/// empty or oversized plaintext) yields `DecryptionFailed` and nothing else.
pub fn decrypt_balance(ciphertext: &[u8], key: &[u8; crypto::KEY_LEN]) -> Result<BigUint, VaultError> {
    if ciphertext.len() < crypto::NONCE_LEN + TAG_LEN + 1 {
        return Err(VaultError::DecryptionFailed);
    }
    let (nonce, body) = ciphertext.split_at(crypto::NONCE_LEN);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_e| VaultError::DecryptionFailed)?;
    let pt = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_e| VaultError::DecryptionFailed)?,
    );
    if pt.is_empty() || pt.len() > MAX_AMOUNT_BYTES {
        return Err(VaultError::DecryptionFailed);
    }
    Ok(BigUint::from_bytes_be(&pt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng as _;

    fn seal(amount: &BigUint, key: &[u8; 32]) -> eyre::Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| eyre::eyre!("{e}"))?;
        let mut nonce = [0_u8; 12];
        rand::rng().fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), amount.to_bytes_be().as_slice())
            .map_err(|e| eyre::eyre!("{e}"))?;
        Ok([nonce.as_slice(), ct.as_slice()].concat())
    }

    #[test]
    fn decrypts_small_amount() -> eyre::Result<()> {
        let key = [5_u8; 32];
        let ct = seal(&BigUint::from(1_500_000_u64), &key)?;
        assert_eq!(decrypt_balance(&ct, &key)?, BigUint::from(1_500_000_u64));
        Ok(())
    }

    #[test]
    fn decrypts_amount_wider_than_u128() -> eyre::Result<()> {
        let key = [5_u8; 32];
        let huge = BigUint::from(u128::MAX) * BigUint::from(1_000_u32) + BigUint::from(7_u32);
        let ct = seal(&huge, &key)?;
        assert_eq!(decrypt_balance(&ct, &key)?, huge);
        Ok(())
    }

    #[test]
    fn deterministic_for_same_inputs() -> eyre::Result<()> {
        let key = [5_u8; 32];
        let ct = seal(&BigUint::from(42_u32), &key)?;
        assert_eq!(decrypt_balance(&ct, &key)?, decrypt_balance(&ct, &key)?);
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> eyre::Result<()> {
        let ct = seal(&BigUint::from(42_u32), &[5_u8; 32])?;
        assert_eq!(
            decrypt_balance(&ct, &[6_u8; 32]),
            Err(VaultError::DecryptionFailed)
        );
        Ok(())
    }

    #[test]
    fn tampered_or_truncated_input_fails() -> eyre::Result<()> {
        let key = [5_u8; 32];
        let mut ct = seal(&BigUint::from(42_u32), &key)?;
        if let Some(last) = ct.last_mut() {
            *last ^= 0x01;
        }
        assert_eq!(decrypt_balance(&ct, &key), Err(VaultError::DecryptionFailed));
        assert_eq!(
            decrypt_balance(&[0_u8; 20], &key),
            Err(VaultError::DecryptionFailed)
        );
        Ok(())
    }

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_ciphertext("0x0a0B", 16), Ok(vec![0x0a, 0x0b]));
        assert_eq!(decode_ciphertext("0a0b", 16), Ok(vec![0x0a, 0x0b]));
        assert_eq!(decode_ciphertext("0xzz", 16), Err(VaultError::DecryptionFailed));
        assert_eq!(decode_ciphertext("0x0a0b0c", 2), Err(VaultError::DecryptionFailed));
    }
}
