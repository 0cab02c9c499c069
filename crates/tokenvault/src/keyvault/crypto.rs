use aes_gcm::{
    aead::{Aead as _, KeyInit as _},
    Aes256Gcm, Nonce,
};
use base64::Engine as _;
use eyre::Context as _;
use hkdf::Hkdf;
use rand::Rng as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM sealed blob as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoBox {
    pub v: u8,
    pub nonce_b64: String,
    pub ct_b64: String,
}

pub fn fill_random(buf: &mut [u8]) {
    let mut rng = rand::rng();
    rng.fill_bytes(buf);
}

pub fn random_key() -> Zeroizing<[u8; KEY_LEN]> {
    let mut k = Zeroizing::new([0_u8; KEY_LEN]);
    fill_random(k.as_mut_slice());
    k
}

/// Derive the subkey that seals one account's vault entry.
///
/// Binding `scope` (the account's store key) into the HKDF info means a sealed entry copied
/// onto another account's record will not open.
pub fn derive_sealing_key(
    machine_secret: &[u8; KEY_LEN],
    scope: &str,
) -> eyre::Result<Zeroizing<[u8; KEY_LEN]>> {
    let hk = Hkdf::<Sha256>::new(None, machine_secret);
    let info = format!("tokenvault:{scope}:vault-key");
    let mut out = Zeroizing::new([0_u8; KEY_LEN]);
    hk.expand(info.as_bytes(), out.as_mut_slice())
        .map_err(|e| eyre::eyre!("hkdf expand: {e}"))?;
    Ok(out)
}

pub fn encrypt_aes_gcm(key32: &[u8; KEY_LEN], plaintext: &[u8]) -> eyre::Result<CryptoBox> {
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let mut nonce = [0_u8; NONCE_LEN];
    fill_random(&mut nonce);
    let ct = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| eyre::eyre!("aes encrypt: {e}"))?;

    Ok(CryptoBox {
        v: 1,
        nonce_b64: base64::engine::general_purpose::STANDARD.encode(nonce),
        ct_b64: base64::engine::general_purpose::STANDARD.encode(ct),
    })
}

pub fn decrypt_aes_gcm(key32: &[u8; KEY_LEN], b: &CryptoBox) -> eyre::Result<Zeroizing<Vec<u8>>> {
    if b.v != 1 {
        eyre::bail!("unsupported CryptoBox version: {}", b.v);
    }
    let cipher = Aes256Gcm::new_from_slice(key32).context("aes init")?;
    let nonce = base64::engine::general_purpose::STANDARD
        .decode(&b.nonce_b64)
        .context("decode nonce")?;
    if nonce.len() != NONCE_LEN {
        eyre::bail!("invalid nonce length");
    }
    let ct = base64::engine::general_purpose::STANDARD
        .decode(&b.ct_b64)
        .context("decode ciphertext")?;

    let pt = cipher
        .decrypt(Nonce::from_slice(&nonce), ct.as_ref())
        .map_err(|e| eyre::eyre!("aes decrypt: {e}"))?;
    Ok(Zeroizing::new(pt))
}

/// Short public identifier for a key: hex of the first 8 bytes of SHA-256(key).
pub fn fingerprint(key: &[u8; KEY_LEN]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(digest.get(..8).unwrap_or_default())
}
