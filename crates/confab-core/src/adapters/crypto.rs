//! Session crypto: X25519 sealed-box key exchange and ChaCha20-Poly1305
//! media framing.
//!
//! The master generates the call secrets ([`SessionKeys`]); every other
//! participant hands it an X25519 public key over the one-shot key connection
//! and receives `(call key ‖ session nonce)` sealed to that key, with the IV
//! in plaintext alongside.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret as X25519Secret};

use crate::application::session::SessionKeys;
use crate::domain::media::{FrameError, MediaUnit};

/// Sealed key payload: 32-byte call key plus the 8-byte session nonce.
const KEY_PAYLOAD_LEN: usize = 40;

/// Wire nonce prepended to every media ciphertext.
const WIRE_NONCE_LEN: usize = 12;

// ---------------------------------------------------------------------------
// Call secrets
// ---------------------------------------------------------------------------

/// Fresh random key material for a new call. Master-only.
pub fn generate_call_secrets() -> SessionKeys {
    let mut key = [0u8; 32];
    let mut iv = [0u8; 12];
    OsRng.fill_bytes(&mut key);
    OsRng.fill_bytes(&mut iv);
    SessionKeys {
        key,
        iv,
        session_nonce: OsRng.next_u64(),
    }
}

// ---------------------------------------------------------------------------
// Handshake keypair (non-master side)
// ---------------------------------------------------------------------------

pub struct HandshakeKeypair {
    secret: X25519Secret,
    public: X25519Public,
}

impl HandshakeKeypair {
    pub fn generate() -> Self {
        let secret = X25519Secret::random_from_rng(OsRng);
        let public = X25519Public::from(&secret);
        Self { secret, public }
    }

    pub fn public_b64(&self) -> String {
        BASE64.encode(self.public.as_bytes())
    }

    /// Unseal the master's `key_info` reply into usable session keys.
    pub fn unseal_keys(&self, sealed_b64: &str, iv_b64: &str) -> anyhow::Result<SessionKeys> {
        let sealed = BASE64.decode(sealed_b64)?;
        let plain = unseal(&self.secret, &sealed)?;
        if plain.len() != KEY_PAYLOAD_LEN {
            anyhow::bail!("sealed key payload has wrong length: {}", plain.len());
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&plain[..32]);
        let session_nonce = u64::from_be_bytes(plain[32..].try_into()?);

        let iv_bytes = BASE64.decode(iv_b64)?;
        let iv: [u8; 12] = iv_bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("IV has wrong length: {}", iv_bytes.len()))?;

        Ok(SessionKeys {
            key,
            iv,
            session_nonce,
        })
    }
}

// ---------------------------------------------------------------------------
// Sealed box (master side)
// ---------------------------------------------------------------------------

/// Seal the call secrets to a participant's public key. Returns
/// `(sealed_b64, iv_b64)` ready for a `key_info` message.
pub fn seal_keys(keys: &SessionKeys, recipient_pub_b64: &str) -> anyhow::Result<(String, String)> {
    let pub_bytes = BASE64.decode(recipient_pub_b64)?;
    let pub_arr: [u8; 32] = pub_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("public key has wrong length: {}", pub_bytes.len()))?;

    let mut payload = [0u8; KEY_PAYLOAD_LEN];
    payload[..32].copy_from_slice(&keys.key);
    payload[32..].copy_from_slice(&keys.session_nonce.to_be_bytes());

    let sealed = seal_to(&pub_arr, &payload)?;
    Ok((BASE64.encode(sealed), BASE64.encode(keys.iv)))
}

/// Ephemeral X25519 + SHA-256 + ChaCha20-Poly1305 sealed box. The zeroed AEAD
/// nonce is sound because the symmetric key is used exactly once.
fn seal_to(recipient_pub: &[u8; 32], payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let eph_secret = X25519Secret::random_from_rng(OsRng);
    let eph_public = X25519Public::from(&eph_secret);

    let shared = eph_secret.diffie_hellman(&X25519Public::from(*recipient_pub));
    let sym_key = Sha256::digest(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new_from_slice(&sym_key)?;
    let ciphertext = cipher
        .encrypt(&Nonce::default(), payload)
        .map_err(|e| anyhow::anyhow!("seal error: {e}"))?;

    let mut sealed = Vec::with_capacity(32 + ciphertext.len());
    sealed.extend_from_slice(eph_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

fn unseal(secret: &X25519Secret, sealed: &[u8]) -> anyhow::Result<Vec<u8>> {
    if sealed.len() < 32 {
        anyhow::bail!("sealed data too short");
    }
    let mut eph_pub = [0u8; 32];
    eph_pub.copy_from_slice(&sealed[..32]);

    let shared = secret.diffie_hellman(&X25519Public::from(eph_pub));
    let sym_key = Sha256::digest(shared.as_bytes());

    let cipher = ChaCha20Poly1305::new_from_slice(&sym_key)?;
    cipher
        .decrypt(&Nonce::default(), &sealed[32..])
        .map_err(|e| anyhow::anyhow!("unseal error: {e}"))
}

// ---------------------------------------------------------------------------
// Media cipher
// ---------------------------------------------------------------------------

/// Encrypts and decrypts whole media units under the shared call key.
///
/// Wire format inside the base64 envelope: `wire_nonce (12) ‖ ciphertext`.
/// The call IV is authenticated as associated data, binding every unit to its
/// call.
pub struct MediaCipher {
    cipher: ChaCha20Poly1305,
    iv: [u8; 12],
}

impl MediaCipher {
    pub fn new(keys: &SessionKeys) -> anyhow::Result<Self> {
        Ok(Self {
            cipher: ChaCha20Poly1305::new_from_slice(&keys.key)?,
            iv: keys.iv,
        })
    }

    /// Serialize and encrypt one unit into an envelope payload.
    pub fn seal_unit(&self, unit: &MediaUnit) -> anyhow::Result<String> {
        let plain = serde_json::to_vec(unit)?;

        let mut wire_nonce = [0u8; WIRE_NONCE_LEN];
        OsRng.fill_bytes(&mut wire_nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                &Nonce::from(wire_nonce),
                Payload {
                    msg: &plain,
                    aad: &self.iv,
                },
            )
            .map_err(|e| anyhow::anyhow!("media seal error: {e}"))?;

        let mut out = Vec::with_capacity(WIRE_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&wire_nonce);
        out.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(out))
    }

    /// Decode and decrypt an envelope payload back into a unit.
    pub fn open_unit(&self, payload_b64: &str) -> Result<MediaUnit, FrameError> {
        let data = BASE64.decode(payload_b64)?;
        if data.len() < WIRE_NONCE_LEN {
            return Err(FrameError::Truncated);
        }
        let (wire_nonce, ciphertext) = data.split_at(WIRE_NONCE_LEN);
        let nonce: [u8; WIRE_NONCE_LEN] = wire_nonce.try_into().map_err(|_| FrameError::Truncated)?;

        let plain = self
            .cipher
            .decrypt(
                &Nonce::from(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &self.iv,
                },
            )
            .map_err(|_| FrameError::Crypto)?;

        Ok(serde_json::from_slice(&plain)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::roster::Medium;

    fn unit() -> MediaUnit {
        MediaUnit {
            medium: Medium::Audio,
            seq: 3,
            session_nonce: 0x1122,
            packet_nonce: 0x3344,
            source: "alice".into(),
            timestamp_us: 1_700_000_000_000_000,
            payload: b"opus frame bytes".to_vec(),
        }
    }

    #[test]
    fn handshake_round_trip() {
        let call = generate_call_secrets();
        let peer = HandshakeKeypair::generate();

        let (sealed, iv) = seal_keys(&call, &peer.public_b64()).unwrap();
        let recovered = peer.unseal_keys(&sealed, &iv).unwrap();

        assert_eq!(recovered.key, call.key);
        assert_eq!(recovered.iv, call.iv);
        assert_eq!(recovered.session_nonce, call.session_nonce);
    }

    #[test]
    fn wrong_recipient_cannot_unseal() {
        let call = generate_call_secrets();
        let peer = HandshakeKeypair::generate();
        let eavesdropper = HandshakeKeypair::generate();

        let (sealed, iv) = seal_keys(&call, &peer.public_b64()).unwrap();
        assert!(eavesdropper.unseal_keys(&sealed, &iv).is_err());
    }

    #[test]
    fn media_unit_round_trip() {
        let keys = generate_call_secrets();
        let cipher = MediaCipher::new(&keys).unwrap();

        let sealed = cipher.seal_unit(&unit()).unwrap();
        let opened = cipher.open_unit(&sealed).unwrap();
        assert_eq!(opened, unit());
    }

    #[test]
    fn distinct_calls_cannot_read_each_other() {
        let cipher_a = MediaCipher::new(&generate_call_secrets()).unwrap();
        let cipher_b = MediaCipher::new(&generate_call_secrets()).unwrap();

        let sealed = cipher_a.seal_unit(&unit()).unwrap();
        assert!(matches!(
            cipher_b.open_unit(&sealed),
            Err(FrameError::Crypto)
        ));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let keys = generate_call_secrets();
        let cipher = MediaCipher::new(&keys).unwrap();

        let sealed = cipher.seal_unit(&unit()).unwrap();
        let mut raw = BASE64.decode(sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        assert!(matches!(
            cipher.open_unit(&tampered),
            Err(FrameError::Crypto)
        ));
    }
}
