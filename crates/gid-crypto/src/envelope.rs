//! Hybrid encryption for messages and files.
//!
//! Every payload gets a fresh random ChaCha20Poly1305 key. That key is
//! wrapped for the recipient with an X25519 sealed box (ephemeral-static DH,
//! HKDF-SHA256, ChaCha20Poly1305), so only the holder of the recipient's
//! private key can recover it. The relay only ever sees the resulting
//! [`CipherBlob`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use hkdf::Hkdf;
use rand_core::{OsRng, RngCore};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroizing;

use crate::identity::{AgentKeypair, AgentPublicKey};

/// Length of the per-payload symmetric key.
pub const SYMMETRIC_KEY_LEN: usize = 32;

/// Length of the payload nonce prepended to the ciphertext.
pub const NONCE_LEN: usize = 12;

/// AEAD tag overhead.
pub const TAG_LEN: usize = 16;

/// Wrapped key layout: ephemeral X25519 public key || sealed symmetric key.
pub const WRAPPED_KEY_LEN: usize = 32 + SYMMETRIC_KEY_LEN + TAG_LEN;

/// Separator between the text parts of a blob.
pub const BLOB_PART_SEPARATOR: &str = "||";

/// Shown in place of a message that could not be decrypted.
pub const UNDECRYPTABLE_SENTINEL: &str = "[ENCRYPTED DATA - CANNOT DECRYPT]";

const WRAP_INFO: &[u8] = b"gid_wrap_v1_key";
const PAYLOAD_AAD: &[u8] = b"gid_payload_v1";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid key bytes")]
    InvalidKeyBytes,
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("malformed blob: {0}")]
    Malformed(&'static str),
    #[error("file name must not contain '|'")]
    InvalidFileName,
}

/// Cleartext metadata carried alongside an encrypted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
}

/// Output of the hybrid engine: a wrapped key plus the payload ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherBlob {
    pub wrapped_key: Vec<u8>,
    /// `nonce || ciphertext || tag`
    pub ciphertext: Vec<u8>,
    pub metadata: Option<FileMeta>,
}

fn kdf_wrap_key(
    shared_secret: &[u8; 32],
    eph_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, EnvelopeError> {
    // Salt binds the derived key to both public halves of the exchange
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(eph_pub);
    salt[32..].copy_from_slice(recipient_pub);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(WRAP_INFO, key.as_mut())
        .map_err(|_| EnvelopeError::InvalidKeyBytes)?;
    Ok(key)
}

/// Wrap `sym_key` so that only `recipient` can recover it.
fn wrap_key(recipient: &AgentPublicKey, sym_key: &[u8; SYMMETRIC_KEY_LEN]) -> Result<Vec<u8>, EnvelopeError> {
    let eph = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = X25519PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&recipient.to_x25519());

    let kek = kdf_wrap_key(shared.as_bytes(), eph_pub.as_bytes(), recipient.as_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek.as_ref()));
    // The wrapping key is single-use, so a fixed nonce is safe
    let sealed = cipher
        .encrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), sym_key.as_slice())
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(eph_pub.as_bytes());
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

fn unwrap_key(
    keypair: &AgentKeypair,
    wrapped: &[u8],
) -> Result<Zeroizing<[u8; SYMMETRIC_KEY_LEN]>, EnvelopeError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(EnvelopeError::InvalidKeyBytes);
    }
    let eph_pub: [u8; 32] = wrapped[..32]
        .try_into()
        .map_err(|_| EnvelopeError::InvalidKeyBytes)?;
    let shared = keypair
        .secret()
        .diffie_hellman(&X25519PublicKey::from(eph_pub));

    let kek = kdf_wrap_key(shared.as_bytes(), &eph_pub, keypair.public_key().as_bytes())?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(kek.as_ref()));
    let plain = Zeroizing::new(
        cipher
            .decrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), &wrapped[32..])
            .map_err(|_| EnvelopeError::DecryptFailed)?,
    );

    let mut key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    if plain.len() != SYMMETRIC_KEY_LEN {
        return Err(EnvelopeError::DecryptFailed);
    }
    key.copy_from_slice(&plain);
    Ok(key)
}

fn encrypt_payload(sym_key: &[u8; SYMMETRIC_KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(sym_key));
    let ct = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload { msg: plaintext, aad: PAYLOAD_AAD },
        )
        .map_err(|_| EnvelopeError::EncryptFailed)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

fn decrypt_payload(sym_key: &[u8; SYMMETRIC_KEY_LEN], data: &[u8]) -> Result<Vec<u8>, EnvelopeError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(EnvelopeError::Malformed("ciphertext too short"));
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(sym_key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: PAYLOAD_AAD })
        .map_err(|_| EnvelopeError::DecryptFailed)
}

fn seal_with_metadata(
    recipient: &AgentPublicKey,
    plaintext: &[u8],
    metadata: Option<FileMeta>,
) -> Result<CipherBlob, EnvelopeError> {
    let mut sym_key = Zeroizing::new([0u8; SYMMETRIC_KEY_LEN]);
    OsRng.fill_bytes(sym_key.as_mut());

    let ciphertext = encrypt_payload(&sym_key, plaintext)?;
    let wrapped_key = wrap_key(recipient, &sym_key)?;

    Ok(CipherBlob {
        wrapped_key,
        ciphertext,
        metadata,
    })
}

/// Encrypt `plaintext` for `recipient` under a fresh symmetric key.
pub fn seal_message(recipient: &AgentPublicKey, plaintext: &[u8]) -> Result<CipherBlob, EnvelopeError> {
    seal_with_metadata(recipient, plaintext, None)
}

/// Encrypt file contents for `recipient`, carrying name and size in clear.
pub fn seal_file(recipient: &AgentPublicKey, name: &str, data: &[u8]) -> Result<CipherBlob, EnvelopeError> {
    if name.is_empty() || name.contains('|') {
        return Err(EnvelopeError::InvalidFileName);
    }
    let meta = FileMeta {
        name: name.to_string(),
        size: data.len() as u64,
    };
    seal_with_metadata(recipient, data, Some(meta))
}

/// Unwrap the symmetric key with the local private key and decrypt.
pub fn open(keypair: &AgentKeypair, blob: &CipherBlob) -> Result<Vec<u8>, EnvelopeError> {
    let sym_key = unwrap_key(keypair, &blob.wrapped_key)?;
    decrypt_payload(&sym_key, &blob.ciphertext)
}

/// Decrypt a text message, falling back to [`UNDECRYPTABLE_SENTINEL`].
pub fn open_message_or_sentinel(keypair: &AgentKeypair, blob: &CipherBlob) -> String {
    open(keypair, blob)
        .ok()
        .and_then(|pt| String::from_utf8(pt).ok())
        .unwrap_or_else(|| UNDECRYPTABLE_SENTINEL.to_string())
}

impl CipherBlob {
    /// `wrapped_hex||ciphertext_b64`
    pub fn to_message_text(&self) -> String {
        format!(
            "{}{}{}",
            hex::encode(&self.wrapped_key),
            BLOB_PART_SEPARATOR,
            BASE64.encode(&self.ciphertext)
        )
    }

    pub fn parse_message_text(text: &str) -> Result<Self, EnvelopeError> {
        let (wrapped_hex, ct_b64) = text
            .split_once(BLOB_PART_SEPARATOR)
            .ok_or(EnvelopeError::Malformed("missing blob separator"))?;
        Ok(Self {
            wrapped_key: hex::decode(wrapped_hex)
                .map_err(|_| EnvelopeError::Malformed("wrapped key is not hex"))?,
            ciphertext: BASE64
                .decode(ct_b64)
                .map_err(|_| EnvelopeError::Malformed("ciphertext is not base64"))?,
            metadata: None,
        })
    }

    /// `name||size||wrapped_hex||ciphertext_b64`
    pub fn to_file_text(&self) -> Result<String, EnvelopeError> {
        let meta = self
            .metadata
            .as_ref()
            .ok_or(EnvelopeError::Malformed("file blob without metadata"))?;
        if meta.name.contains('|') {
            return Err(EnvelopeError::InvalidFileName);
        }
        Ok([
            meta.name.clone(),
            meta.size.to_string(),
            hex::encode(&self.wrapped_key),
            BASE64.encode(&self.ciphertext),
        ]
        .join(BLOB_PART_SEPARATOR))
    }

    pub fn parse_file_text(text: &str) -> Result<Self, EnvelopeError> {
        let mut parts = text.splitn(4, BLOB_PART_SEPARATOR);
        let name = parts.next().filter(|s| !s.is_empty());
        let size = parts.next();
        let wrapped_hex = parts.next();
        let ct_b64 = parts.next();

        let (Some(name), Some(size), Some(wrapped_hex), Some(ct_b64)) = (name, size, wrapped_hex, ct_b64) else {
            return Err(EnvelopeError::Malformed("file blob needs four parts"));
        };

        Ok(Self {
            wrapped_key: hex::decode(wrapped_hex)
                .map_err(|_| EnvelopeError::Malformed("wrapped key is not hex"))?,
            ciphertext: BASE64
                .decode(ct_b64)
                .map_err(|_| EnvelopeError::Malformed("ciphertext is not base64"))?,
            metadata: Some(FileMeta {
                name: name.to_string(),
                size: size
                    .parse()
                    .map_err(|_| EnvelopeError::Malformed("file size is not a number"))?,
            }),
        })
    }
}
