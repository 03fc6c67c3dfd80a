//! Per-connection session crypto: HKDF-SHA256 key derivation from a
//! pre-shared access key plus client/server nonces, and per-frame
//! authenticated encryption with a strictly monotonic counter nonce.
//!
//! Grounded on the pack's ECDH/AES-GCM camera-stream examples
//! (`mealycpp-ECE4301.../leader-main.rs`: `aes_gcm::Aes128Gcm` +
//! `hkdf::Hkdf<Sha256>` + `OsRng`), adapted to a PSK handshake instead of
//! ECDH and to a 32-byte derived key (AES-256-GCM, 128-bit tag).

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::TinycamError;

/// HKDF `info` label, fixed by the wire protocol.
const HKDF_INFO: &[u8] = b"tinycam hkdf v1";

/// Length of the connection id prefix, in bytes.
pub const CONN_ID_LEN: usize = 4;
/// Length of the client/server handshake nonces, in bytes.
pub const HANDSHAKE_NONCE_LEN: usize = 16;
/// Length of the AEAD nonce (conn_id || counter), in bytes.
const AEAD_NONCE_LEN: usize = 12;
/// Length of the AEAD authentication tag, in bytes.
const TAG_LEN: usize = 16;
/// Minimum valid wire record length (nonce + tag, possibly empty ciphertext).
pub const MIN_RECORD_LEN: usize = AEAD_NONCE_LEN + TAG_LEN;

/// Derives the 32-byte session key shared between client and server.
///
/// `HKDF-SHA256(ikm=psk, salt=cnonce||snonce, info="tinycam hkdf v1", len=32)`
#[must_use]
pub fn derive_session_key(psk: &[u8; 32], cnonce: &[u8; 16], snonce: &[u8; 16]) -> [u8; 32] {
    let mut salt = Vec::with_capacity(32);
    salt.extend_from_slice(cnonce);
    salt.extend_from_slice(snonce);

    let hk = Hkdf::<Sha256>::new(Some(&salt), psk);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm)
        .expect("32 is a valid HKDF-SHA256 output length");
    okm
}

/// Generates a random 4-byte connection id.
#[must_use]
pub fn random_conn_id() -> [u8; CONN_ID_LEN] {
    let mut id = [0u8; CONN_ID_LEN];
    rand::rngs::OsRng.fill_bytes(&mut id);
    id
}

/// Generates a random 16-byte handshake nonce (client `cnonce` or server
/// `snonce`).
#[must_use]
pub fn random_handshake_nonce() -> [u8; HANDSHAKE_NONCE_LEN] {
    let mut nonce = [0u8; HANDSHAKE_NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Builds the associated-data bytes that bind every frame of a session to
/// its connection id, expiry, and stream parameters.
///
/// Format: `"{conn_id_b64}|{exp}|{codec}|{w}x{h}|{fps}"`.
#[must_use]
pub fn build_aad(conn_id: &[u8; CONN_ID_LEN], exp: u64, codec: &str, w: u32, h: u32, fps: u32) -> Vec<u8> {
    format!(
        "{}|{}|{}|{}x{}|{}",
        crate::utils::b64_encode(conn_id),
        exp,
        codec,
        w,
        h,
        fps
    )
    .into_bytes()
}

/// Per-connection, per-frame authenticated encryption state.
///
/// One `SessionCrypto` is created per accepted WebSocket after the
/// handshake, and used for the lifetime of that session only.
pub struct SessionCrypto {
    cipher: Aes256Gcm,
    conn_id: [u8; CONN_ID_LEN],
    aad: Vec<u8>,
    /// Strictly increasing; incremented before each use so the first
    /// emitted frame carries counter = 1.
    counter: u64,
    /// Last counter value *accepted* by the decrypting side (-1 sentinel
    /// via `Option::None` so any non-negative first value is accepted).
    last_accepted_counter: Option<u64>,
}

impl SessionCrypto {
    /// Builds a new crypto session from an already-derived key.
    #[must_use]
    pub fn new(session_key: [u8; 32], conn_id: [u8; CONN_ID_LEN], aad: Vec<u8>) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(&session_key);
        Self {
            cipher: Aes256Gcm::new(key),
            conn_id,
            aad,
            counter: 0,
            last_accepted_counter: None,
        }
    }

    /// Returns this session's connection id.
    #[must_use]
    pub fn conn_id(&self) -> [u8; CONN_ID_LEN] {
        self.conn_id
    }

    /// Encrypts one frame of plaintext, returning the wire record:
    /// `nonce (12) || tag (16) || ciphertext`.
    pub fn encrypt_frame(&mut self, plaintext: &[u8]) -> Vec<u8> {
        self.counter += 1;
        let nonce_bytes = self.build_nonce(self.counter);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &self.aad,
                },
            )
            .expect("AES-256-GCM encryption does not fail for well-formed input");

        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut record = Vec::with_capacity(AEAD_NONCE_LEN + TAG_LEN + ciphertext.len());
        record.extend_from_slice(&nonce_bytes);
        record.extend_from_slice(tag);
        record.extend_from_slice(ciphertext);
        record
    }

    /// Decrypts and verifies one wire record, enforcing the conn-id prefix
    /// and strictly-increasing counter invariants before attempting AEAD
    /// verification.
    pub fn decrypt_frame(&mut self, record: &[u8]) -> Result<Vec<u8>, TinycamError> {
        if record.len() < MIN_RECORD_LEN {
            return Err(TinycamError::ProtocolFailure(format!(
                "record too short: {} < {MIN_RECORD_LEN}",
                record.len()
            )));
        }

        let nonce_bytes = &record[0..AEAD_NONCE_LEN];
        if nonce_bytes[0..CONN_ID_LEN] != self.conn_id {
            return Err(TinycamError::ProtocolFailure(
                "nonce conn-id prefix mismatch".into(),
            ));
        }

        let counter = u64::from_be_bytes(
            nonce_bytes[CONN_ID_LEN..AEAD_NONCE_LEN]
                .try_into()
                .expect("8 bytes"),
        );
        if let Some(prev) = self.last_accepted_counter {
            if counter <= prev {
                return Err(TinycamError::ProtocolFailure(format!(
                    "non-increasing counter: {counter} <= {prev}"
                )));
            }
        }

        let tag = &record[AEAD_NONCE_LEN..MIN_RECORD_LEN];
        let ciphertext = &record[MIN_RECORD_LEN..];
        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = self
            .cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed,
                    aad: &self.aad,
                },
            )
            .map_err(|_| TinycamError::ProtocolFailure("AEAD verification failed".into()))?;

        self.last_accepted_counter = Some(counter);
        Ok(plaintext)
    }

    fn build_nonce(&self, counter: u64) -> [u8; AEAD_NONCE_LEN] {
        let mut nonce = [0u8; AEAD_NONCE_LEN];
        nonce[0..CONN_ID_LEN].copy_from_slice(&self.conn_id);
        nonce[CONN_ID_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }
}
