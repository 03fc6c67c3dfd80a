//! Key material at rest: the access key (data-plane PSK) and management key
//! (control-plane PSK), persisted as a small base64-encoded JSON object.
//!
//! Grounded on the teacher's `ServerConfig::load` pattern (read-or-default,
//! then persist) adapted to binary secret material instead of YAML config.

use std::path::Path;

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{TinycamError, TinycamResult};
use crate::utils::{b64_decode, b64_encode};

/// Number of bytes in an access key or management key.
pub const KEY_LEN: usize = 32;

/// Key material persisted at rest: base64-encoded 32-byte pre-shared keys
/// for the data plane (`access_key`) and control plane (`management_key`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyMaterial {
    #[serde(rename = "managementKey")]
    management_key_b64: String,
    #[serde(rename = "accessKey")]
    access_key_b64: String,
}

impl KeyMaterial {
    /// Generates fresh, random key material.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            management_key_b64: b64_encode(&random_key()),
            access_key_b64: b64_encode(&random_key()),
        }
    }

    /// Loads key material from `path`, generating and persisting fresh
    /// material if the file does not exist.
    pub fn load_or_generate(path: &Path) -> TinycamResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let material = Self::generate();
            material.save(path)?;
            Ok(material)
        }
    }

    /// Loads key material from an existing file.
    pub fn load(path: &Path) -> TinycamResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TinycamError::Configuration(format!("reading key file: {e}")))?;
        let material: Self = serde_json::from_str(&content)
            .map_err(|e| TinycamError::Configuration(format!("parsing key file: {e}")))?;
        material.access_key()?;
        material.management_key()?;
        Ok(material)
    }

    /// Persists key material to `path`.
    pub fn save(&self, path: &Path) -> TinycamResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TinycamError::Internal(format!("serializing key file: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TinycamError::Configuration(format!("creating key dir: {e}")))?;
        }
        std::fs::write(path, content)
            .map_err(|e| TinycamError::Configuration(format!("writing key file: {e}")))?;
        Ok(())
    }

    /// Decodes and returns the 32-byte access (data-plane) key.
    pub fn access_key(&self) -> TinycamResult<[u8; KEY_LEN]> {
        decode_key(&self.access_key_b64)
    }

    /// Decodes and returns the 32-byte management (control-plane) key.
    pub fn management_key(&self) -> TinycamResult<[u8; KEY_LEN]> {
        decode_key(&self.management_key_b64)
    }

    /// Rotates the access key in place to a freshly generated value.
    ///
    /// New WebSocket connections derive their session key from the rotated
    /// value; sessions already streaming keep the key they already derived.
    pub fn rotate_access_key(&mut self) {
        self.access_key_b64 = b64_encode(&random_key());
    }

    /// Rotates the management key in place.
    pub fn rotate_management_key(&mut self) {
        self.management_key_b64 = b64_encode(&random_key());
    }
}

fn random_key() -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn decode_key(b64: &str) -> TinycamResult<[u8; KEY_LEN]> {
    let bytes = b64_decode(b64)
        .map_err(|e| TinycamError::Configuration(format!("invalid key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| TinycamError::Configuration(format!("key must be {KEY_LEN} bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn generate_produces_distinct_32_byte_keys() {
        let material = KeyMaterial::generate();
        let access = material.access_key().unwrap();
        let mgmt = material.management_key().unwrap();
        assert_eq!(access.len(), KEY_LEN);
        assert_eq!(mgmt.len(), KEY_LEN);
        assert_ne!(access, mgmt);
    }

    #[test]
    fn load_or_generate_persists_and_reloads_identically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let first = KeyMaterial::load_or_generate(&path).unwrap();
        assert!(path.exists());

        let second = KeyMaterial::load_or_generate(&path).unwrap();
        assert_eq!(first.access_key().unwrap(), second.access_key().unwrap());
        assert_eq!(
            first.management_key().unwrap(),
            second.management_key().unwrap()
        );
    }

    #[test]
    fn rotate_access_key_changes_access_but_not_management() {
        let mut material = KeyMaterial::generate();
        let mgmt_before = material.management_key().unwrap();
        let access_before = material.access_key().unwrap();

        material.rotate_access_key();

        assert_eq!(material.management_key().unwrap(), mgmt_before);
        assert_ne!(material.access_key().unwrap(), access_before);
    }

    #[test]
    fn load_rejects_malformed_key_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(
            &path,
            r#"{"managementKey":"dG9vc2hvcnQ=","accessKey":"dG9vc2hvcnQ="}"#,
        )
        .unwrap();
        assert!(KeyMaterial::load(&path).is_err());
    }
}
