//! Signer registry: the set of public keys envelope signatures verify
//! against, keyed by `source_id`.
//!
//! Loaded once at startup from a directory of `<source_id>.pub` files
//! (raw 32-byte Ed25519 public keys) and never mutated afterward — adding a
//! new agent requires a restart, matching the rest of this crate's
//! global-singleton configuration model.

use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::{AmoskysError, Result};

#[derive(Debug, Clone)]
pub struct SignerRegistry {
    keys: Arc<HashMap<String, VerifyingKey>>,
}

impl SignerRegistry {
    pub fn from_pairs(pairs: Vec<(String, VerifyingKey)>) -> Self {
        Self {
            keys: Arc::new(pairs.into_iter().collect()),
        }
    }

    /// Loads every `<source_id>.pub` file in `dir` into the registry.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut keys = HashMap::new();
        let entries = std::fs::read_dir(dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pub") {
                continue;
            }
            let source_id = path
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| AmoskysError::Config(format!("unreadable signer file {path:?}")))?
                .to_string();
            let raw = std::fs::read(&path)?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| AmoskysError::Config(format!("{path:?} is not a 32-byte public key")))?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|e| AmoskysError::Config(format!("{path:?}: {e}")))?;
            keys.insert(source_id, key);
        }
        Ok(Self { keys: Arc::new(keys) })
    }

    pub fn get(&self, source_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(source_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[test]
    fn loads_pub_files_keyed_by_stem() {
        let dir = tempfile::tempdir().unwrap();
        let mut csprng = OsRng;
        let key = SigningKey::generate(&mut csprng);
        std::fs::write(dir.path().join("agent-1.pub"), key.verifying_key().to_bytes()).unwrap();
        std::fs::write(dir.path().join("README.md"), b"ignored").unwrap();

        let registry = SignerRegistry::load_dir(dir.path()).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("agent-1").is_some());
        assert!(registry.get("agent-2").is_none());
    }
}
