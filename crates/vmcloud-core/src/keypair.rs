use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};
use ssh_key::private::Ed25519Keypair;
use ssh_key::{LineEnding, PrivateKey, PublicKey};
use tracing::{info, instrument};
use vmcloud_common::{id_prefix, new_id, CloudError, Filter, KeyPair, Result};

use crate::persistence::Repository;

/// A freshly generated pair. The private half is never stored.
#[derive(Debug, Clone)]
pub struct GeneratedKeyPair {
    pub key_pair: KeyPair,
    pub private_key: String,
}

/// SSH key pairs by unique name.
pub struct KeyPairService {
    key_pairs: Repository<KeyPair>,
}

impl KeyPairService {
    pub fn new(key_pairs: Repository<KeyPair>) -> Self {
        Self { key_pairs }
    }

    #[instrument(skip(self))]
    pub async fn create_key_pair(&self, name: &str) -> Result<GeneratedKeyPair> {
        self.ensure_free(name).await?;

        let rng = SystemRandom::new();
        let mut seed = [0u8; 32];
        rng.fill(&mut seed)
            .map_err(|_| CloudError::Internal("failed to generate random seed".to_string()))?;

        let private_key = PrivateKey::from(Ed25519Keypair::from_seed(&seed));
        let private_pem = private_key
            .to_openssh(LineEnding::LF)
            .map_err(|e| CloudError::Internal(format!("failed to encode private key: {e}")))?;

        let key_pair = self.record(name, private_key.public_key())?;
        self.key_pairs.save(&key_pair).await?;
        info!(name, fingerprint = %key_pair.fingerprint, "Created key pair");
        Ok(GeneratedKeyPair {
            key_pair,
            private_key: private_pem.to_string(),
        })
    }

    /// Register an existing OpenSSH public key.
    #[instrument(skip(self, public_key))]
    pub async fn import_key_pair(&self, name: &str, public_key: &str) -> Result<KeyPair> {
        self.ensure_free(name).await?;
        let parsed = PublicKey::from_openssh(public_key.trim())
            .map_err(|e| CloudError::InvalidArgument(format!("invalid public key: {e}")))?;

        let key_pair = self.record(name, &parsed)?;
        self.key_pairs.save(&key_pair).await?;
        info!(name, fingerprint = %key_pair.fingerprint, "Imported key pair");
        Ok(key_pair)
    }

    /// Idempotent: deleting an unknown name succeeds.
    pub async fn delete_key_pair(&self, name: &str) -> Result<()> {
        if self.key_pairs.soft_delete(name).await? {
            info!(name, "Deleted key pair");
        }
        Ok(())
    }

    pub async fn get_key_pair(&self, name: &str) -> Result<KeyPair> {
        self.key_pairs.get(name).await
    }

    pub async fn describe_key_pairs(&self, filters: &[Filter]) -> Result<Vec<KeyPair>> {
        self.key_pairs.list(filters).await
    }

    async fn ensure_free(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(CloudError::InvalidArgument("key pair name is required".to_string()));
        }
        if self.key_pairs.find(name).await?.is_some() {
            return Err(CloudError::InvalidState(format!(
                "key pair {name} already exists"
            )));
        }
        Ok(())
    }

    fn record(&self, name: &str, public_key: &PublicKey) -> Result<KeyPair> {
        let encoded = public_key
            .to_openssh()
            .map_err(|e| CloudError::Internal(format!("failed to encode public key: {e}")))?;
        Ok(KeyPair {
            id: new_id(id_prefix::KEY_PAIR),
            name: name.to_string(),
            fingerprint: fingerprint(public_key)?,
            public_key: encoded,
            created_at: Utc::now(),
        })
    }
}

/// OpenSSH-style `SHA256:` fingerprint of the public key blob.
pub fn fingerprint(public_key: &PublicKey) -> Result<String> {
    let blob = public_key
        .to_bytes()
        .map_err(|e| CloudError::Internal(format!("failed to encode public key: {e}")))?;
    Ok(format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(&blob))))
}
