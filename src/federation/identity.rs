//! Instance signing identity
//!
//! One RSA keypair per instance domain, loaded from `instance_keys` or
//! generated and persisted on first use. Constructed once by `AppState`
//! and shared by reference.

use std::sync::Arc;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::sync::Mutex;

use crate::data::Database;
use crate::error::AppError;

/// Username of the instance actor used to sign on behalf of remote authors
pub const INSTANCE_ACTOR: &str = "admin";

/// Loaded keypair
pub struct InstanceKeys {
    pub private_key: RsaPrivateKey,
    pub public_key_pem: String,
}

pub struct InstanceIdentity {
    db: Arc<Database>,
    domain: String,
    base_url: String,
    key_bits: usize,
    keys: Mutex<Option<Arc<InstanceKeys>>>,
}

impl InstanceIdentity {
    pub fn new(db: Arc<Database>, domain: &str, base_url: &str, key_bits: usize) -> Self {
        Self {
            db,
            domain: domain.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            key_bits,
            keys: Mutex::new(None),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Load or create the keypair for this domain
    ///
    /// Safe to call from many tasks; generation happens at most once per process.
    pub async fn ensure_keys(&self) -> Result<Arc<InstanceKeys>, AppError> {
        let mut guard = self.keys.lock().await;
        if let Some(keys) = guard.as_ref() {
            return Ok(keys.clone());
        }

        let record = match self.db.get_instance_keys(&self.domain).await? {
            Some(record) => record,
            None => {
                let (public_key_pem, private_key_pem) = generate_keypair(self.key_bits).await?;
                tracing::info!(domain = %self.domain, bits = self.key_bits, "Generated instance keypair");
                self.db
                    .store_instance_keys(&self.domain, &public_key_pem, &private_key_pem)
                    .await?
            }
        };

        let private_key = RsaPrivateKey::from_pkcs8_pem(&record.private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&record.private_key_pem))
            .map_err(|e| AppError::Crypto(format!("stored private key is unreadable: {}", e)))?;

        let keys = Arc::new(InstanceKeys {
            private_key,
            public_key_pem: record.public_key_pem,
        });
        *guard = Some(keys.clone());
        Ok(keys)
    }

    pub async fn public_key_pem(&self) -> Result<String, AppError> {
        Ok(self.ensure_keys().await?.public_key_pem.clone())
    }

    /// Actor URI for a local username
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/ap/users/{}", self.base_url, username)
    }

    pub fn is_local_actor(&self, actor_uri: &str) -> bool {
        actor_uri.starts_with(&format!("{}/ap/users/", self.base_url))
    }

    /// keyId used when signing an activity authored by `actor`
    ///
    /// Local actors sign as themselves; anything else signs as the instance actor.
    pub fn key_id_for(&self, actor: &str) -> String {
        if !actor.is_empty() && self.is_local_actor(actor) {
            format!("{}#main-key", actor)
        } else {
            format!("{}#main-key", self.actor_uri(INSTANCE_ACTOR))
        }
    }

    pub fn shared_inbox_url(&self) -> String {
        format!("{}/ap/shared-inbox", self.base_url)
    }
}

async fn generate_keypair(bits: usize) -> Result<(String, String), AppError> {
    tokio::task::spawn_blocking(move || {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| AppError::Crypto(format!("key generation failed: {}", e)))?;
        let public_key = RsaPublicKey::from(&private_key);

        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Crypto(e.to_string()))?
            .to_string();
        let public_key_pem = public_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Crypto(e.to_string()))?;
        Ok((public_key_pem, private_key_pem))
    })
    .await
    .map_err(|e| AppError::Internal(e.into()))?
}
