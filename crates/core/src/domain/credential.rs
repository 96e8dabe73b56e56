use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::envelope::KeyBundle;
use crate::registry::ServiceKind;

pub const ENVELOPE_ALGORITHM: &str = "AES-256-GCM";
pub const ENVELOPE_KDF: &str = "PBKDF2-HMAC-SHA256";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialId(pub String);

impl CredentialId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

/// Lifecycle of one credential row. `Expired` and `Revoked` are terminal;
/// a fresh submit creates a new row, it never resurrects an old one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    Expired,
    Revoked,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(Self::Active),
            "expired" => Some(Self::Expired),
            "revoked" => Some(Self::Revoked),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Only active rows move, and only into a terminal status.
    pub fn can_transition_to(&self, next: CredentialStatus) -> bool {
        !self.is_terminal() && next.is_terminal()
    }
}

/// One encrypted credential row: the persisted shape of a deposited API
/// key, one row per (user, service) lineage. Plaintext never appears here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    pub user_id: String,
    pub service: ServiceKind,
    pub service_name: String,
    pub ciphertext: String,
    pub salt: String,
    pub iv: String,
    pub auth_tag: String,
    pub integrity_hash: String,
    pub algorithm: String,
    pub kdf: String,
    pub iterations: u32,
    pub fingerprint: String,
    pub status: CredentialStatus,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
}

impl Credential {
    /// Builds a fresh active row around an encrypted bundle.
    pub fn issue(
        user_id: &str,
        service: ServiceKind,
        service_name: &str,
        bundle: KeyBundle,
        iterations: u32,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: CredentialId::generate(),
            user_id: user_id.to_string(),
            service,
            service_name: service_name.to_string(),
            ciphertext: bundle.ciphertext,
            salt: bundle.salt,
            iv: bundle.iv,
            auth_tag: bundle.auth_tag,
            integrity_hash: bundle.integrity_hash,
            algorithm: ENVELOPE_ALGORITHM.to_string(),
            kdf: ENVELOPE_KDF.to_string(),
            iterations,
            fingerprint: fingerprint(user_id, service, created_at),
            status: CredentialStatus::Active,
            expires_at,
            created_at,
            updated_at: created_at,
            last_used_at: None,
            usage_count: 0,
        }
    }

    pub fn bundle(&self) -> KeyBundle {
        KeyBundle {
            ciphertext: self.ciphertext.clone(),
            salt: self.salt.clone(),
            iv: self.iv.clone(),
            auth_tag: self.auth_tag.clone(),
            integrity_hash: self.integrity_hash.clone(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Non-secret identifier for a credential lineage, used for indexing and
/// audit. Derived from public fields only.
pub fn fingerprint(user_id: &str, service: ServiceKind, created_at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(
        format!("{user_id}:{}:{}", service.as_str(), created_at.to_rfc3339()).as_bytes(),
    );
    hex::encode(digest)[..32].to_string()
}
