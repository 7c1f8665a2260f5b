//! # AEGIS Crypto Identity Service
//!
//! Per-agent cryptographic identity for the incident-response platform.
//! Every message that participates in consensus or lands in the audit log is
//! signed by its producer; this module owns the keys and the verification
//! rules the rest of the system relies on:
//!
//! - **Ed25519 keypairs** generated on registration, held only inside this
//!   process. Private key material is never serialized.
//! - **Append-only rotation**: a new key supersedes the old one, and a
//!   message is valid under the key that was active at its timestamp.
//! - **Revocation**: verification fails permanently for revoked identities.
//! - **Impersonation tracking**: repeated signature failures against a
//!   claimed identity increment a suspicion counter consumed by the
//!   reputation layer.
//!
//! Verification is stateless and safe to call from any task concurrently.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors surfaced by identity operations.
///
/// Verification deliberately does not error: a bad signature from a claimed
/// identity is an expected adversarial outcome, reported as `false` and a
/// suspicion increment rather than a propagated failure.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("unknown identity: {0}")]
    Unknown(String),

    #[error("identity already registered: {0}")]
    AlreadyRegistered(String),

    #[error("identity revoked: {0}")]
    Revoked(String),
}

/// One key generation in an identity's append-only key history.
struct KeyEpoch {
    active_from: DateTime<Utc>,
    signing: SigningKey,
    verifying: VerifyingKey,
}

/// Full key history for a single agent identity, newest epoch last.
struct KeyChain {
    epochs: Vec<KeyEpoch>,
}

impl KeyChain {
    fn current(&self) -> &KeyEpoch {
        self.epochs.last().expect("keychain always holds at least one epoch")
    }

    /// The epoch that was active at `at`. Messages predating the first
    /// epoch verify against it, so clock skew at registration is tolerated.
    fn epoch_at(&self, at: DateTime<Utc>) -> &KeyEpoch {
        self.epochs
            .iter()
            .rev()
            .find(|e| e.active_from <= at)
            .unwrap_or_else(|| &self.epochs[0])
    }
}

/// Central identity registry: key issuance, signing, verification,
/// revocation, and impersonation-suspicion bookkeeping.
pub struct IdentityService {
    keys: DashMap<String, KeyChain>,
    revoked: RwLock<HashSet<String>>,
    suspicion: DashMap<String, u32>,
}

impl IdentityService {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            revoked: RwLock::new(HashSet::new()),
            suspicion: DashMap::new(),
        }
    }

    /// Generate a fresh Ed25519 keypair for a new identity and return the
    /// public half. Fails if the identity already exists; use [`rotate`]
    /// to supersede an existing key.
    ///
    /// [`rotate`]: IdentityService::rotate
    pub fn register(&self, agent_id: &str) -> Result<VerifyingKey, IdentityError> {
        if self.keys.contains_key(agent_id) {
            return Err(IdentityError::AlreadyRegistered(agent_id.to_string()));
        }

        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();

        self.keys.insert(
            agent_id.to_string(),
            KeyChain {
                epochs: vec![KeyEpoch {
                    active_from: Utc::now(),
                    signing,
                    verifying,
                }],
            },
        );

        info!(agent = agent_id, "registered identity");
        Ok(verifying)
    }

    /// Append a new key epoch for an identity. The old key remains valid
    /// for messages timestamped before the rotation instant.
    pub fn rotate(&self, agent_id: &str) -> Result<VerifyingKey, IdentityError> {
        let mut chain = self
            .keys
            .get_mut(agent_id)
            .ok_or_else(|| IdentityError::Unknown(agent_id.to_string()))?;

        let signing = SigningKey::generate(&mut OsRng);
        let verifying = signing.verifying_key();
        chain.epochs.push(KeyEpoch {
            active_from: Utc::now(),
            signing,
            verifying,
        });

        info!(agent = agent_id, epochs = chain.epochs.len(), "rotated identity key");
        Ok(verifying)
    }

    /// Current public key for an identity, if registered.
    pub fn public_key(&self, agent_id: &str) -> Option<VerifyingKey> {
        self.keys.get(agent_id).map(|c| c.current().verifying)
    }

    /// Current public key, hex-encoded, for registries and audit records.
    pub fn public_key_hex(&self, agent_id: &str) -> Option<String> {
        self.public_key(agent_id).map(|k| hex::encode(k.to_bytes()))
    }

    /// Sign `bytes` with the identity's current key; returns the signature
    /// hex-encoded for embedding in messages and event records.
    pub fn sign(&self, agent_id: &str, bytes: &[u8]) -> Result<String, IdentityError> {
        if self.is_revoked(agent_id) {
            return Err(IdentityError::Revoked(agent_id.to_string()));
        }
        let chain = self
            .keys
            .get(agent_id)
            .ok_or_else(|| IdentityError::Unknown(agent_id.to_string()))?;

        let sig: Signature = chain.current().signing.sign(bytes);
        Ok(hex::encode(sig.to_bytes()))
    }

    /// Verify a hex-encoded signature over `bytes`, claimed by `agent_id`,
    /// against the key that was active at `at`.
    ///
    /// Returns `false` for unknown identities, revoked identities, malformed
    /// signatures, and signature mismatches alike; callers that need to
    /// escalate repeated failures use [`record_forgery`].
    ///
    /// [`record_forgery`]: IdentityService::record_forgery
    pub fn verify(&self, agent_id: &str, bytes: &[u8], sig_hex: &str, at: DateTime<Utc>) -> bool {
        if self.is_revoked(agent_id) {
            debug!(agent = agent_id, "verification refused: identity revoked");
            return false;
        }
        let Some(chain) = self.keys.get(agent_id) else {
            return false;
        };

        let Ok(raw) = hex::decode(sig_hex) else {
            return false;
        };
        let raw: [u8; 64] = match raw.try_into() {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let sig = Signature::from_bytes(&raw);

        chain.epoch_at(at).verifying.verify(bytes, &sig).is_ok()
    }

    /// Revoke an identity. Signing and verification fail from this point on;
    /// revocation is permanent.
    pub fn revoke(&self, agent_id: &str) {
        warn!(agent = agent_id, "revoking identity");
        self.revoked.write().insert(agent_id.to_string());
    }

    pub fn is_revoked(&self, agent_id: &str) -> bool {
        self.revoked.read().contains(agent_id)
    }

    /// Record a signature failure against a claimed identity and return the
    /// updated suspicion count. Fed into reputation by the agent registry.
    pub fn record_forgery(&self, claimed_id: &str) -> u32 {
        let mut entry = self.suspicion.entry(claimed_id.to_string()).or_insert(0);
        *entry += 1;
        warn!(agent = claimed_id, count = *entry, "signature failure against claimed identity");
        *entry
    }

    /// Current suspicion count for an identity.
    pub fn suspicion(&self, agent_id: &str) -> u32 {
        self.suspicion.get(agent_id).map(|c| *c).unwrap_or(0)
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn sign_and_verify_roundtrip() {
        let ids = IdentityService::new();
        ids.register("detection-0").unwrap();

        let sig = ids.sign("detection-0", b"payload").unwrap();
        assert!(ids.verify("detection-0", b"payload", &sig, Utc::now()));
        assert!(!ids.verify("detection-0", b"tampered", &sig, Utc::now()));
    }

    #[test]
    fn unknown_identity_rejected() {
        let ids = IdentityService::new();
        assert!(matches!(ids.sign("ghost", b"x"), Err(IdentityError::Unknown(_))));
        assert!(!ids.verify("ghost", b"x", "00", Utc::now()));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let ids = IdentityService::new();
        ids.register("diagnosis-0").unwrap();
        assert!(matches!(
            ids.register("diagnosis-0"),
            Err(IdentityError::AlreadyRegistered(_))
        ));
    }

    #[test]
    fn revoked_identity_fails_sign_and_verify() {
        let ids = IdentityService::new();
        ids.register("resolution-0").unwrap();
        let sig = ids.sign("resolution-0", b"plan").unwrap();

        ids.revoke("resolution-0");
        assert!(matches!(ids.sign("resolution-0", b"plan"), Err(IdentityError::Revoked(_))));
        assert!(!ids.verify("resolution-0", b"plan", &sig, Utc::now()));
    }

    #[test]
    fn rotation_keeps_old_messages_valid() {
        let ids = IdentityService::new();
        ids.register("prediction-0").unwrap();

        let signed_at = Utc::now();
        let old_sig = ids.sign("prediction-0", b"forecast").unwrap();

        // Force the new epoch to begin measurably after the old signature.
        {
            let mut chain = ids.keys.get_mut("prediction-0").unwrap();
            let signing = SigningKey::generate(&mut OsRng);
            let verifying = signing.verifying_key();
            chain.epochs.push(KeyEpoch {
                active_from: signed_at + Duration::seconds(10),
                signing,
                verifying,
            });
        }

        // Old signature still verifies at its original timestamp but not
        // under the key active after rotation.
        assert!(ids.verify("prediction-0", b"forecast", &old_sig, signed_at));
        assert!(!ids.verify(
            "prediction-0",
            b"forecast",
            &old_sig,
            signed_at + Duration::seconds(20)
        ));

        // New signatures verify under the current epoch.
        let new_sig = ids.sign("prediction-0", b"forecast").unwrap();
        assert!(ids.verify(
            "prediction-0",
            b"forecast",
            &new_sig,
            signed_at + Duration::seconds(20)
        ));
    }

    #[test]
    fn forgery_counter_accumulates() {
        let ids = IdentityService::new();
        ids.register("communication-0").unwrap();

        assert_eq!(ids.suspicion("communication-0"), 0);
        assert_eq!(ids.record_forgery("communication-0"), 1);
        assert_eq!(ids.record_forgery("communication-0"), 2);
        assert_eq!(ids.suspicion("communication-0"), 2);
    }
}
