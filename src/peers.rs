//! Peer Registry & Policy Engine (spec §4.2).
//!
//! The registry is an in-memory map from normalized pubkey to liveness
//! status, plus a persistent per-user policy table read through `Database`.
//! `PingTransport` is the seam the signer supervisor plugs into so this
//! module never has to import `crate::signer` (spec §9, breaking the
//! supervisor/registry/event-bus cycle with capability traits).

use crate::db::Database;
use crate::pubkey;
use crate::types::{EffectivePolicy, PeerStatus, PeerView, PolicyDefaults};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("policy denied: {direction} to {peer}")]
    Denied { direction: &'static str, peer: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PingError {
    #[error("ping timed out")]
    Timeout,
    #[error("signer node unavailable: {0}")]
    Unavailable(String),
}

/// Capability the supervisor exposes so the registry can dispatch pings
/// without depending on `crate::signer` directly.
#[async_trait]
pub trait PingTransport: Send + Sync {
    async fn ping(&self, pubkey: &str, timeout: Duration) -> Result<Option<u64>, PingError>;
}

#[derive(Clone)]
pub struct PeerRegistry {
    db: Database,
    status: Arc<RwLock<HashMap<String, PeerStatus>>>,
}

impl PeerRegistry {
    pub fn new(db: Database) -> Self {
        Self { db, status: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Accepts a status update only when `raw_pubkey` normalizes cleanly
    /// (spec §4.2 invariant: keys are always normalized).
    pub fn observe_ping(&self, raw_pubkey: &str, latency_ms: Option<u64>) -> Option<String> {
        let normalized = pubkey::normalize(raw_pubkey)?;
        let mut status = self.status.write();
        let entry = status.entry(normalized.clone()).or_insert_with(|| PeerStatus::unknown(&normalized));
        entry.online = true;
        entry.last_seen = Some(Utc::now());
        if latency_ms.is_some() {
            entry.latency_ms = latency_ms;
        }
        Some(normalized)
    }

    fn record_ping_attempt(&self, normalized: &str) {
        let mut status = self.status.write();
        let entry = status.entry(normalized.to_string()).or_insert_with(|| PeerStatus::unknown(normalized));
        entry.last_ping_attempt = Some(Utc::now());
    }

    pub fn status_of(&self, raw_pubkey: &str) -> Option<PeerStatus> {
        let normalized = pubkey::normalize(raw_pubkey)?;
        self.status.read().get(&normalized).cloned()
    }

    pub fn all_statuses(&self) -> Vec<PeerStatus> {
        self.status.read().values().cloned().collect()
    }

    pub fn known_pubkeys(&self) -> Vec<String> {
        self.status.read().keys().cloned().collect()
    }

    /// Dispatches a ping to one peer or, for `target == "all"`, to every
    /// known peer. A timeout only records the attempt timestamp — a single
    /// miss never flips `online` to false (spec §4.2 `ping`).
    pub async fn ping(&self, target: &str, transport: &dyn PingTransport, timeout: Duration) -> Vec<PeerStatus> {
        let targets: Vec<String> = if target.eq_ignore_ascii_case("all") {
            self.known_pubkeys()
        } else {
            pubkey::normalize(target).into_iter().collect()
        };

        let mut results = Vec::with_capacity(targets.len());
        for normalized in targets {
            self.record_ping_attempt(&normalized);
            match transport.ping(&normalized, timeout).await {
                Ok(latency) => {
                    self.observe_ping(&normalized, latency);
                }
                Err(_) => {
                    // miss recorded above via record_ping_attempt; online unchanged
                }
            }
            if let Some(status) = self.status_of(&normalized) {
                results.push(status);
            }
        }
        results
    }

    pub fn get_policy(&self, user_id: &str, raw_pubkey: &str, defaults: PolicyDefaults) -> rusqlite::Result<EffectivePolicy> {
        let normalized = pubkey::normalize(raw_pubkey).unwrap_or_else(|| raw_pubkey.to_string());
        self.db.effective_policy(user_id, &normalized, defaults)
    }

    pub fn set_policy(
        &self,
        user_id: &str,
        raw_pubkey: &str,
        allow_send: Option<bool>,
        allow_receive: Option<bool>,
    ) -> rusqlite::Result<()> {
        let normalized = pubkey::normalize(raw_pubkey).unwrap_or_else(|| raw_pubkey.to_string());
        self.db.set_peer_policy(user_id, &normalized, allow_send, allow_receive)
    }

    pub fn reset_policy(&self, user_id: &str, raw_pubkey: &str) -> rusqlite::Result<()> {
        let normalized = pubkey::normalize(raw_pubkey).unwrap_or_else(|| raw_pubkey.to_string());
        self.db.reset_peer_policy(user_id, &normalized)
    }

    pub fn list_views(&self, user_id: &str, defaults: PolicyDefaults) -> rusqlite::Result<Vec<PeerView>> {
        let mut seen: HashMap<String, PeerStatus> = self.status.read().clone();
        for row in self.db.list_peer_policy_rows(user_id)? {
            seen.entry(row.pubkey.clone()).or_insert_with(|| PeerStatus::unknown(&row.pubkey));
        }

        let mut views = Vec::with_capacity(seen.len());
        for (pubkey, status) in seen {
            let policy = self.db.effective_policy(user_id, &pubkey, defaults)?;
            views.push(PeerView { pubkey, status, policy });
        }
        views.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));
        Ok(views)
    }

    /// Authorization gate the signer fan-out consults before it invokes
    /// `req.sign`/`req.ecdh` against a remote peer, or before responding to
    /// one (spec §4.2 "Authorization gate").
    pub fn authorize(&self, user_id: &str, raw_pubkey: &str, defaults: PolicyDefaults, direction: Direction) -> Result<(), PolicyError> {
        let normalized = pubkey::normalize(raw_pubkey).unwrap_or_else(|| raw_pubkey.to_string());
        let policy = self
            .db
            .effective_policy(user_id, &normalized, defaults)
            .unwrap_or(EffectivePolicy {
                pubkey: normalized.clone(),
                allow_send: None,
                allow_receive: None,
                effective_send: defaults.allow_send,
                effective_receive: defaults.allow_receive,
                has_explicit_policy: false,
                source: None,
                last_updated: None,
            });

        let allowed = match direction {
            Direction::Outbound => policy.effective_send,
            Direction::Inbound => policy.effective_receive,
        };

        if allowed {
            Ok(())
        } else {
            Err(PolicyError::Denied { direction: direction.as_str(), peer: normalized })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "out",
            Self::Inbound => "in",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;

    fn temp_registry() -> (Database, PeerRegistry, String) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("signer.sqlite")).unwrap();
        let user = db.create_user("alice", "hash", &[0u8; 16], Role::Admin).unwrap();
        let registry = PeerRegistry::new(db.clone());
        (db, registry, user.id)
    }

    #[test]
    fn observe_ping_normalizes_compressed_keys() {
        let (_db, registry, _user) = temp_registry();
        let xonly = "ab".repeat(32);
        let compressed = format!("02{xonly}");
        registry.observe_ping(&compressed, Some(42));
        let status = registry.status_of(&xonly).unwrap();
        assert!(status.online);
        assert_eq!(status.latency_ms, Some(42));
    }

    #[test]
    fn s2_policy_gate_denies_outbound_when_disabled() {
        let (_db, registry, user) = temp_registry();
        let peer = "ab".repeat(32);
        registry.set_policy(&user, &peer, Some(false), None).unwrap();

        let err = registry
            .authorize(&user, &peer, PolicyDefaults::default(), Direction::Outbound)
            .unwrap_err();
        match err {
            PolicyError::Denied { direction, peer: p } => {
                assert_eq!(direction, "out");
                assert_eq!(p, peer);
            }
        }
    }

    #[test]
    fn reset_policy_reverts_to_defaults() {
        let (_db, registry, user) = temp_registry();
        let peer = "cd".repeat(32);
        registry.set_policy(&user, &peer, Some(false), Some(false)).unwrap();
        registry.reset_policy(&user, &peer).unwrap();

        let policy = registry.get_policy(&user, &peer, PolicyDefaults::default()).unwrap();
        assert!(!policy.has_explicit_policy);
        assert!(policy.effective_send);
        assert!(policy.effective_receive);
    }
}
