//! Cached content-access payloads, one row per (owner, payload key).
//!
//! The key captures everything that changes a consumer's content view apart
//! from owner content itself: architectures and the ordered environment list.
//! Two requests computing the same key may race; the store keeps the first
//! row and the loser reads it back.

use crate::error::{EntitlementError, Result};
use crate::storage::{CreateOutcome, PayloadStore};
use crate::types::{ContentAccessPayload, Consumer, Environment, EnvironmentId, Owner};
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Hash input for a payload key. Arches are lowercased, deduplicated and
/// sorted; environment ids keep their priority order.
pub fn payload_key_input<A, E>(arches: A, environment_ids: E) -> String
where
    A: IntoIterator,
    A::Item: AsRef<str>,
    E: IntoIterator,
    E::Item: AsRef<str>,
{
    let arches: BTreeSet<String> = arches
        .into_iter()
        .map(|a| a.as_ref().trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect();
    let environments: Vec<String> = environment_ids
        .into_iter()
        .map(|e| e.as_ref().to_string())
        .collect();

    format!(
        "arches:{}-environments:{}",
        arches.into_iter().collect::<Vec<_>>().join(","),
        environments.join(",")
    )
}

/// `v<version>:<sha256 hex of the key input>`
pub fn payload_key<A, E>(version: u32, arches: A, environment_ids: E) -> String
where
    A: IntoIterator,
    A::Item: AsRef<str>,
    E: IntoIterator,
    E::Item: AsRef<str>,
{
    let digest = Sha256::digest(payload_key_input(arches, environment_ids).as_bytes());
    format!("v{}:{}", version, hex::encode(digest))
}

/// A payload is stale once the owner's content, or any of the environments,
/// changed at or after the moment it was built.
pub fn is_stale(payload: &ContentAccessPayload, owner: &Owner, environments: &[Environment]) -> bool {
    owner.last_content_update >= payload.timestamp
        || environments
            .iter()
            .any(|env| env.last_content_update > payload.timestamp)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub regenerations: u64,
    pub conflicts: u64,
}

pub struct ContentAccessPayloadCache {
    store: Arc<dyn PayloadStore>,
    key_version: u32,
    hits: AtomicU64,
    misses: AtomicU64,
    regenerations: AtomicU64,
    conflicts: AtomicU64,
}

impl ContentAccessPayloadCache {
    pub fn new(store: Arc<dyn PayloadStore>, key_version: u32) -> Self {
        Self {
            store,
            key_version,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            regenerations: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn key_for(&self, consumer: &Consumer, environment_ids: &[EnvironmentId]) -> String {
        payload_key(self.key_version, consumer.all_arches(), environment_ids)
    }

    pub fn get(&self, owner_id: &str, payload_key: &str) -> Result<Option<ContentAccessPayload>> {
        self.store.get_payload(owner_id, payload_key)
    }

    /// Return the current payload for `payload_key`, building it with
    /// `generate` when missing or stale.
    pub fn get_or_create<F>(
        &self,
        owner: &Owner,
        payload_key: &str,
        environments: &[Environment],
        generate: F,
    ) -> Result<ContentAccessPayload>
    where
        F: FnOnce() -> Result<String>,
    {
        let existing = self.store.get_payload(&owner.id, payload_key)?;
        if let Some(payload) = &existing {
            if !is_stale(payload, owner, environments) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Content access payload hit for {} {}", owner.key, payload_key);
                return Ok(payload.clone());
            }
        }

        let payload = ContentAccessPayload {
            owner_id: owner.id.clone(),
            payload_key: payload_key.to_string(),
            timestamp: Utc::now(),
            payload: generate()?,
        };

        if existing.is_some() {
            self.regenerations.fetch_add(1, Ordering::Relaxed);
            info!("Regenerated stale content access payload {} for owner {}", payload_key, owner.key);
            self.store.replace(payload.clone())?;
            return Ok(payload);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.store.try_create_unique(payload)? {
            CreateOutcome::Created(created) => {
                debug!("Created content access payload {} for owner {}", payload_key, owner.key);
                Ok(created)
            }
            CreateOutcome::AlreadyExists => {
                self.conflicts.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Content access payload {} for owner {} created concurrently, reading it back",
                    payload_key, owner.key
                );
                self.store
                    .get_payload(&owner.id, payload_key)?
                    .ok_or_else(|| EntitlementError::ConcurrentCreationConflict {
                        key: payload_key.to_string(),
                    })
            }
        }
    }

    pub fn stats(&self) -> PayloadCacheStats {
        PayloadCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            regenerations: self.regenerations.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}
