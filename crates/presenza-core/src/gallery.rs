//! In-memory gallery of enrolled identities with snapshot semantics.
//!
//! Lookups clone an `Arc` of the current index and run against that snapshot,
//! so a concurrent enrollment is observed either fully or not at all — never
//! as a half-updated identity. The gallery is rebuilt from the persistent
//! identity store at startup.

use crate::types::{Embedding, IdentityId};
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Two distances within this epsilon are considered a tie; the identity
/// enrolled first wins.
const DISTANCE_EPSILON: f32 = 1e-6;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("identity {0} is already enrolled")]
    DuplicateIdentity(IdentityId),
    #[error("enrollment requires at least one reference embedding")]
    NoEmbeddings,
}

/// An enrolled identity and its reference embeddings, one per enrolled photo.
#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub id: IdentityId,
    pub name: String,
    pub embeddings: Vec<Embedding>,
}

/// A successful gallery lookup.
#[derive(Debug, Clone)]
pub struct GalleryMatch {
    pub id: IdentityId,
    pub name: String,
    /// Cosine distance of the closest reference embedding.
    pub distance: f32,
}

/// Read-mostly index of enrolled identities.
pub struct Gallery {
    /// Records in enrollment order; the ordering is what makes the
    /// equidistant tie-break deterministic.
    snapshot: RwLock<Arc<Vec<IdentityRecord>>>,
}

impl Default for Gallery {
    fn default() -> Self {
        Self::new()
    }
}

impl Gallery {
    pub fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Replace the whole index, e.g. from persistent records at startup.
    pub fn rebuild(&self, records: Vec<IdentityRecord>) {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(records);
    }

    /// Add an identity. Rejects duplicate IDs and empty embedding sets.
    pub fn enroll(
        &self,
        id: IdentityId,
        name: &str,
        embeddings: Vec<Embedding>,
    ) -> Result<(), GalleryError> {
        if embeddings.is_empty() {
            return Err(GalleryError::NoEmbeddings);
        }
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if guard.iter().any(|r| r.id == id) {
            return Err(GalleryError::DuplicateIdentity(id));
        }
        let mut next: Vec<IdentityRecord> = guard.as_ref().clone();
        next.push(IdentityRecord {
            id,
            name: name.to_string(),
            embeddings,
        });
        *guard = Arc::new(next);
        tracing::info!(identity = %id, name, "identity enrolled in gallery");
        Ok(())
    }

    /// Remove an identity; returns whether it was present.
    pub fn remove(&self, id: IdentityId) -> bool {
        let mut guard = self.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<IdentityRecord> =
            guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::new(next);
        true
    }

    /// Find the globally closest reference embedding across all identities.
    ///
    /// Accepted only when the distance is within `threshold`. Equidistant
    /// candidates (within epsilon) resolve to the earlier-enrolled identity.
    pub fn lookup(&self, probe: &Embedding, threshold: f32) -> Option<GalleryMatch> {
        let snapshot = {
            let guard = self.snapshot.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };

        let mut best: Option<(usize, f32)> = None;
        for (idx, record) in snapshot.iter().enumerate() {
            for reference in &record.embeddings {
                let distance = probe.cosine_distance(reference);
                let improves = match best {
                    None => true,
                    // Strict improvement required, so ties keep the
                    // earlier-enrolled identity.
                    Some((_, best_distance)) => distance < best_distance - DISTANCE_EPSILON,
                };
                if improves {
                    best = Some((idx, distance));
                }
            }
        }

        match best {
            Some((idx, distance)) if distance <= threshold => Some(GalleryMatch {
                id: snapshot[idx].id,
                name: snapshot[idx].name.clone(),
                distance,
            }),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
