// Enrolled identities known to the presence detector

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::embedding::embedding_distance;

/// A person who should not trigger recordings. Immutable once enrolled.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledIdentity {
    id: i64,
    name: String,
    embedding: Arc<[f32]>,
}

impl EnrolledIdentity {
    pub fn new(id: i64, name: impl Into<String>, embedding: Vec<f32>) -> Self {
        Self {
            id,
            name: name.into(),
            embedding: embedding.into(),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn embedding(&self) -> &[f32] {
        &self.embedding
    }
}

/// Closest enrolled identity for a face
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityMatch {
    pub id: i64,
    pub name: String,
    pub distance: f32,
}

/// The set of enrolled identities, shared by every detection worker
///
/// Entries are only ever added or removed whole.
#[derive(Default)]
pub struct IdentitySet {
    entries: RwLock<Vec<Arc<EnrolledIdentity>>>,
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_identities(identities: impl IntoIterator<Item = EnrolledIdentity>) -> Self {
        let set = Self::new();
        for identity in identities {
            set.enroll(identity);
        }
        set
    }

    /// Add an identity. Returns false if one with the same id is already enrolled.
    pub fn enroll(&self, identity: EnrolledIdentity) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.id == identity.id) {
            return false;
        }
        log::info!("[Detector] Enrolled identity {} ({})", identity.name, identity.id);
        entries.push(Arc::new(identity));
        true
    }

    pub fn revoke(&self, id: i64) -> Option<Arc<EnrolledIdentity>> {
        let mut entries = self.entries.write();
        let position = entries.iter().position(|e| e.id == id)?;
        let removed = entries.remove(position);
        log::info!("[Detector] Revoked identity {} ({})", removed.name, removed.id);
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn list(&self) -> Vec<Arc<EnrolledIdentity>> {
        self.entries.read().clone()
    }

    /// Identity with the smallest distance to `embedding`, if that distance is below `threshold`
    pub fn best_match(&self, embedding: &[f32], threshold: f32) -> Option<IdentityMatch> {
        let entries = self.entries.read();
        entries
            .iter()
            .map(|e| (e, embedding_distance(e.embedding(), embedding)))
            .filter(|(_, d)| d.is_finite())
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .filter(|(_, d)| *d < threshold)
            .map(|(e, distance)| IdentityMatch {
                id: e.id,
                name: e.name.clone(),
                distance,
            })
    }
}
