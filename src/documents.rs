use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::ReservationId;

#[derive(Debug)]
pub struct DocumentError(pub String);

impl std::fmt::Display for DocumentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "document store error: {}", self.0)
    }
}

impl std::error::Error for DocumentError {}

/// Port to the external document/contact store. The Merge Operator
/// orchestrates the re-pointing of uploaded documents (ID scans, signed
/// forms) from a retired placeholder to the surviving reservation; storage
/// itself lives elsewhere. Called post-commit — a failure here is logged by
/// the caller and never surfaces as a reconciliation failure.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Re-point every document owned by `from` onto `to`. Returns the number
    /// of documents moved.
    async fn transfer(
        &self,
        from: ReservationId,
        to: ReservationId,
    ) -> Result<usize, DocumentError>;
}

/// For deployments without a document collaborator wired up.
pub struct NullDocumentStore;

#[async_trait]
impl DocumentStore for NullDocumentStore {
    async fn transfer(
        &self,
        _from: ReservationId,
        _to: ReservationId,
    ) -> Result<usize, DocumentError> {
        Ok(0)
    }
}

/// In-memory store used by tests.
#[derive(Default)]
pub struct MemoryDocumentStore {
    owners: DashMap<Ulid, ReservationId>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, document: Ulid, owner: ReservationId) {
        self.owners.insert(document, owner);
    }

    pub fn owner(&self, document: &Ulid) -> Option<ReservationId> {
        self.owners.get(document).map(|e| *e.value())
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn transfer(
        &self,
        from: ReservationId,
        to: ReservationId,
    ) -> Result<usize, DocumentError> {
        let mut moved = 0;
        for mut entry in self.owners.iter_mut() {
            if *entry.value() == from {
                *entry.value_mut() = to;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transfer_repoints_only_matching_documents() {
        let store = MemoryDocumentStore::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let doc1 = Ulid::new();
        let doc2 = Ulid::new();
        store.attach(doc1, a);
        store.attach(doc2, b);

        let moved = store.transfer(a, b).await.unwrap();
        assert_eq!(moved, 1);
        assert_eq!(store.owner(&doc1), Some(b));
        assert_eq!(store.owner(&doc2), Some(b));
    }
}
