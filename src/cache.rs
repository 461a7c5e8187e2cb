use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::Result;
use crate::schema::UIComponent;

/// Documents kept by `DocumentCache::new`.
pub const DEFAULT_CAPACITY: usize = 256;

/// Parsed documents keyed by the SHA-256 of their source, so a document is
/// deserialized once and interpreted many times.
///
/// The cache holds at most `capacity` documents. Entries are kept in
/// recency order; inserting past capacity evicts the least recently used.
#[derive(Debug)]
pub struct DocumentCache {
    capacity: usize,
    documents: Mutex<IndexMap<String, Arc<UIComponent>>>,
}

impl Default for DocumentCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            documents: Mutex::new(IndexMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn compute_hash(source: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn lock(&self) -> MutexGuard<'_, IndexMap<String, Arc<UIComponent>>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached tree for `source`, marking it most recently used.
    pub fn get(&self, source: &str) -> Option<Arc<UIComponent>> {
        let hash = Self::compute_hash(source);
        touch(&mut self.lock(), &hash)
    }

    /// Parse `source`, or return the cached tree for identical source.
    /// Parse failures are not cached.
    pub fn parse(&self, source: &str) -> Result<Arc<UIComponent>> {
        let hash = Self::compute_hash(source);
        if let Some(document) = touch(&mut self.lock(), &hash) {
            return Ok(document);
        }

        // parsed outside the lock; a concurrent parse of the same source
        // just replaces an identical tree
        let document = Arc::new(UIComponent::from_json(source)?);
        let mut documents = self.lock();
        documents.shift_remove(&hash);
        while documents.len() >= self.capacity {
            if let Some((evicted, _)) = documents.shift_remove_index(0) {
                tracing::trace!(hash = %&evicted[..12], "evicted cached document");
            }
        }
        tracing::debug!(hash = %&hash[..12], "cached parsed document");
        documents.insert(hash, document.clone());
        Ok(document)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Move `hash` to the most recent end and return its document.
fn touch(documents: &mut IndexMap<String, Arc<UIComponent>>, hash: &str) -> Option<Arc<UIComponent>> {
    let index = documents.get_index_of(hash)?;
    let last = documents.len() - 1;
    documents.move_index(index, last);
    documents.get_index(last).map(|(_, document)| document.clone())
}
