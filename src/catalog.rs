use dashmap::DashMap;

use crate::types::StreamId;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub url: String,
    pub active: bool,
}

/// What the manager needs from a stream catalog: a URL lookup by id. Queried
/// once at subscribe time; the core does not watch for URL changes.
pub trait StreamCatalog: Send + Sync {
    fn lookup(&self, stream_id: &StreamId) -> Option<CatalogEntry>;
}

/// In-memory catalog seeded at construction, e.g. from configuration.
pub struct InMemoryCatalog {
    entries: DashMap<StreamId, CatalogEntry>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, stream_id: StreamId, url: impl Into<String>) {
        self.entries.insert(
            stream_id,
            CatalogEntry {
                url: url.into(),
                active: true,
            },
        );
    }

    /// Seeds a disabled entry: present in the catalog but not subscribable.
    pub fn insert_inactive(&self, stream_id: StreamId, url: impl Into<String>) {
        self.entries.insert(
            stream_id,
            CatalogEntry {
                url: url.into(),
                active: false,
            },
        );
    }
}

impl Default for InMemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamCatalog for InMemoryCatalog {
    fn lookup(&self, stream_id: &StreamId) -> Option<CatalogEntry> {
        self.entries.get(stream_id).map(|e| e.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_none_for_unknown_stream() {
        let catalog = InMemoryCatalog::new();
        assert!(catalog.lookup(&StreamId::from("missing")).is_none());
    }

    #[test]
    fn returns_seeded_entry() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(StreamId::from("a"), "rtsp://x/s");
        let entry = catalog.lookup(&StreamId::from("a")).unwrap();
        assert_eq!(entry.url, "rtsp://x/s");
        assert!(entry.active);
    }

    #[test]
    fn insert_inactive_is_reflected_on_lookup() {
        let catalog = InMemoryCatalog::new();
        catalog.insert_inactive(StreamId::from("a"), "rtsp://x/s");
        let entry = catalog.lookup(&StreamId::from("a")).unwrap();
        assert!(!entry.active);
    }
}
