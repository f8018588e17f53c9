//! KBC Storage - Relational storage backends
//!
//! Implements the storage collaborator consumed by the stage executor:
//! - `MemoryStore`: relations held in memory (tests, embedding)
//! - `JsonlStore`: one JSON-lines file per relation in a data directory
//!
//! Both stores understand a bare relation name and the scan form
//! `SELECT * FROM <relation>`; any other query text is rejected.

use std::sync::Arc;

use kbc_core::{QuerySpec, Result, StorageBackend, StorageConfig, StorageKind};

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;

/// Relation scanned by a query, if the query is a plain scan
pub fn scan_target(query: &QuerySpec) -> Option<&str> {
    match query {
        QuerySpec::Relation(name) => Some(name),
        QuerySpec::Text(text) => {
            let text = text.trim().trim_end_matches(';').trim();
            let mut words = text.split_whitespace();
            let is_scan = words.next()?.eq_ignore_ascii_case("select")
                && words.next()? == "*"
                && words.next()?.eq_ignore_ascii_case("from");
            let relation = words.next()?;
            (is_scan && words.next().is_none()).then_some(relation)
        }
    }
}

/// Open the storage backend selected by configuration
pub async fn open_storage(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.kind {
        StorageKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageKind::Jsonl => Ok(Arc::new(JsonlStore::open(&config.path).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_target() {
        assert_eq!(scan_target(&QuerySpec::parse("sentences")), Some("sentences"));
        assert_eq!(
            scan_target(&QuerySpec::parse("select * from people_mentions;")),
            Some("people_mentions")
        );
        assert_eq!(
            scan_target(&QuerySpec::parse("SELECT * FROM a JOIN b ON a.id = b.id")),
            None
        );
        assert_eq!(scan_target(&QuerySpec::parse("SELECT id FROM a")), None);
    }
}
