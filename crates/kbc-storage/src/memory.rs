//! In-memory relational store
//!
//! Queries return a snapshot taken when the query is issued. Writes are
//! staged per transaction and swapped in under the write lock on commit.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;

use kbc_core::{
    AppendTransaction, KbcError, QuerySpec, Record, RecordStream, Result, StorageBackend,
    WriteMode,
};

use crate::scan_target;

/// Relation name -> rows
pub type Tables = HashMap<String, Vec<Record>>;

/// Named query evaluated against the current tables
pub type QueryFn = dyn Fn(&Tables) -> Vec<Record> + Send + Sync;

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    queries: RwLock<HashMap<String, Arc<QueryFn>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents of a relation
    pub async fn insert_relation(&self, relation: impl Into<String>, records: Vec<Record>) {
        self.tables.write().await.insert(relation.into(), records);
    }

    /// Register the evaluation of a query text the scan form cannot express
    pub async fn define_query<F>(&self, text: impl Into<String>, query: F)
    where
        F: Fn(&Tables) -> Vec<Record> + Send + Sync + 'static,
    {
        self.queries
            .write()
            .await
            .insert(text.into().trim().to_string(), Arc::new(query));
    }

    /// Current contents of a relation
    pub async fn relation(&self, relation: &str) -> Option<Vec<Record>> {
        self.tables.read().await.get(relation).cloned()
    }

    /// Copy of every relation
    pub async fn snapshot(&self) -> Tables {
        self.tables.read().await.clone()
    }

    /// Restore a previous snapshot
    pub async fn restore(&self, tables: Tables) {
        *self.tables.write().await = tables;
    }

    /// Drop all relations (named queries are kept)
    pub async fn reset(&self) {
        self.tables.write().await.clear();
    }
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn query(&self, query: &QuerySpec) -> Result<RecordStream> {
        let named = self.queries.read().await.get(query.as_text().trim()).cloned();

        let rows = if let Some(evaluate) = named {
            let tables = self.tables.read().await;
            evaluate(&tables)
        } else {
            let relation = scan_target(query).ok_or_else(|| {
                KbcError::storage(format!("memory store cannot evaluate query `{query}`"))
            })?;
            self.tables
                .read()
                .await
                .get(relation)
                .cloned()
                .ok_or_else(|| KbcError::storage(format!("relation `{relation}` does not exist")))?
        };

        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    async fn begin_append(
        &self,
        relation: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn AppendTransaction>> {
        Ok(Box::new(MemoryTransaction {
            tables: Arc::clone(&self.tables),
            relation: relation.to_string(),
            mode,
            staged: Vec::new(),
        }))
    }

    async fn relation_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

struct MemoryTransaction {
    tables: Arc<RwLock<Tables>>,
    relation: String,
    mode: WriteMode,
    staged: Vec<Record>,
}

#[async_trait]
impl AppendTransaction for MemoryTransaction {
    async fn write(&mut self, records: Vec<Record>) -> Result<()> {
        self.staged.extend(records);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<u64> {
        let MemoryTransaction {
            tables,
            relation,
            mode,
            staged,
        } = *self;
        let count = staged.len() as u64;

        let mut tables = tables.write().await;
        match mode {
            WriteMode::Replace => {
                tables.insert(relation, staged);
            }
            WriteMode::Append => {
                tables.entry(relation).or_default().extend(staged);
            }
        }
        Ok(count)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        tracing::debug!(
            "Discarding {} staged records for `{}`",
            self.staged.len(),
            self.relation
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn row(id: i64) -> Record {
        Record::new().with_field("id", id)
    }

    async fn collect(store: &MemoryStore, query: &str) -> Result<Vec<Record>> {
        store.query(&QuerySpec::parse(query)).await?.try_collect().await
    }

    #[tokio::test]
    async fn test_scan_relation() {
        let store = MemoryStore::new();
        store.insert_relation("r", vec![row(1), row(2)]).await;

        assert_eq!(collect(&store, "r").await.unwrap().len(), 2);
        assert_eq!(collect(&store, "SELECT * FROM r").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_relation_and_query() {
        let store = MemoryStore::new();
        assert!(matches!(
            collect(&store, "missing").await,
            Err(KbcError::StorageError(_))
        ));
        assert!(matches!(
            collect(&store, "SELECT id FROM r WHERE id > 1").await,
            Err(KbcError::StorageError(_))
        ));
    }

    #[tokio::test]
    async fn test_named_query() {
        let store = MemoryStore::new();
        store.insert_relation("r", vec![row(1), row(2), row(3)]).await;
        store
            .define_query("SELECT id FROM r WHERE id > 1", |tables| {
                tables["r"]
                    .iter()
                    .filter(|r| r.get("id").and_then(|v| v.as_i64()) > Some(1))
                    .cloned()
                    .collect()
            })
            .await;

        let rows = collect(&store, "SELECT id FROM r WHERE id > 1").await.unwrap();
        assert_eq!(rows, vec![row(2), row(3)]);
    }

    #[tokio::test]
    async fn test_output_invisible_until_commit() {
        let store = MemoryStore::new();
        let mut tx = store.begin_append("out", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(1)]).await.unwrap();

        assert!(store.relation("out").await.is_none());
        assert_eq!(tx.commit().await.unwrap(), 1);
        assert_eq!(store.relation("out").await.unwrap(), vec![row(1)]);
    }

    #[tokio::test]
    async fn test_abort_discards() {
        let store = MemoryStore::new();
        store.insert_relation("out", vec![row(1)]).await;

        let mut tx = store.begin_append("out", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(7), row(8)]).await.unwrap();
        tx.abort().await.unwrap();

        assert_eq!(store.relation("out").await.unwrap(), vec![row(1)]);
    }

    #[tokio::test]
    async fn test_replace_vs_append() {
        let store = MemoryStore::new();
        store.insert_relation("out", vec![row(1)]).await;

        store.append_records("out", vec![row(2)]).await.unwrap();
        assert_eq!(store.relation("out").await.unwrap().len(), 2);

        let mut tx = store.begin_append("out", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(3)]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.relation("out").await.unwrap(), vec![row(3)]);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let store = MemoryStore::new();
        store.insert_relation("a", vec![row(1)]).await;
        let snapshot = store.snapshot().await;

        store.insert_relation("b", vec![row(2)]).await;
        assert_eq!(store.relation_names().await.unwrap(), vec!["a", "b"]);

        store.restore(snapshot).await;
        assert_eq!(store.relation_names().await.unwrap(), vec!["a"]);

        store.reset().await;
        assert!(store.relation_names().await.unwrap().is_empty());
    }
}
