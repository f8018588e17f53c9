//! JSON-lines directory store
//!
//! Each relation is `<root>/<relation>.jsonl`, one record per line.
//! A transaction writes to a hidden staging file; commit renames it over
//! the relation (replace) or appends its contents (append).
//!
//! A replace commit is a single rename and is all-or-nothing. An append
//! commit copies the staged file onto the end of the relation; if that copy
//! fails midway, the relation keeps the prefix of the staged lines that was
//! written before the error.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::codec::{FramedRead, LinesCodec};
use uuid::Uuid;

use kbc_core::{
    AppendTransaction, KbcError, QuerySpec, Record, RecordStream, Result, StorageBackend,
    WriteMode,
};

use crate::scan_target;

const EXTENSION: &str = "jsonl";

/// Longest stored line accepted when reading a relation
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Directory-backed store
pub struct JsonlStore {
    root: PathBuf,
}

impl JsonlStore {
    /// Open a data directory, creating it if needed
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await.map_err(|e| {
            KbcError::storage(format!("cannot create data directory {}: {e}", root.display()))
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding a relation
    pub fn relation_path(&self, relation: &str) -> Result<PathBuf> {
        let valid = !relation.is_empty()
            && !relation.starts_with('.')
            && relation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-');
        if !valid {
            return Err(KbcError::storage(format!(
                "invalid relation name `{relation}`"
            )));
        }
        Ok(self.root.join(format!("{relation}.{EXTENSION}")))
    }
}

#[async_trait]
impl StorageBackend for JsonlStore {
    async fn query(&self, query: &QuerySpec) -> Result<RecordStream> {
        let relation = scan_target(query).ok_or_else(|| {
            KbcError::storage(format!("jsonl store cannot evaluate query `{query}`"))
        })?;
        let path = self.relation_path(relation)?;

        let file = File::open(&path).await.map_err(|e| {
            KbcError::storage(format!("relation `{relation}` is not readable: {e}"))
        })?;

        let relation = relation.to_string();
        let lines = FramedRead::new(file, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let records = lines
            .enumerate()
            .filter_map(move |(i, line)| {
                let item = match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => Some(Record::from_line(&line).map_err(|e| {
                        KbcError::record(format!("{relation}.{EXTENSION}:{}: {e}", i + 1))
                    })),
                    Err(e) => Some(Err(KbcError::storage(format!(
                        "reading `{relation}` failed: {e}"
                    )))),
                };
                futures::future::ready(item)
            })
            .boxed();

        Ok(records)
    }

    async fn begin_append(
        &self,
        relation: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn AppendTransaction>> {
        let target = self.relation_path(relation)?;
        let staging = self
            .root
            .join(format!(".{relation}.{}.staging", Uuid::new_v4().simple()));

        let file = File::create(&staging).await.map_err(|e| {
            KbcError::storage(format!("cannot stage output for `{relation}`: {e}"))
        })?;

        Ok(Box::new(JsonlTransaction {
            writer: Some(BufWriter::new(file)),
            staging,
            target,
            mode,
            written: 0,
        }))
    }

    async fn relation_names(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| KbcError::storage(format!("cannot list data directory: {e}")))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KbcError::storage(format!("cannot list data directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if !stem.starts_with('.') {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}

struct JsonlTransaction {
    writer: Option<BufWriter<File>>,
    staging: PathBuf,
    target: PathBuf,
    mode: WriteMode,
    written: u64,
}

impl JsonlTransaction {
    async fn finish_staging(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .await
                .map_err(|e| KbcError::storage(format!("flushing staged output failed: {e}")))?;
            writer
                .into_inner()
                .sync_all()
                .await
                .map_err(|e| KbcError::storage(format!("syncing staged output failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl AppendTransaction for JsonlTransaction {
    async fn write(&mut self, records: Vec<Record>) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| KbcError::storage("transaction already finished"))?;

        let mut buf = String::new();
        for record in &records {
            buf.push_str(&record.to_line()?);
            buf.push('\n');
        }
        writer
            .write_all(buf.as_bytes())
            .await
            .map_err(|e| KbcError::storage(format!("staging output failed: {e}")))?;

        self.written += records.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<u64> {
        self.finish_staging().await?;

        match self.mode {
            WriteMode::Replace => {
                fs::rename(&self.staging, &self.target)
                    .await
                    .map_err(|e| KbcError::storage(format!("committing output failed: {e}")))?;
            }
            WriteMode::Append => {
                let mut staged = File::open(&self.staging).await.map_err(|e| {
                    KbcError::storage(format!("reopening staged output failed: {e}"))
                })?;
                let mut target = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.target)
                    .await
                    .map_err(|e| KbcError::storage(format!("opening relation failed: {e}")))?;
                tokio::io::copy(&mut staged, &mut target)
                    .await
                    .map_err(|e| KbcError::storage(format!("appending output failed: {e}")))?;
                target
                    .sync_all()
                    .await
                    .map_err(|e| KbcError::storage(format!("syncing relation failed: {e}")))?;
                let _ = fs::remove_file(&self.staging).await;
            }
        }

        Ok(self.written)
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.writer.take();
        fs::remove_file(&self.staging)
            .await
            .map_err(|e| KbcError::storage(format!("removing staged output failed: {e}")))
    }
}

impl Drop for JsonlTransaction {
    fn drop(&mut self) {
        // staging files never outlive their transaction
        if self.staging.exists() {
            let _ = std::fs::remove_file(&self.staging);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn row(id: i64) -> Record {
        Record::new().with_field("id", id)
    }

    async fn collect(store: &JsonlStore, query: &str) -> Result<Vec<Record>> {
        store.query(&QuerySpec::parse(query)).await?.try_collect().await
    }

    #[tokio::test]
    async fn test_commit_then_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        let mut tx = store.begin_append("people", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(1), row(2)]).await.unwrap();
        assert!(collect(&store, "people").await.is_err());

        assert_eq!(tx.commit().await.unwrap(), 2);
        assert_eq!(collect(&store, "people").await.unwrap(), vec![row(1), row(2)]);
        assert_eq!(store.relation_names().await.unwrap(), vec!["people"]);
    }

    #[tokio::test]
    async fn test_append_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        store.append_records("r", vec![row(1)]).await.unwrap();
        store.append_records("r", vec![row(2)]).await.unwrap();
        assert_eq!(collect(&store, "SELECT * FROM r").await.unwrap().len(), 2);

        let mut tx = store.begin_append("r", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(9)]).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(collect(&store, "r").await.unwrap(), vec![row(9)]);
    }

    #[tokio::test]
    async fn test_abort_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        let mut tx = store.begin_append("r", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(1)]).await.unwrap();
        tx.abort().await.unwrap();

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_dropped_transaction_cleans_staging() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        let mut tx = store.begin_append("r", WriteMode::Replace).await.unwrap();
        tx.write(vec![row(1)]).await.unwrap();
        drop(tx);

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_malformed_stored_line_is_record_error() {
        let dir = tempfile::tempdir().unwrap();
        let content = "{\"id\":1}\nnot json\n\n{\"id\":3}\n";
        std::fs::write(dir.path().join("r.jsonl"), content).unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();

        let items: Vec<_> = store
            .query(&QuerySpec::parse("r"))
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(items[1].as_ref().unwrap_err().is_record_error());
        assert!(items[2].is_ok());
    }

    #[tokio::test]
    async fn test_invalid_relation_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlStore::open(dir.path()).await.unwrap();
        assert!(store.relation_path("../escape").is_err());
        assert!(store.begin_append(".hidden", WriteMode::Append).await.is_err());
    }
}
