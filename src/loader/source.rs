use std::path::PathBuf;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::SourceConfig;
use crate::error::Result;
use crate::index::key_in_shard;
use crate::types::ShardAssignment;

/// `(owner_id, group_id)` membership row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRow {
    pub owner_id: String,
    pub group_id: String,
}

/// Raw template row. Fields are optional because the backing store may hold
/// incomplete rows; the loader validates and counts rejects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TemplateRow {
    pub id: Option<String>,
    pub owner_id: Option<String>,
    pub feature: Option<Vec<u8>>,
}

/// Restricts a template stream to the keys one shard owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardFilter {
    pub shard: ShardAssignment,
}

impl ShardFilter {
    pub fn new(shard: ShardAssignment) -> Self {
        Self { shard }
    }

    /// Rows without an id go to shard 0 only, so each reject is counted once
    /// across the cluster.
    pub fn admits(&self, id: Option<&str>) -> bool {
        match id {
            Some(id) => key_in_shard(id, &self.shard),
            None => self.shard.node_index == 0,
        }
    }
}

/// The relational backing store, as seen by the bulk loader.
#[async_trait]
pub trait RowSource: Send + Sync {
    /// Every group-membership row. Never shard-filtered: any owner may have
    /// templates in any shard.
    async fn group_rows(&self) -> Result<BoxStream<'static, Result<GroupRow>>>;

    /// Template rows, restricted to `shard` when given.
    async fn template_rows(
        &self,
        shard: Option<ShardFilter>,
    ) -> Result<BoxStream<'static, Result<TemplateRow>>>;

    fn describe(&self) -> String;
}

/// Build the configured source, if any.
pub fn from_config(config: &SourceConfig) -> Option<std::sync::Arc<dyn RowSource>> {
    match (config.kind, &config.sqlite_path) {
        (crate::config::SourceKind::Sqlite, Some(path)) => {
            Some(std::sync::Arc::new(SqliteSource::new(path.clone(), config)))
        }
        _ => None,
    }
}

/// Fixed in-memory rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    pub groups: Vec<GroupRow>,
    pub templates: Vec<TemplateRow>,
}

impl MemorySource {
    pub fn new(groups: Vec<GroupRow>, templates: Vec<TemplateRow>) -> Self {
        Self { groups, templates }
    }
}

#[async_trait]
impl RowSource for MemorySource {
    async fn group_rows(&self) -> Result<BoxStream<'static, Result<GroupRow>>> {
        Ok(stream::iter(self.groups.clone().into_iter().map(Ok)).boxed())
    }

    async fn template_rows(
        &self,
        shard: Option<ShardFilter>,
    ) -> Result<BoxStream<'static, Result<TemplateRow>>> {
        let rows: Vec<_> = self
            .templates
            .iter()
            .filter(|r| shard.map_or(true, |f| f.admits(r.id.as_deref())))
            .cloned()
            .collect();
        Ok(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    fn describe(&self) -> String {
        format!(
            "memory ({} group rows, {} template rows)",
            self.groups.len(),
            self.templates.len()
        )
    }
}

/// SQLite backing store.
///
/// Each query runs on a blocking thread and feeds a bounded channel, so a
/// slow loader backs up into the producer instead of buffering the table.
#[derive(Debug, Clone)]
pub struct SqliteSource {
    path: PathBuf,
    template_query: String,
    group_query: String,
    channel_capacity: usize,
}

impl SqliteSource {
    pub fn new(path: PathBuf, config: &SourceConfig) -> Self {
        Self {
            path,
            template_query: config.template_query.clone(),
            group_query: config.group_query.clone(),
            channel_capacity: config.channel_capacity.max(1),
        }
    }

    fn stream_rows<T, F>(&self, sql: String, map: F) -> BoxStream<'static, Result<T>>
    where
        T: Send + 'static,
        F: Fn(&Row<'_>) -> rusqlite::Result<Option<T>> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<T>>(self.channel_capacity);
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || {
            let produced = (|| -> Result<u64> {
                let conn = Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query([])?;
                let mut sent = 0u64;
                while let Some(row) = rows.next()? {
                    let Some(item) = map(row)? else { continue };
                    if tx.blocking_send(Ok(item)).is_err() {
                        debug!("row consumer went away, stopping producer");
                        break;
                    }
                    sent += 1;
                }
                Ok(sent)
            })();
            match produced {
                Ok(sent) => debug!(rows = sent, "sqlite producer finished"),
                Err(e) => {
                    warn!(error = %e, "sqlite producer failed");
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

/// Text or integer column as a string; NULL and empty text as `None`.
fn text_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<String>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => {
            let s = String::from_utf8_lossy(t);
            (!s.is_empty()).then(|| s.into_owned())
        }
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).into_owned()),
    })
}

fn blob_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Vec<u8>>> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Blob(b) | ValueRef::Text(b) => Some(b.to_vec()),
        ValueRef::Integer(_) | ValueRef::Real(_) => Some(Vec::new()),
    })
}

#[async_trait]
impl RowSource for SqliteSource {
    async fn group_rows(&self) -> Result<BoxStream<'static, Result<GroupRow>>> {
        Ok(self.stream_rows(self.group_query.clone(), |row| {
            // Incomplete membership rows carry no information.
            Ok(match (text_column(row, 0)?, text_column(row, 1)?) {
                (Some(owner_id), Some(group_id)) => Some(GroupRow { owner_id, group_id }),
                _ => None,
            })
        }))
    }

    async fn template_rows(
        &self,
        shard: Option<ShardFilter>,
    ) -> Result<BoxStream<'static, Result<TemplateRow>>> {
        Ok(self.stream_rows(self.template_query.clone(), move |row| {
            let id = text_column(row, 0)?;
            if let Some(filter) = shard {
                if !filter.admits(id.as_deref()) {
                    return Ok(None);
                }
            }
            Ok(Some(TemplateRow {
                id,
                owner_id: text_column(row, 1)?,
                feature: blob_column(row, 2)?,
            }))
        }))
    }

    fn describe(&self) -> String {
        format!("sqlite ({})", self.path.display())
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GalleryError;
    use futures::TryStreamExt;

    fn seed_db(path: &std::path::Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE templates (id TEXT, owner_id TEXT, feature BLOB);
             CREATE TABLE group_members (owner_id TEXT, group_id TEXT);",
        )
        .unwrap();
        for i in 0..20 {
            conn.execute(
                "INSERT INTO templates VALUES (?1, ?2, ?3)",
                rusqlite::params![format!("t{i}"), format!("o{}", i % 4), vec![0u8; 512]],
            )
            .unwrap();
        }
        conn.execute(
            "INSERT INTO templates VALUES (NULL, 'o1', ?1)",
            rusqlite::params![vec![0u8; 512]],
        )
        .unwrap();
        conn.execute_batch(
            "INSERT INTO group_members VALUES ('o0', 'A'), ('o1', 'B'), ('o1', NULL);",
        )
        .unwrap();
    }

    fn source(path: PathBuf) -> SqliteSource {
        SqliteSource::new(
            path,
            &SourceConfig {
                channel_capacity: 2,
                ..SourceConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_sqlite_streams_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");
        seed_db(&path);
        let src = source(path);

        let groups: Vec<GroupRow> = src.group_rows().await.unwrap().try_collect().await.unwrap();
        assert_eq!(groups.len(), 2);

        let rows: Vec<TemplateRow> = src
            .template_rows(None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(rows.len(), 21);
        assert_eq!(rows.iter().filter(|r| r.id.is_none()).count(), 1);
        assert!(rows.iter().all(|r| r.feature.as_ref().map(Vec::len) == Some(512)));
    }

    #[tokio::test]
    async fn test_sqlite_shards_are_disjoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.db");
        seed_db(&path);
        let src = source(path);

        let mut total = 0;
        for index in 0..3 {
            let filter = ShardFilter::new(ShardAssignment::new(index, 3).unwrap());
            let rows: Vec<TemplateRow> = src
                .template_rows(Some(filter))
                .await
                .unwrap()
                .try_collect()
                .await
                .unwrap();
            for r in &rows {
                assert!(filter.admits(r.id.as_deref()));
            }
            total += rows.len();
        }
        assert_eq!(total, 21);
    }

    #[tokio::test]
    async fn test_sqlite_missing_file_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = source(dir.path().join("absent.db"));
        let result: Result<Vec<GroupRow>> = src.group_rows().await.unwrap().try_collect().await;
        assert!(matches!(result, Err(GalleryError::Sqlite(_))));
    }

    #[tokio::test]
    async fn test_memory_source_applies_shard_filter() {
        let templates: Vec<TemplateRow> = (0..30)
            .map(|i| TemplateRow {
                id: Some(format!("t{i}")),
                owner_id: Some("o".into()),
                feature: Some(vec![0; 512]),
            })
            .collect();
        let src = MemorySource::new(vec![], templates);
        let filter = ShardFilter::new(ShardAssignment::new(1, 2).unwrap());
        let rows: Vec<TemplateRow> = src
            .template_rows(Some(filter))
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert!(rows.len() < 30);
        assert!(rows.iter().all(|r| filter.admits(r.id.as_deref())));
    }
}
