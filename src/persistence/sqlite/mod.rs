//! SQLite persistence engine.
//!
//! Commits are stored one row per commit with events and headers encoded by
//! the injected `Serializer`. The autoincrement row id doubles as the
//! store-wide checkpoint. Writes run inside `BEGIN IMMEDIATE` transactions so
//! the duplicate/head checks and the insert are atomic; the unique
//! constraints on `(tenant, stream, commit_sequence)` and
//! `(tenant, stream, commit_id)` back that up.
//!
//! Reads are paged with keyset pagination and only fetch the next page when
//! the consumer asks for it.

mod schema;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use sea_query::{Cond, Expr, OnConflict, Order, Query, SelectStatement, SqliteQueryBuilder};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use self::schema::{Commits, Snapshots, Streams, COMMIT_COLUMNS, CREATE_TABLES, DROP_TABLES};
use super::{
    validate_against_head, AccessSnapshots, CommitEvents, CommitStream, ManagePersistence,
    PersistenceError, Result, StreamHeadStream,
};
use crate::config::SqliteConfig;
use crate::model::{
    CheckpointToken, Commit, CommitAttempt, Headers, Payload, Snapshot, StreamHead,
    StreamRevision,
};
use crate::serialization::{deserialize_typed, serialize_typed, Serializer};

/// Default number of commits fetched per page.
pub const DEFAULT_PAGE_SIZE: u64 = 128;

/// Path value selecting a private in-memory database.
pub const IN_MEMORY_PATH: &str = ":memory:";

/// Position of a paged read.
#[derive(Default)]
struct PageCursor {
    last: Option<Commit>,
    exhausted: bool,
}

fn corrupt(what: impl std::fmt::Display) -> PersistenceError {
    PersistenceError::Corrupt(what.to_string())
}

fn to_revision(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| corrupt(format!("{column} out of range: {value}")))
}

/// SQLite implementation of the persistence engine.
pub struct SqlitePersistence {
    pool: SqlitePool,
    serializer: Arc<dyn Serializer>,
    page_size: u64,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence engine on an existing pool.
    pub fn new(pool: SqlitePool, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            pool,
            serializer,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Open (or create) the database described by `config`.
    pub async fn connect(config: &SqliteConfig, serializer: Arc<dyn Serializer>) -> Result<Self> {
        let pool = if config.path == IN_MEMORY_PATH {
            // one connection that never expires, or the database goes with it
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect("sqlite::memory:")
                .await?
        } else {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| PersistenceError::Configuration(e.to_string()))?;
                }
            }
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&format!("sqlite:{}?mode=rwc", config.path))
                .await?
        };

        info!(path = %config.path, page_size = config.page_size, "SQLite persistence connected");
        Ok(Self::new(pool, serializer).with_page_size(config.page_size))
    }

    /// Set the number of commits fetched per page.
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn decode_commit(&self, row: &SqliteRow) -> Result<Commit> {
        let commit_id: String = row.try_get("commit_id")?;
        let commit_id = Uuid::from_slice(&hex::decode(&commit_id).map_err(corrupt)?)?;

        let stamp: i64 = row.try_get("commit_stamp")?;
        let commit_stamp = DateTime::from_timestamp_micros(stamp)
            .ok_or_else(|| corrupt(format!("commit_stamp out of range: {stamp}")))?;

        let headers: Vec<u8> = row.try_get("headers")?;
        let payload: Vec<u8> = row.try_get("payload")?;

        Ok(Commit {
            tenant_id: row.try_get("tenant_id")?,
            stream_id: row.try_get("stream_id")?,
            stream_revision: to_revision(row.try_get("stream_revision")?, "stream_revision")?,
            commit_id,
            commit_sequence: to_revision(row.try_get("commit_sequence")?, "commit_sequence")?,
            commit_stamp,
            checkpoint_token: row.try_get("checkpoint_number")?,
            headers: deserialize_typed::<Headers>(self.serializer.as_ref(), &headers)?,
            events: deserialize_typed(self.serializer.as_ref(), &payload)?,
        })
    }

    /// Lazily page through commits.
    ///
    /// `build` receives the last commit of the previous page and returns the
    /// query for the next page (without limit). Every read is keyset-paged.
    fn paged<'a, B>(&'a self, build: B) -> CommitStream<'a>
    where
        B: Fn(Option<&Commit>) -> SelectStatement + Send + Sync + 'a,
    {
        let build = Arc::new(build);
        let page_size = self.page_size;

        futures::stream::try_unfold(PageCursor::default(), move |cursor| {
            let build = Arc::clone(&build);
            async move {
                if cursor.exhausted {
                    return Ok::<_, PersistenceError>(None);
                }

                let mut stmt = build(cursor.last.as_ref());
                let sql = stmt.limit(page_size).to_string(SqliteQueryBuilder);
                let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
                if rows.is_empty() {
                    return Ok(None);
                }

                let page = rows
                    .iter()
                    .map(|row| self.decode_commit(row))
                    .collect::<Result<Vec<_>>>()?;
                let fetched = page.len() as u64;
                let next = PageCursor {
                    last: page.last().cloned(),
                    exhausted: fetched < page_size,
                };
                Ok(Some((page, next)))
            }
        })
        .map_ok(|page| futures::stream::iter(page.into_iter().map(Ok::<_, PersistenceError>)))
        .try_flatten()
        .boxed()
    }

    /// Validate and insert one commit inside an open transaction.
    async fn append(&self, conn: &mut SqliteConnection, attempt: CommitAttempt) -> Result<Commit> {
        let commit_id = hex::encode(attempt.commit_id.as_bytes());

        let duplicate = Query::select()
            .columns(COMMIT_COLUMNS)
            .from(Commits::Table)
            .and_where(Expr::col(Commits::TenantId).eq(attempt.tenant_id.as_str()))
            .and_where(Expr::col(Commits::StreamId).eq(attempt.stream_id.as_str()))
            .and_where(Expr::col(Commits::CommitId).eq(commit_id.as_str()))
            .to_string(SqliteQueryBuilder);

        if let Some(row) = sqlx::query(&duplicate).fetch_optional(&mut *conn).await? {
            return Err(PersistenceError::DuplicateCommit(Box::new(
                self.decode_commit(&row)?,
            )));
        }

        let head = Query::select()
            .expr(Expr::col(Commits::CommitSequence).max())
            .expr(Expr::col(Commits::StreamRevision).max())
            .from(Commits::Table)
            .and_where(Expr::col(Commits::TenantId).eq(attempt.tenant_id.as_str()))
            .and_where(Expr::col(Commits::StreamId).eq(attempt.stream_id.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&head).fetch_one(&mut *conn).await?;
        let head_sequence: Option<i64> = row.try_get(0)?;
        let head_revision: Option<i64> = row.try_get(1)?;
        validate_against_head(
            &attempt,
            to_revision(head_sequence.unwrap_or(0), "commit_sequence")?,
            to_revision(head_revision.unwrap_or(0), "stream_revision")?,
        )?;

        let stamp = attempt.commit_stamp.timestamp_micros();
        let items = i64::try_from(attempt.events.len())
            .map_err(|_| PersistenceError::InvalidAttempt("too many events".to_string()))?;
        let headers = serialize_typed(self.serializer.as_ref(), &attempt.headers)?;
        let payload = serialize_typed(self.serializer.as_ref(), &attempt.events)?;

        let insert = Query::insert()
            .into_table(Commits::Table)
            .columns([
                Commits::TenantId,
                Commits::StreamId,
                Commits::CommitId,
                Commits::CommitSequence,
                Commits::StreamRevision,
                Commits::Items,
                Commits::CommitStamp,
                Commits::Headers,
                Commits::Payload,
            ])
            .values_panic([
                attempt.tenant_id.as_str().into(),
                attempt.stream_id.as_str().into(),
                commit_id.into(),
                attempt.commit_sequence.into(),
                attempt.stream_revision.into(),
                items.into(),
                stamp.into(),
                headers.into(),
                payload.into(),
            ])
            .to_string(SqliteQueryBuilder);

        let inserted = match sqlx::query(&insert).execute(&mut *conn).await {
            Ok(done) => done,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                return Err(PersistenceError::ConcurrencyConflict {
                    tenant: attempt.tenant_id,
                    stream: attempt.stream_id,
                    stream_revision: attempt.stream_revision,
                    commit_sequence: attempt.commit_sequence,
                });
            }
            Err(e) => return Err(e.into()),
        };
        let checkpoint = inserted.last_insert_rowid();

        let upsert_head = Query::insert()
            .into_table(Streams::Table)
            .columns([
                Streams::TenantId,
                Streams::StreamId,
                Streams::HeadRevision,
                Streams::SnapshotRevision,
            ])
            .values_panic([
                attempt.tenant_id.as_str().into(),
                attempt.stream_id.as_str().into(),
                attempt.stream_revision.into(),
                0u32.into(),
            ])
            .on_conflict(
                OnConflict::columns([Streams::TenantId, Streams::StreamId])
                    .update_column(Streams::HeadRevision)
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);
        sqlx::query(&upsert_head).execute(&mut *conn).await?;

        let mut commit = attempt.into_commit(checkpoint);
        // report the stamp at the precision it was stored with
        if let Some(stored) = DateTime::from_timestamp_micros(stamp) {
            commit.commit_stamp = stored;
        }
        Ok(commit)
    }

    /// Record a snapshot inside an open transaction.
    async fn record_snapshot(&self, conn: &mut SqliteConnection, snapshot: Snapshot) -> Result<bool> {
        let head = Query::select()
            .columns([Streams::HeadRevision, Streams::SnapshotRevision])
            .from(Streams::Table)
            .and_where(Expr::col(Streams::TenantId).eq(snapshot.tenant_id.as_str()))
            .and_where(Expr::col(Streams::StreamId).eq(snapshot.stream_id.as_str()))
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&head).fetch_optional(&mut *conn).await? else {
            return Ok(false);
        };
        let head_revision = to_revision(row.try_get("head_revision")?, "head_revision")?;
        let snapshot_revision = to_revision(row.try_get("snapshot_revision")?, "snapshot_revision")?;

        if snapshot.stream_revision == 0 || snapshot.stream_revision > head_revision {
            return Ok(false);
        }

        let payload = serialize_typed(self.serializer.as_ref(), &snapshot.payload)?;
        let insert = Query::insert()
            .into_table(Snapshots::Table)
            .columns([
                Snapshots::TenantId,
                Snapshots::StreamId,
                Snapshots::StreamRevision,
                Snapshots::Payload,
            ])
            .values_panic([
                snapshot.tenant_id.as_str().into(),
                snapshot.stream_id.as_str().into(),
                snapshot.stream_revision.into(),
                payload.into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    Snapshots::TenantId,
                    Snapshots::StreamId,
                    Snapshots::StreamRevision,
                ])
                .do_nothing()
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        let inserted = sqlx::query(&insert).execute(&mut *conn).await?;
        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        let update = Query::update()
            .table(Streams::Table)
            .value(
                Streams::SnapshotRevision,
                snapshot_revision.max(snapshot.stream_revision),
            )
            .and_where(Expr::col(Streams::TenantId).eq(snapshot.tenant_id.as_str()))
            .and_where(Expr::col(Streams::StreamId).eq(snapshot.stream_id.as_str()))
            .to_string(SqliteQueryBuilder);
        sqlx::query(&update).execute(&mut *conn).await?;

        Ok(true)
    }

    /// Delete rows matching a tenant (and optionally a stream) from every table.
    async fn delete_rows(&self, tenant: Option<&str>, stream: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let mut result = Ok(());
        for table in ["snapshots", "streams", "commits"] {
            let mut stmt = Query::delete();
            stmt.from_table(sea_query::Alias::new(table));
            if let Some(tenant) = tenant {
                stmt.and_where(Expr::col(Commits::TenantId).eq(tenant));
            }
            if let Some(stream) = stream {
                stmt.and_where(Expr::col(Commits::StreamId).eq(stream));
            }
            let sql = stmt.to_string(SqliteQueryBuilder);
            if let Err(e) = sqlx::query(&sql).execute(&mut *conn).await {
                result = Err(e.into());
                break;
            }
        }

        finish(&mut conn, result).await
    }
}

/// Commit or roll back the open transaction depending on `result`.
async fn finish<T>(conn: &mut SqliteConnection, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl CommitEvents for SqlitePersistence {
    async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>> {
        if attempt.events.is_empty() {
            return Ok(None);
        }

        // BEGIN IMMEDIATE acquires the write lock upfront, so the head check
        // and the insert see the same stream state.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = self.append(&mut conn, attempt).await;
        let commit = finish(&mut conn, result).await?;

        debug!(
            tenant = %commit.tenant_id,
            stream = %commit.stream_id,
            checkpoint = commit.checkpoint_token,
            "Commit appended"
        );
        Ok(Some(commit))
    }

    fn get(
        &self,
        tenant: &str,
        stream: &str,
        min_revision: StreamRevision,
        max_revision: StreamRevision,
    ) -> CommitStream<'_> {
        let tenant = tenant.to_string();
        let stream = stream.to_string();
        self.paged(move |last| {
            let mut stmt = Query::select();
            stmt.columns(COMMIT_COLUMNS)
                .from(Commits::Table)
                .and_where(Expr::col(Commits::TenantId).eq(tenant.as_str()))
                .and_where(Expr::col(Commits::StreamId).eq(stream.as_str()))
                .and_where(Expr::col(Commits::StreamRevision).gte(min_revision))
                .and_where(
                    Expr::expr(Expr::col(Commits::StreamRevision).sub(Expr::col(Commits::Items)))
                        .lt(max_revision),
                )
                .order_by(Commits::CommitSequence, Order::Asc);
            if let Some(last) = last {
                stmt.and_where(Expr::col(Commits::CommitSequence).gt(last.commit_sequence));
            }
            stmt
        })
    }

    fn get_from(&self, tenant: &str, checkpoint: CheckpointToken) -> CommitStream<'_> {
        let tenant = tenant.to_string();
        self.paged(move |last| {
            let after = last.map_or(checkpoint, |c| c.checkpoint_token);
            let mut stmt = Query::select();
            stmt.columns(COMMIT_COLUMNS)
                .from(Commits::Table)
                .and_where(Expr::col(Commits::TenantId).eq(tenant.as_str()))
                .and_where(Expr::col(Commits::CheckpointNumber).gt(after))
                .order_by(Commits::CheckpointNumber, Order::Asc);
            stmt
        })
    }

    fn get_by_time(
        &self,
        tenant: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CommitStream<'_> {
        let tenant = tenant.to_string();
        let start = start.timestamp_micros();
        let end = end.map(|e| e.timestamp_micros());
        self.paged(move |last| {
            let mut stmt = Query::select();
            stmt.columns(COMMIT_COLUMNS)
                .from(Commits::Table)
                .and_where(Expr::col(Commits::TenantId).eq(tenant.as_str()))
                .and_where(Expr::col(Commits::CommitStamp).gte(start))
                .order_by(Commits::CommitStamp, Order::Asc)
                .order_by(Commits::CheckpointNumber, Order::Asc);
            if let Some(end) = end {
                stmt.and_where(Expr::col(Commits::CommitStamp).lt(end));
            }
            // resume after (stamp, checkpoint) of the previous page
            if let Some(last) = last {
                let stamp = last.commit_stamp.timestamp_micros();
                stmt.cond_where(
                    Cond::any()
                        .add(Expr::col(Commits::CommitStamp).gt(stamp))
                        .add(
                            Cond::all()
                                .add(Expr::col(Commits::CommitStamp).eq(stamp))
                                .add(Expr::col(Commits::CheckpointNumber).gt(last.checkpoint_token)),
                        ),
                );
            }
            stmt
        })
    }
}

#[async_trait]
impl AccessSnapshots for SqlitePersistence {
    async fn get_snapshot(
        &self,
        tenant: &str,
        stream: &str,
        max_revision: StreamRevision,
    ) -> Result<Option<Snapshot>> {
        let query = Query::select()
            .columns([Snapshots::StreamRevision, Snapshots::Payload])
            .from(Snapshots::Table)
            .and_where(Expr::col(Snapshots::TenantId).eq(tenant))
            .and_where(Expr::col(Snapshots::StreamId).eq(stream))
            .and_where(Expr::col(Snapshots::StreamRevision).lte(max_revision))
            .order_by(Snapshots::StreamRevision, Order::Desc)
            .limit(1)
            .to_string(SqliteQueryBuilder);

        let Some(row) = sqlx::query(&query).fetch_optional(&self.pool).await? else {
            return Ok(None);
        };

        let payload: Vec<u8> = row.try_get("payload")?;
        Ok(Some(Snapshot {
            tenant_id: tenant.to_string(),
            stream_id: stream.to_string(),
            stream_revision: to_revision(row.try_get("stream_revision")?, "stream_revision")?,
            payload: deserialize_typed::<Payload>(self.serializer.as_ref(), &payload)?,
        }))
    }

    async fn add_snapshot(&self, snapshot: Snapshot) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
        let result = self.record_snapshot(&mut conn, snapshot).await;
        finish(&mut conn, result).await
    }

    fn streams_to_snapshot(&self, tenant: &str, max_threshold: u32) -> StreamHeadStream<'_> {
        let query = Query::select()
            .columns([
                Streams::TenantId,
                Streams::StreamId,
                Streams::HeadRevision,
                Streams::SnapshotRevision,
            ])
            .from(Streams::Table)
            .and_where(Expr::col(Streams::TenantId).eq(tenant))
            .and_where(
                Expr::expr(
                    Expr::col(Streams::HeadRevision).sub(Expr::col(Streams::SnapshotRevision)),
                )
                .gt(max_threshold),
            )
            .order_by(Streams::StreamId, Order::Asc)
            .to_string(SqliteQueryBuilder);

        futures::stream::once(async move {
            let rows = match sqlx::query(&query).fetch_all(&self.pool).await {
                Ok(rows) => rows,
                Err(e) => return vec![Err(e.into())],
            };
            rows.iter()
                .map(|row| {
                    Ok(StreamHead {
                        tenant_id: row.try_get("tenant_id")?,
                        stream_id: row.try_get("stream_id")?,
                        head_revision: to_revision(row.try_get("head_revision")?, "head_revision")?,
                        snapshot_revision: to_revision(
                            row.try_get("snapshot_revision")?,
                            "snapshot_revision",
                        )?,
                    })
                })
                .collect::<Vec<Result<StreamHead>>>()
        })
        .flat_map(futures::stream::iter)
        .boxed()
    }
}

#[async_trait]
impl ManagePersistence for SqlitePersistence {
    async fn initialize(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_TABLES).execute(&self.pool).await?;
        info!("SQLite schema initialized");
        Ok(())
    }

    async fn drop_store(&self) -> Result<()> {
        sqlx::raw_sql(DROP_TABLES).execute(&self.pool).await?;
        info!("SQLite schema dropped");
        Ok(())
    }

    async fn purge(&self, tenant: &str) -> Result<()> {
        info!(tenant = %tenant, "Purging tenant");
        self.delete_rows(Some(tenant), None).await
    }

    async fn purge_all(&self) -> Result<()> {
        info!("Purging all tenants");
        self.delete_rows(None, None).await
    }

    async fn delete_stream(&self, tenant: &str, stream: &str) -> Result<()> {
        info!(tenant = %tenant, stream = %stream, "Deleting stream");
        self.delete_rows(Some(tenant), Some(stream)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventMessage;
    use crate::serialization::JsonSerializer;

    async fn store() -> SqlitePersistence {
        let config = SqliteConfig {
            path: IN_MEMORY_PATH.to_string(),
            page_size: 2,
            ..Default::default()
        };
        let store = SqlitePersistence::connect(&config, Arc::new(JsonSerializer::default()))
            .await
            .unwrap();
        store.initialize().await.unwrap();
        store
    }

    fn attempt(sequence: u32, revision: u32) -> CommitAttempt {
        CommitAttempt {
            tenant_id: "tenant".to_string(),
            stream_id: "stream".to_string(),
            stream_revision: revision,
            commit_id: Uuid::new_v4(),
            commit_sequence: sequence,
            commit_stamp: Utc::now(),
            headers: Headers::from([("user".to_string(), serde_json::json!("bob"))]),
            events: vec![EventMessage::new(Payload::new(
                "test.Event",
                serde_json::json!({"n": revision}),
            ))],
        }
    }

    #[tokio::test]
    async fn test_paging_reads_every_commit() {
        let store = store().await;
        for i in 1..=5 {
            store.commit(attempt(i, i)).await.unwrap();
        }

        // page size 2 forces three pages
        let commits: Vec<Commit> = store.get("tenant", "stream", 0, u32::MAX).try_collect().await.unwrap();
        let revisions: Vec<u32> = commits.iter().map(|c| c.stream_revision).collect();
        assert_eq!(revisions, vec![1, 2, 3, 4, 5]);

        let commits: Vec<Commit> = store.get_from("tenant", 2).try_collect().await.unwrap();
        let tokens: Vec<i64> = commits.iter().map(|c| c.checkpoint_token).collect();
        assert_eq!(tokens, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_time_paging_resumes_after_shared_stamp() {
        let store = store().await;
        let stamp = DateTime::from_timestamp_micros(1_700_000_000_000_000).unwrap();
        // three commits share one stamp so a page boundary falls inside the tie
        for i in 1..=5 {
            let mut attempt = attempt(i, i);
            attempt.commit_stamp = if i <= 3 {
                stamp
            } else {
                stamp + chrono::Duration::seconds(i as i64)
            };
            store.commit(attempt).await.unwrap();
        }

        let mut commits = store.get_by_time("tenant", stamp, None);
        let first: Vec<i64> = vec![
            commits.try_next().await.unwrap().unwrap().checkpoint_token,
            commits.try_next().await.unwrap().unwrap().checkpoint_token,
        ];
        // written after the first page, ordered after it by checkpoint
        let mut late = attempt(6, 6);
        late.commit_stamp = stamp + chrono::Duration::seconds(60);
        store.commit(late).await.unwrap();
        let rest: Vec<i64> = commits.map_ok(|c| c.checkpoint_token).try_collect().await.unwrap();

        assert_eq!(first, vec![1, 2]);
        assert_eq!(rest, vec![3, 4, 5, 6]);

        let bounded: Vec<i64> = store
            .get_by_time("tenant", stamp, Some(stamp + chrono::Duration::seconds(5)))
            .map_ok(|c| c.checkpoint_token)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(bounded, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_returned_commit_matches_stored_commit() {
        let store = store().await;
        let written = store.commit(attempt(1, 1)).await.unwrap().unwrap();

        let read: Vec<Commit> = store.get_from("tenant", 0).try_collect().await.unwrap();
        assert_eq!(read, vec![written]);
    }

    #[tokio::test]
    async fn test_drop_store_removes_tables() {
        let store = store().await;
        store.commit(attempt(1, 1)).await.unwrap();
        store.drop_store().await.unwrap();

        let result: Result<Vec<Commit>> = store.get_from("tenant", 0).try_collect().await;
        assert!(matches!(result, Err(PersistenceError::Database(_))));

        store.initialize().await.unwrap();
        let commits: Vec<Commit> = store.get_from("tenant", 0).try_collect().await.unwrap();
        assert!(commits.is_empty());
    }
}
