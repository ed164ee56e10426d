//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{
    AuditRepo, BootstrapRepo, CacheEntryRepo, CleanupPolicyRepo, LeaseRepo, PackageFileRepo,
    RegistryRepo, TokenRepo, UpstreamRepo,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    RegistryRepo
    + UpstreamRepo
    + CacheEntryRepo
    + CleanupPolicyRepo
    + AuditRepo
    + PackageFileRepo
    + TokenRepo
    + BootstrapRepo
    + LeaseRepo
    + Send
    + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn new(
        path: impl AsRef<Path>,
        query_timeout_secs: Option<u64>,
    ) -> MetadataResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection serializes writers; transactions below rely on it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            path = %path.display(),
            query_timeout_secs = query_timeout_secs.unwrap_or(600),
            "opened sqlite metadata store (query timeout is advisory)"
        );

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::{NewCacheEntry, UpstreamUpdate};
    use sqlx::SqliteConnection;
    use time::OffsetDateTime;
    use uuid::Uuid;

    /// Mark every live entry of an upstream pending. Returns (count, bytes).
    async fn mark_upstream_entries(
        conn: &mut SqliteConnection,
        upstream_id: Uuid,
        now: OffsetDateTime,
    ) -> MetadataResult<(u64, u64)> {
        let sizes: Vec<i64> = sqlx::query_scalar(
            r#"
            UPDATE cache_entries
            SET status = 'pending_destruction', updated_at = ?
            WHERE upstream_id = ? AND status = 'default'
            RETURNING size_bytes
            "#,
        )
        .bind(now)
        .bind(upstream_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok((sizes.len() as u64, sizes.into_iter().map(to_u64).sum()))
    }

    /// Rewrite positions of a registry's upstreams as 1..n in the given order.
    async fn renumber(conn: &mut SqliteConnection, ordered: &[Uuid]) -> MetadataResult<()> {
        for (index, upstream_id) in ordered.iter().enumerate() {
            sqlx::query("UPDATE upstreams SET position = ? WHERE upstream_id = ?")
                .bind(index as i64 + 1)
                .bind(upstream_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    async fn ordered_upstream_ids(
        conn: &mut SqliteConnection,
        registry_id: Uuid,
    ) -> MetadataResult<Vec<Uuid>> {
        let ids = sqlx::query_scalar(
            "SELECT upstream_id FROM upstreams WHERE registry_id = ? ORDER BY position, created_at",
        )
        .bind(registry_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    #[async_trait]
    impl RegistryRepo for SqliteStore {
        async fn create_registry(&self, registry: &RegistryRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO registries (registry_id, group_id, name, registry_type, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(registry.registry_id)
            .bind(registry.group_id)
            .bind(&registry.name)
            .bind(&registry.registry_type)
            .bind(registry.created_at)
            .bind(registry.updated_at)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                MetadataError::from_unique(e, || {
                    format!("registry named {} already exists in group", registry.name)
                })
            })?;
            Ok(())
        }

        async fn get_registry(&self, registry_id: Uuid) -> MetadataResult<Option<RegistryRow>> {
            let row =
                sqlx::query_as::<_, RegistryRow>("SELECT * FROM registries WHERE registry_id = ?")
                    .bind(registry_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_registries(
            &self,
            group_id: Option<Uuid>,
        ) -> MetadataResult<Vec<RegistryRow>> {
            let rows = match group_id {
                Some(id) => {
                    sqlx::query_as::<_, RegistryRow>(
                        "SELECT * FROM registries WHERE group_id = ? ORDER BY name",
                    )
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, RegistryRow>(
                        "SELECT * FROM registries ORDER BY group_id, name",
                    )
                    .fetch_all(&self.pool)
                    .await?
                }
            };
            Ok(rows)
        }

        async fn delete_registry(&self, registry_id: Uuid) -> MetadataResult<u64> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let upstream_ids = ordered_upstream_ids(&mut tx, registry_id).await?;
            let mut marked = 0;
            for upstream_id in &upstream_ids {
                marked += mark_upstream_entries(&mut tx, *upstream_id, now).await?.0;
            }

            sqlx::query("DELETE FROM upstreams WHERE registry_id = ?")
                .bind(registry_id)
                .execute(&mut *tx)
                .await?;
            let result = sqlx::query("DELETE FROM registries WHERE registry_id = ?")
                .bind(registry_id)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("registry {registry_id}")));
            }

            tx.commit().await?;
            Ok(marked)
        }
    }

    #[async_trait]
    impl UpstreamRepo for SqliteStore {
        async fn create_upstream(
            &self,
            upstream: &UpstreamRow,
            max_per_registry: usize,
        ) -> MetadataResult<UpstreamRow> {
            let mut tx = self.pool.begin().await?;

            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM upstreams WHERE registry_id = ?")
                    .bind(upstream.registry_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if count as usize >= max_per_registry {
                return Err(MetadataError::Constraint(format!(
                    "registry {} already has the maximum of {max_per_registry} upstreams",
                    upstream.registry_id
                )));
            }

            let row = sqlx::query_as::<_, UpstreamRow>(
                r#"
                INSERT INTO upstreams (
                    upstream_id, registry_id, group_id, registry_type, name, position,
                    url, project_gid, username, password, cache_validity_hours,
                    created_at, updated_at
                ) VALUES (
                    ?, ?, ?, ?, ?,
                    (SELECT COALESCE(MAX(position), 0) + 1 FROM upstreams WHERE registry_id = ?),
                    ?, ?, ?, ?, ?, ?, ?
                )
                RETURNING *
                "#,
            )
            .bind(upstream.upstream_id)
            .bind(upstream.registry_id)
            .bind(upstream.group_id)
            .bind(&upstream.registry_type)
            .bind(&upstream.name)
            .bind(upstream.registry_id)
            .bind(&upstream.url)
            .bind(&upstream.project_gid)
            .bind(&upstream.username)
            .bind(&upstream.password)
            .bind(upstream.cache_validity_hours)
            .bind(upstream.created_at)
            .bind(upstream.updated_at)
            .fetch_one(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn get_upstream(&self, upstream_id: Uuid) -> MetadataResult<Option<UpstreamRow>> {
            let row =
                sqlx::query_as::<_, UpstreamRow>("SELECT * FROM upstreams WHERE upstream_id = ?")
                    .bind(upstream_id)
                    .fetch_optional(&self.pool)
                    .await?;
            Ok(row)
        }

        async fn list_upstreams(&self, registry_id: Uuid) -> MetadataResult<Vec<UpstreamRow>> {
            let rows = sqlx::query_as::<_, UpstreamRow>(
                "SELECT * FROM upstreams WHERE registry_id = ? ORDER BY position, created_at",
            )
            .bind(registry_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn list_group_upstreams(
            &self,
            group_id: Uuid,
            registry_type: &str,
        ) -> MetadataResult<Vec<UpstreamRow>> {
            let rows = sqlx::query_as::<_, UpstreamRow>(
                r#"
                SELECT * FROM upstreams
                WHERE group_id = ? AND registry_type = ?
                ORDER BY registry_id, position
                "#,
            )
            .bind(group_id)
            .bind(registry_type)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn update_upstream(
            &self,
            upstream_id: Uuid,
            update: &UpstreamUpdate,
        ) -> MetadataResult<UpstreamRow> {
            let mut tx = self.pool.begin().await?;

            let mut row = sqlx::query_as::<_, UpstreamRow>(
                "SELECT * FROM upstreams WHERE upstream_id = ?",
            )
            .bind(upstream_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| MetadataError::NotFound(format!("upstream {upstream_id}")))?;

            if let Some(name) = &update.name {
                row.name = name.clone();
            }
            if let Some(url) = &update.url {
                if row.project_gid.is_some() {
                    return Err(MetadataError::Constraint(
                        "local upstreams have no url".to_string(),
                    ));
                }
                row.url = Some(url.clone());
            }
            if let Some(credentials) = &update.credentials {
                let (username, password) = match credentials {
                    Some((u, p)) => (Some(u.clone()), Some(p.clone())),
                    None => (None, None),
                };
                row.username = username;
                row.password = password;
            }
            if let Some(hours) = update.cache_validity_hours {
                row.cache_validity_hours = hours;
            }
            row.updated_at = OffsetDateTime::now_utc();

            sqlx::query(
                r#"
                UPDATE upstreams
                SET name = ?, url = ?, username = ?, password = ?, cache_validity_hours = ?, updated_at = ?
                WHERE upstream_id = ?
                "#,
            )
            .bind(&row.name)
            .bind(&row.url)
            .bind(&row.username)
            .bind(&row.password)
            .bind(row.cache_validity_hours)
            .bind(row.updated_at)
            .bind(upstream_id)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(row)
        }

        async fn move_upstream(&self, upstream_id: Uuid, position: i64) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;

            let registry_id: Uuid =
                sqlx::query_scalar("SELECT registry_id FROM upstreams WHERE upstream_id = ?")
                    .bind(upstream_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("upstream {upstream_id}")))?;

            let mut ordered = ordered_upstream_ids(&mut tx, registry_id).await?;
            ordered.retain(|id| *id != upstream_id);
            let index = usize::try_from(position.max(1) - 1)
                .unwrap_or(0)
                .min(ordered.len());
            ordered.insert(index, upstream_id);
            renumber(&mut tx, &ordered).await?;

            tx.commit().await?;
            Ok(())
        }

        async fn delete_upstream(&self, upstream_id: Uuid) -> MetadataResult<(u64, u64)> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let registry_id: Uuid =
                sqlx::query_scalar("SELECT registry_id FROM upstreams WHERE upstream_id = ?")
                    .bind(upstream_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| MetadataError::NotFound(format!("upstream {upstream_id}")))?;

            let marked = mark_upstream_entries(&mut tx, upstream_id, now).await?;

            sqlx::query("DELETE FROM upstreams WHERE upstream_id = ?")
                .bind(upstream_id)
                .execute(&mut *tx)
                .await?;

            let remaining = ordered_upstream_ids(&mut tx, registry_id).await?;
            renumber(&mut tx, &remaining).await?;

            tx.commit().await?;
            Ok(marked)
        }
    }

    #[async_trait]
    impl CacheEntryRepo for SqliteStore {
        async fn create_cache_entry(
            &self,
            entry: &NewCacheEntry,
        ) -> MetadataResult<CacheEntryRow> {
            let now = OffsetDateTime::now_utc();
            let row = sqlx::query_as::<_, CacheEntryRow>(INSERT_ENTRY_SQL)
                .bind(Uuid::new_v4())
                .bind(entry.upstream_id)
                .bind(entry.group_id)
                .bind(&entry.registry_type)
                .bind(&entry.relative_path)
                .bind(&entry.object_key)
                .bind(&entry.content_type)
                .bind(entry.size_bytes)
                .bind(&entry.upstream_etag)
                .bind(&entry.upstream_last_modified)
                .bind(&entry.file_sha256)
                .bind(entry.downloaded_at)
                .bind(entry.downloaded_at)
                .bind(now)
                .bind(now)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    MetadataError::from_unique(e, || {
                        format!(
                            "live cache entry already exists for upstream {} path {}",
                            entry.upstream_id, entry.relative_path
                        )
                    })
                })?;
            Ok(row)
        }

        async fn upsert_cache_entry(&self, entry: &NewCacheEntry) -> MetadataResult<UpsertedEntry> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE upstream_id = ? AND relative_path = ? AND status = 'default'
                "#,
            )
            .bind(entry.upstream_id)
            .bind(&entry.relative_path)
            .fetch_optional(&mut *tx)
            .await?;

            let result = match existing {
                Some(existing) => {
                    let row = sqlx::query_as::<_, CacheEntryRow>(
                        r#"
                        UPDATE cache_entries
                        SET object_key = ?, content_type = ?, size_bytes = ?, upstream_etag = ?,
                            upstream_last_modified = ?, file_sha256 = ?, downloaded_at = ?,
                            upstream_checked_at = ?, updated_at = ?
                        WHERE entry_id = ?
                        RETURNING *
                        "#,
                    )
                    .bind(&entry.object_key)
                    .bind(&entry.content_type)
                    .bind(entry.size_bytes)
                    .bind(&entry.upstream_etag)
                    .bind(&entry.upstream_last_modified)
                    .bind(&entry.file_sha256)
                    .bind(entry.downloaded_at)
                    .bind(entry.downloaded_at)
                    .bind(now)
                    .bind(existing.entry_id)
                    .fetch_one(&mut *tx)
                    .await?;
                    let replaced = (existing.object_key != row.object_key)
                        .then_some(existing.object_key);
                    UpsertedEntry {
                        entry: row,
                        replaced_object_key: replaced,
                    }
                }
                None => {
                    let row = sqlx::query_as::<_, CacheEntryRow>(INSERT_ENTRY_SQL)
                        .bind(Uuid::new_v4())
                        .bind(entry.upstream_id)
                        .bind(entry.group_id)
                        .bind(&entry.registry_type)
                        .bind(&entry.relative_path)
                        .bind(&entry.object_key)
                        .bind(&entry.content_type)
                        .bind(entry.size_bytes)
                        .bind(&entry.upstream_etag)
                        .bind(&entry.upstream_last_modified)
                        .bind(&entry.file_sha256)
                        .bind(entry.downloaded_at)
                        .bind(entry.downloaded_at)
                        .bind(now)
                        .bind(now)
                        .fetch_one(&mut *tx)
                        .await?;
                    UpsertedEntry {
                        entry: row,
                        replaced_object_key: None,
                    }
                }
            };

            tx.commit().await?;
            Ok(result)
        }

        async fn find_live_entry(
            &self,
            upstream_id: Uuid,
            relative_path: &str,
        ) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE upstream_id = ? AND relative_path = ? AND status = 'default'
                "#,
            )
            .bind(upstream_id)
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn find_live_entries_for_path(
            &self,
            upstream_ids: &[Uuid],
            relative_path: &str,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            if upstream_ids.is_empty() {
                return Ok(Vec::new());
            }

            let mut builder = sqlx::QueryBuilder::<Sqlite>::new(
                "SELECT * FROM cache_entries WHERE status = 'default' AND relative_path = ",
            );
            builder.push_bind(relative_path);
            builder.push(" AND upstream_id IN (");
            let mut separated = builder.separated(", ");
            for id in upstream_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let rows = builder
                .build_query_as::<CacheEntryRow>()
                .fetch_all(&self.pool)
                .await?;
            Ok(rows)
        }

        async fn get_cache_entry(&self, entry_id: Uuid) -> MetadataResult<Option<CacheEntryRow>> {
            let row = sqlx::query_as::<_, CacheEntryRow>(
                "SELECT * FROM cache_entries WHERE entry_id = ?",
            )
            .bind(entry_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn list_cache_entries(
            &self,
            upstream_id: Uuid,
            limit: u32,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE upstream_id = ?
                ORDER BY julianday(downloaded_at) DESC
                LIMIT ?
                "#,
            )
            .bind(upstream_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn touch_upstream_checked(
            &self,
            entry_id: Uuid,
            checked_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            sqlx::query(
                "UPDATE cache_entries SET upstream_checked_at = ?, updated_at = ? WHERE entry_id = ?",
            )
            .bind(checked_at)
            .bind(checked_at)
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn find_eligible_for_cleanup(
            &self,
            upstream_id: Uuid,
            cutoff: OffsetDateTime,
            batch_size: u32,
            after: Option<Uuid>,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            let rows = sqlx::query_as::<_, CacheEntryRow>(
                r#"
                SELECT * FROM cache_entries
                WHERE upstream_id = ?
                  AND status = 'default'
                  AND julianday(downloaded_at) < julianday(?)
                  AND (? IS NULL OR entry_id > ?)
                ORDER BY entry_id
                LIMIT ?
                "#,
            )
            .bind(upstream_id)
            .bind(cutoff)
            .bind(after)
            .bind(after)
            .bind(i64::from(batch_size))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn mark_pending_destruction(
            &self,
            entry_ids: &[Uuid],
            cutoff: OffsetDateTime,
        ) -> MetadataResult<Vec<CacheEntryRow>> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;

            let mut marked = Vec::with_capacity(entry_ids.len());
            for entry_id in entry_ids {
                let row = sqlx::query_as::<_, CacheEntryRow>(
                    r#"
                    UPDATE cache_entries
                    SET status = 'pending_destruction', updated_at = ?
                    WHERE entry_id = ?
                      AND status = 'default'
                      AND julianday(downloaded_at) < julianday(?)
                    RETURNING *
                    "#,
                )
                .bind(now)
                .bind(entry_id)
                .bind(cutoff)
                .fetch_optional(&mut *tx)
                .await?;
                marked.extend(row);
            }

            tx.commit().await?;
            Ok(marked)
        }

        async fn count_live_entries(&self, upstream_id: Uuid) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM cache_entries WHERE upstream_id = ? AND status = 'default'",
            )
            .bind(upstream_id)
            .fetch_one(&self.pool)
            .await?;
            Ok(to_u64(count))
        }
    }

    #[async_trait]
    impl CleanupPolicyRepo for SqliteStore {
        async fn upsert_cleanup_policy(
            &self,
            policy: &CleanupPolicyRow,
        ) -> MetadataResult<CleanupPolicyRow> {
            let row = sqlx::query_as::<_, CleanupPolicyRow>(
                r#"
                INSERT INTO cleanup_policies (
                    group_id, enabled, keep_n_days_after_download, cadence,
                    notify_on_success, notify_on_failure, status, next_run_at,
                    last_run_at, last_run_deleted_entries_count, last_run_deleted_size,
                    last_run_detailed_metrics, failure_message, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, 'scheduled', ?, NULL, 0, 0, NULL, NULL, ?, ?)
                ON CONFLICT(group_id) DO UPDATE SET
                    enabled = excluded.enabled,
                    keep_n_days_after_download = excluded.keep_n_days_after_download,
                    cadence = excluded.cadence,
                    notify_on_success = excluded.notify_on_success,
                    notify_on_failure = excluded.notify_on_failure,
                    status = CASE WHEN cleanup_policies.status = 'running'
                        THEN 'running' ELSE 'scheduled' END,
                    failure_message = CASE WHEN cleanup_policies.status = 'running'
                        THEN cleanup_policies.failure_message ELSE NULL END,
                    next_run_at = excluded.next_run_at,
                    updated_at = excluded.updated_at
                RETURNING *
                "#,
            )
            .bind(policy.group_id)
            .bind(policy.enabled)
            .bind(policy.keep_n_days_after_download)
            .bind(policy.cadence)
            .bind(policy.notify_on_success)
            .bind(policy.notify_on_failure)
            .bind(policy.next_run_at)
            .bind(policy.created_at)
            .bind(policy.updated_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(row)
        }

        async fn get_cleanup_policy(
            &self,
            group_id: Uuid,
        ) -> MetadataResult<Option<CleanupPolicyRow>> {
            let row = sqlx::query_as::<_, CleanupPolicyRow>(
                "SELECT * FROM cleanup_policies WHERE group_id = ?",
            )
            .bind(group_id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn delete_cleanup_policy(&self, group_id: Uuid) -> MetadataResult<()> {
            let result = sqlx::query("DELETE FROM cleanup_policies WHERE group_id = ?")
                .bind(group_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "cleanup policy for group {group_id}"
                )));
            }
            Ok(())
        }

        async fn next_runnable_schedule(
            &self,
            now: OffsetDateTime,
            limit: u32,
        ) -> MetadataResult<Vec<CleanupPolicyRow>> {
            let rows = sqlx::query_as::<_, CleanupPolicyRow>(
                r#"
                SELECT * FROM cleanup_policies
                WHERE enabled = 1
                  AND status = 'scheduled'
                  AND next_run_at IS NOT NULL
                  AND julianday(next_run_at) <= julianday(?)
                ORDER BY julianday(next_run_at)
                LIMIT ?
                "#,
            )
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }

        async fn claim_cleanup_run(
            &self,
            group_id: Uuid,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                UPDATE cleanup_policies
                SET status = 'running', updated_at = ?
                WHERE group_id = ? AND status = 'scheduled'
                "#,
            )
            .bind(now)
            .bind(group_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn finish_cleanup_run(
            &self,
            group_id: Uuid,
            record: &CleanupRunRecord,
        ) -> MetadataResult<()> {
            let next_status = if record.failure_message.is_some() {
                "failed"
            } else {
                "scheduled"
            };
            let metrics_json = record
                .metrics
                .to_json()
                .map_err(|e| MetadataError::Internal(e.to_string()))?;

            let result = sqlx::query(
                r#"
                UPDATE cleanup_policies
                SET status = ?, last_run_at = ?, next_run_at = ?,
                    last_run_deleted_entries_count = ?, last_run_deleted_size = ?,
                    last_run_detailed_metrics = ?, failure_message = ?, updated_at = ?
                WHERE group_id = ? AND status = 'running'
                "#,
            )
            .bind(next_status)
            .bind(record.finished_at)
            .bind(record.next_run_at)
            .bind(to_i64(record.deleted_entries_count))
            .bind(to_i64(record.deleted_size))
            .bind(metrics_json)
            .bind(&record.failure_message)
            .bind(record.finished_at)
            .bind(group_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                let current: Option<String> =
                    sqlx::query_scalar("SELECT status FROM cleanup_policies WHERE group_id = ?")
                        .bind(group_id)
                        .fetch_optional(&self.pool)
                        .await?;
                return match current {
                    Some(from) => Err(MetadataError::InvalidStateTransition {
                        from,
                        to: next_status.to_string(),
                    }),
                    None => Err(MetadataError::NotFound(format!(
                        "cleanup policy for group {group_id}"
                    ))),
                };
            }
            Ok(())
        }
        async fn fail_orphaned_cleanup_runs(
            &self,
            message: &str,
            now: OffsetDateTime,
        ) -> MetadataResult<Vec<Uuid>> {
            let groups = sqlx::query_scalar(
                r#"
                UPDATE cleanup_policies
                SET status = 'failed', failure_message = ?, updated_at = ?
                WHERE status = 'running'
                RETURNING group_id
                "#,
            )
            .bind(message)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(groups)
        }
    }

    #[async_trait]
    impl AuditRepo for SqliteStore {
        async fn record_audit_event(&self, event: &AuditEventRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO audit_events (event_id, event_name, group_id, target_type, target_id, details, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event.event_id)
            .bind(&event.event_name)
            .bind(event.group_id)
            .bind(&event.target_type)
            .bind(&event.target_id)
            .bind(&event.details)
            .bind(event.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn list_audit_events(
            &self,
            group_id: Uuid,
            limit: u32,
        ) -> MetadataResult<Vec<AuditEventRow>> {
            let rows = sqlx::query_as::<_, AuditEventRow>(
                r#"
                SELECT * FROM audit_events
                WHERE group_id = ?
                ORDER BY julianday(created_at) DESC, rowid DESC
                LIMIT ?
                "#,
            )
            .bind(group_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl PackageFileRepo for SqliteStore {
        async fn upsert_package_file(
            &self,
            file: &PackageFileRow,
        ) -> MetadataResult<Option<String>> {
            let mut tx = self.pool.begin().await?;

            let previous: Option<String> = sqlx::query_scalar(
                "SELECT object_key FROM package_files WHERE project_gid = ? AND relative_path = ?",
            )
            .bind(&file.project_gid)
            .bind(&file.relative_path)
            .fetch_optional(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO package_files (
                    package_file_id, project_gid, relative_path, object_key,
                    content_type, size_bytes, file_sha256, created_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(project_gid, relative_path) DO UPDATE SET
                    object_key = excluded.object_key,
                    content_type = excluded.content_type,
                    size_bytes = excluded.size_bytes,
                    file_sha256 = excluded.file_sha256,
                    created_at = excluded.created_at
                "#,
            )
            .bind(file.package_file_id)
            .bind(&file.project_gid)
            .bind(&file.relative_path)
            .bind(&file.object_key)
            .bind(&file.content_type)
            .bind(file.size_bytes)
            .bind(&file.file_sha256)
            .bind(file.created_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(previous.filter(|key| *key != file.object_key))
        }

        async fn find_package_file(
            &self,
            project_gid: &str,
            relative_path: &str,
        ) -> MetadataResult<Option<PackageFileRow>> {
            let row = sqlx::query_as::<_, PackageFileRow>(
                "SELECT * FROM package_files WHERE project_gid = ? AND relative_path = ?",
            )
            .bind(project_gid)
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }
    }

    #[async_trait]
    impl TokenRepo for SqliteStore {
        async fn create_token(&self, token: &TokenRow) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO tokens (
                    token_id, group_id, token_hash, scopes, expires_at,
                    revoked_at, created_at, last_used_at, description
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(token.token_id)
            .bind(token.group_id)
            .bind(&token.token_hash)
            .bind(&token.scopes)
            .bind(token.expires_at)
            .bind(token.revoked_at)
            .bind(token.created_at)
            .bind(token.last_used_at)
            .bind(&token.description)
            .execute(&self.pool)
            .await
            .map_err(|e| MetadataError::from_unique(e, || "token hash already in use".into()))?;
            Ok(())
        }

        async fn get_token_by_hash(&self, token_hash: &str) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_hash = ?")
                .bind(token_hash)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_token(&self, token_id: Uuid) -> MetadataResult<Option<TokenRow>> {
            let row = sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens WHERE token_id = ?")
                .bind(token_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn touch_token(&self, token_id: Uuid, used_at: OffsetDateTime) -> MetadataResult<()> {
            sqlx::query("UPDATE tokens SET last_used_at = ? WHERE token_id = ?")
                .bind(used_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            Ok(())
        }

        async fn revoke_token(
            &self,
            token_id: Uuid,
            revoked_at: OffsetDateTime,
        ) -> MetadataResult<()> {
            let result = sqlx::query("UPDATE tokens SET revoked_at = ? WHERE token_id = ?")
                .bind(revoked_at)
                .bind(token_id)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("token {token_id}")));
            }
            Ok(())
        }

        async fn list_tokens(&self, group_id: Option<Uuid>) -> MetadataResult<Vec<TokenRow>> {
            let rows = match group_id {
                Some(id) => {
                    sqlx::query_as::<_, TokenRow>(
                        "SELECT * FROM tokens WHERE group_id = ? ORDER BY created_at DESC",
                    )
                    .bind(id)
                    .fetch_all(&self.pool)
                    .await?
                }
                None => {
                    sqlx::query_as::<_, TokenRow>("SELECT * FROM tokens ORDER BY created_at DESC")
                        .fetch_all(&self.pool)
                        .await?
                }
            };
            Ok(rows)
        }
    }

    #[async_trait]
    impl BootstrapRepo for SqliteStore {
        async fn get_bootstrap_token_id(&self) -> MetadataResult<Option<Uuid>> {
            let value: Option<Option<String>> =
                sqlx::query_scalar("SELECT bootstrap_token_id FROM bootstrap_state WHERE id = 1")
                    .fetch_optional(&self.pool)
                    .await?;
            value
                .flatten()
                .filter(|id| !id.is_empty())
                .map(|id| {
                    Uuid::parse_str(&id).map_err(|e| {
                        MetadataError::Internal(format!(
                            "invalid bootstrap_token_id uuid '{id}': {e}"
                        ))
                    })
                })
                .transpose()
        }

        async fn set_bootstrap_token_id(&self, token_id: Uuid) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO bootstrap_state (id, bootstrap_token_id)
                VALUES (1, ?)
                ON CONFLICT(id) DO UPDATE
                SET bootstrap_token_id = excluded.bootstrap_token_id
                "#,
            )
            .bind(token_id.to_string())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn clear_bootstrap_token_id(&self) -> MetadataResult<()> {
            sqlx::query("UPDATE bootstrap_state SET bootstrap_token_id = NULL WHERE id = 1")
                .execute(&self.pool)
                .await?;
            Ok(())
        }
    }

    #[async_trait]
    impl LeaseRepo for SqliteStore {
        async fn try_acquire_lease(
            &self,
            key: &str,
            holder: &str,
            now: OffsetDateTime,
            expires_at: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                r#"
                INSERT INTO leases (lease_key, holder, expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(lease_key) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
                WHERE julianday(leases.expires_at) <= julianday(?)
                "#,
            )
            .bind(key)
            .bind(holder)
            .bind(expires_at)
            .bind(now)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() == 1)
        }

        async fn release_lease(&self, key: &str, holder: &str) -> MetadataResult<bool> {
            let result = sqlx::query("DELETE FROM leases WHERE lease_key = ? AND holder = ?")
                .bind(key)
                .bind(holder)
                .execute(&self.pool)
                .await?;
            Ok(result.rows_affected() == 1)
        }
    }
}

const INSERT_ENTRY_SQL: &str = r#"
INSERT INTO cache_entries (
    entry_id, upstream_id, group_id, registry_type, relative_path, object_key,
    content_type, size_bytes, upstream_etag, upstream_last_modified, file_sha256,
    downloaded_at, upstream_checked_at, status, created_at, updated_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'default', ?, ?)
RETURNING *
"#;

/// SQL schema for SQLite.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS registries (
    registry_id BLOB PRIMARY KEY,
    group_id BLOB NOT NULL,
    name TEXT NOT NULL,
    registry_type TEXT NOT NULL CHECK (registry_type IN ('maven', 'container')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_registries_group_name
    ON registries(group_id, registry_type, name);

CREATE TABLE IF NOT EXISTS upstreams (
    upstream_id BLOB PRIMARY KEY,
    registry_id BLOB NOT NULL REFERENCES registries(registry_id),
    group_id BLOB NOT NULL,
    registry_type TEXT NOT NULL,
    name TEXT NOT NULL,
    position INTEGER NOT NULL,
    url TEXT,
    project_gid TEXT,
    username TEXT,
    password TEXT,
    cache_validity_hours INTEGER NOT NULL DEFAULT 24,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    CHECK ((url IS NULL) <> (project_gid IS NULL))
);
CREATE INDEX IF NOT EXISTS idx_upstreams_registry ON upstreams(registry_id, position);
CREATE INDEX IF NOT EXISTS idx_upstreams_group ON upstreams(group_id, registry_type);

-- No foreign key to upstreams: entries outlive a deleted upstream as pending rows.
CREATE TABLE IF NOT EXISTS cache_entries (
    entry_id BLOB PRIMARY KEY,
    upstream_id BLOB NOT NULL,
    group_id BLOB NOT NULL,
    registry_type TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    object_key TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    upstream_etag TEXT,
    upstream_last_modified TEXT,
    file_sha256 TEXT NOT NULL,
    downloaded_at TEXT NOT NULL,
    upstream_checked_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'default'
        CHECK (status IN ('default', 'pending_destruction')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
-- At most one live entry per (upstream, path)
CREATE UNIQUE INDEX IF NOT EXISTS idx_cache_entries_live
    ON cache_entries(upstream_id, relative_path) WHERE status = 'default';
CREATE INDEX IF NOT EXISTS idx_cache_entries_cleanup
    ON cache_entries(upstream_id, status, entry_id);

CREATE TABLE IF NOT EXISTS cleanup_policies (
    group_id BLOB PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 0,
    keep_n_days_after_download INTEGER NOT NULL
        CHECK (keep_n_days_after_download BETWEEN 1 AND 365),
    cadence INTEGER NOT NULL CHECK (cadence IN (1, 7, 14, 30, 90)),
    notify_on_success INTEGER NOT NULL DEFAULT 0,
    notify_on_failure INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'scheduled'
        CHECK (status IN ('scheduled', 'running', 'failed')),
    next_run_at TEXT,
    last_run_at TEXT,
    last_run_deleted_entries_count INTEGER NOT NULL DEFAULT 0,
    last_run_deleted_size INTEGER NOT NULL DEFAULT 0,
    last_run_detailed_metrics TEXT,
    failure_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cleanup_policies_schedule
    ON cleanup_policies(status, next_run_at) WHERE enabled = 1;

CREATE TABLE IF NOT EXISTS audit_events (
    event_id BLOB PRIMARY KEY,
    event_name TEXT NOT NULL,
    group_id BLOB,
    target_type TEXT NOT NULL,
    target_id TEXT,
    details TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_events_group ON audit_events(group_id, created_at);

CREATE TABLE IF NOT EXISTS package_files (
    package_file_id BLOB PRIMARY KEY,
    project_gid TEXT NOT NULL,
    relative_path TEXT NOT NULL,
    object_key TEXT NOT NULL,
    content_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    file_sha256 TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_package_files_path
    ON package_files(project_gid, relative_path);

CREATE TABLE IF NOT EXISTS tokens (
    token_id BLOB PRIMARY KEY,
    group_id BLOB,
    token_hash TEXT NOT NULL UNIQUE,
    scopes TEXT NOT NULL,
    expires_at TEXT,
    revoked_at TEXT,
    created_at TEXT NOT NULL,
    last_used_at TEXT,
    description TEXT
);
CREATE INDEX IF NOT EXISTS idx_tokens_group ON tokens(group_id);

CREATE TABLE IF NOT EXISTS bootstrap_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    bootstrap_token_id TEXT
);

CREATE TABLE IF NOT EXISTS leases (
    lease_key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use crate::repos::NewCacheEntry;
    use time::{Duration as TimeDuration, OffsetDateTime};
    use uuid::Uuid;
    use vreg_core::{CleanupMetrics, RegistryType};

    async fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"), None)
            .await
            .unwrap();
        (dir, store)
    }

    fn new_entry(upstream_id: Uuid, path: &str, downloaded_at: OffsetDateTime) -> NewCacheEntry {
        NewCacheEntry {
            upstream_id,
            group_id: Uuid::nil(),
            registry_type: "maven".to_string(),
            relative_path: path.to_string(),
            object_key: format!("cache/maven/{upstream_id}/{}", Uuid::new_v4()),
            content_type: "application/java-archive".to_string(),
            size_bytes: 100,
            upstream_etag: Some("\"v1\"".to_string()),
            upstream_last_modified: None,
            file_sha256: "00".repeat(32),
            downloaded_at,
        }
    }

    async fn registry_with_upstreams(store: &SqliteStore, n: usize) -> (RegistryRow, Vec<UpstreamRow>) {
        let now = OffsetDateTime::now_utc();
        let registry = RegistryRow {
            registry_id: Uuid::new_v4(),
            group_id: Uuid::new_v4(),
            name: "maven-virtual".to_string(),
            registry_type: "maven".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.create_registry(&registry).await.unwrap();

        let mut upstreams = Vec::new();
        for i in 0..n {
            let row = UpstreamRow {
                upstream_id: Uuid::new_v4(),
                registry_id: registry.registry_id,
                group_id: registry.group_id,
                registry_type: "maven".to_string(),
                name: format!("upstream-{i}"),
                position: 0,
                url: Some(format!("https://repo{i}.example.com/maven2")),
                project_gid: None,
                username: None,
                password: None,
                cache_validity_hours: 24,
                created_at: now,
                updated_at: now,
            };
            upstreams.push(store.create_upstream(&row, 20).await.unwrap());
        }
        (registry, upstreams)
    }

    #[tokio::test]
    async fn test_duplicate_live_entry_rejected() {
        let (_dir, store) = store().await;
        let upstream_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        store
            .create_cache_entry(&new_entry(upstream_id, "com/x/1.0/a.jar", now))
            .await
            .unwrap();
        let err = store
            .create_cache_entry(&new_entry(upstream_id, "com/x/1.0/a.jar", now))
            .await
            .unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)), "got {err:?}");

        // Same path on another upstream is a different artifact.
        store
            .create_cache_entry(&new_entry(Uuid::new_v4(), "com/x/1.0/a.jar", now))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_entry_frees_the_path() {
        let (_dir, store) = store().await;
        let upstream_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let first = store
            .create_cache_entry(&new_entry(upstream_id, "a/b.pom", now))
            .await
            .unwrap();
        store
            .mark_pending_destruction(&[first.entry_id], now + TimeDuration::seconds(1))
            .await
            .unwrap();

        let second = store
            .create_cache_entry(&new_entry(upstream_id, "a/b.pom", now))
            .await
            .unwrap();
        assert_ne!(first.entry_id, second.entry_id);
        assert_eq!(
            store
                .find_live_entry(upstream_id, "a/b.pom")
                .await
                .unwrap()
                .unwrap()
                .entry_id,
            second.entry_id
        );
    }

    #[tokio::test]
    async fn test_upsert_updates_in_place() {
        let (_dir, store) = store().await;
        let upstream_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let first = store
            .upsert_cache_entry(&new_entry(upstream_id, "a/b.jar", now))
            .await
            .unwrap();
        assert!(first.replaced_object_key.is_none());

        let mut second_input = new_entry(upstream_id, "a/b.jar", now);
        second_input.upstream_etag = Some("\"v2\"".to_string());
        let second = store.upsert_cache_entry(&second_input).await.unwrap();

        assert_eq!(second.entry.entry_id, first.entry.entry_id);
        assert_eq!(second.entry.upstream_etag.as_deref(), Some("\"v2\""));
        assert_eq!(
            second.replaced_object_key.as_deref(),
            Some(first.entry.object_key.as_str())
        );
        assert_eq!(store.count_live_entries(upstream_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_eligibility_excludes_recent_and_pending() {
        let (_dir, store) = store().await;
        let upstream_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let old_a = store
            .create_cache_entry(&new_entry(upstream_id, "old/a", now - TimeDuration::days(40)))
            .await
            .unwrap();
        let old_b = store
            .create_cache_entry(&new_entry(upstream_id, "old/b", now - TimeDuration::days(35)))
            .await
            .unwrap();
        store
            .create_cache_entry(&new_entry(upstream_id, "new/c", now - TimeDuration::days(10)))
            .await
            .unwrap();

        let cutoff = now - TimeDuration::days(30);
        let eligible = store
            .find_eligible_for_cleanup(upstream_id, cutoff, 10, None)
            .await
            .unwrap();
        let mut ids: Vec<_> = eligible.iter().map(|e| e.entry_id).collect();
        ids.sort();
        let mut expected = vec![old_a.entry_id, old_b.entry_id];
        expected.sort();
        assert_eq!(ids, expected);

        let marked = store.mark_pending_destruction(&ids, cutoff).await.unwrap();
        assert_eq!(marked.len(), 2);
        assert_eq!(marked.iter().map(|e| e.size_bytes).sum::<i64>(), 200);
        assert!(marked.iter().all(|e| !e.is_live()));

        // Marking again is a no-op and nothing remains eligible.
        assert!(store.mark_pending_destruction(&ids, cutoff).await.unwrap().is_empty());
        assert!(
            store
                .find_eligible_for_cleanup(upstream_id, cutoff, 10, None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_refilled_entry_is_not_marked() {
        let (_dir, store) = store().await;
        let upstream_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        store
            .create_cache_entry(&new_entry(upstream_id, "a/b.jar", now - TimeDuration::days(40)))
            .await
            .unwrap();
        let cutoff = now - TimeDuration::days(30);
        let eligible = store
            .find_eligible_for_cleanup(upstream_id, cutoff, 10, None)
            .await
            .unwrap();
        assert_eq!(eligible.len(), 1);

        // The artifact is downloaded again between selection and marking.
        store
            .upsert_cache_entry(&new_entry(upstream_id, "a/b.jar", OffsetDateTime::now_utc()))
            .await
            .unwrap();

        let marked = store
            .mark_pending_destruction(&[eligible[0].entry_id], cutoff)
            .await
            .unwrap();
        assert!(marked.is_empty());
        assert!(
            store
                .find_live_entry(upstream_id, "a/b.jar")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn test_eligibility_keyset_pages() {
        let (_dir, store) = store().await;
        let upstream_id = Uuid::new_v4();
        let old = OffsetDateTime::now_utc() - TimeDuration::days(100);
        for i in 0..5 {
            store
                .create_cache_entry(&new_entry(upstream_id, &format!("p/{i}"), old))
                .await
                .unwrap();
        }

        let cutoff = OffsetDateTime::now_utc();
        let first = store
            .find_eligible_for_cleanup(upstream_id, cutoff, 2, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        let second = store
            .find_eligible_for_cleanup(upstream_id, cutoff, 2, first.last().map(|e| e.entry_id))
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        assert!(second.iter().all(|e| first.iter().all(|f| f.entry_id < e.entry_id)));
    }

    #[tokio::test]
    async fn test_upstream_positions_and_limit() {
        let (_dir, store) = store().await;
        let (registry, upstreams) = registry_with_upstreams(&store, 3).await;
        let positions: Vec<_> = upstreams.iter().map(|u| u.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);

        store
            .move_upstream(upstreams[2].upstream_id, 1)
            .await
            .unwrap();
        let ordered: Vec<_> = store
            .list_upstreams(registry.registry_id)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.upstream_id)
            .collect();
        assert_eq!(
            ordered,
            vec![
                upstreams[2].upstream_id,
                upstreams[0].upstream_id,
                upstreams[1].upstream_id
            ]
        );

        let mut extra = upstreams[0].clone();
        extra.upstream_id = Uuid::new_v4();
        let err = store.create_upstream(&extra, 3).await.unwrap_err();
        assert!(matches!(err, MetadataError::Constraint(_)));
    }

    #[tokio::test]
    async fn test_delete_upstream_marks_entries_and_closes_gap() {
        let (_dir, store) = store().await;
        let (registry, upstreams) = registry_with_upstreams(&store, 3).await;
        let victim = upstreams[0].upstream_id;
        let now = OffsetDateTime::now_utc();

        store
            .create_cache_entry(&new_entry(victim, "x/1", now))
            .await
            .unwrap();
        store
            .create_cache_entry(&new_entry(victim, "x/2", now))
            .await
            .unwrap();

        assert_eq!(store.delete_upstream(victim).await.unwrap(), (2, 200));
        assert_eq!(store.count_live_entries(victim).await.unwrap(), 0);

        let remaining = store.list_upstreams(registry.registry_id).await.unwrap();
        let positions: Vec<_> = remaining.iter().map(|u| u.position).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_cleanup_policy_state_machine() {
        let (_dir, store) = store().await;
        let group_id = Uuid::new_v4();
        let now = OffsetDateTime::now_utc();

        let policy = CleanupPolicyRow {
            group_id,
            enabled: true,
            keep_n_days_after_download: 30,
            cadence: 7,
            notify_on_success: false,
            notify_on_failure: true,
            status: "scheduled".to_string(),
            next_run_at: Some(now - TimeDuration::minutes(1)),
            last_run_at: None,
            last_run_deleted_entries_count: 0,
            last_run_deleted_size: 0,
            last_run_detailed_metrics: None,
            failure_message: None,
            created_at: now,
            updated_at: now,
        };
        store.upsert_cleanup_policy(&policy).await.unwrap();

        let due = store.next_runnable_schedule(now, 10).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(store.claim_cleanup_run(group_id, now).await.unwrap());
        assert!(!store.claim_cleanup_run(group_id, now).await.unwrap());
        assert!(store.next_runnable_schedule(now, 10).await.unwrap().is_empty());

        // Saving while running keeps the run gate.
        let saved = store.upsert_cleanup_policy(&policy).await.unwrap();
        assert_eq!(saved.status, "running");

        let mut metrics = CleanupMetrics::new();
        metrics.record(RegistryType::Maven, 2, 300);
        let record = CleanupRunRecord {
            finished_at: now,
            next_run_at: now + TimeDuration::days(7),
            deleted_entries_count: 2,
            deleted_size: 300,
            metrics,
            failure_message: None,
        };
        store.finish_cleanup_run(group_id, &record).await.unwrap();

        let row = store.get_cleanup_policy(group_id).await.unwrap().unwrap();
        assert_eq!(row.status, "scheduled");
        assert_eq!(row.last_run_deleted_entries_count, 2);
        assert_eq!(
            row.detailed_metrics().unwrap().unwrap().get(RegistryType::Maven).deleted_size,
            300
        );
        assert!(store.next_runnable_schedule(now, 10).await.unwrap().is_empty());

        // Finishing again is not a valid transition.
        let err = store.finish_cleanup_run(group_id, &record).await.unwrap_err();
        assert!(matches!(err, MetadataError::InvalidStateTransition { .. }));
    }

    #[tokio::test]
    async fn test_leases_exclusive_until_expiry() {
        let (_dir, store) = store().await;
        let now = OffsetDateTime::now_utc();
        let ttl = TimeDuration::seconds(30);

        assert!(store.try_acquire_lease("k", "a", now, now + ttl).await.unwrap());
        assert!(!store.try_acquire_lease("k", "b", now, now + ttl).await.unwrap());

        // Wrong holder cannot release.
        assert!(!store.release_lease("k", "b").await.unwrap());

        // After expiry another holder may take it.
        let later = now + TimeDuration::seconds(31);
        assert!(store.try_acquire_lease("k", "b", later, later + ttl).await.unwrap());
        assert!(store.release_lease("k", "b").await.unwrap());
        assert!(store.try_acquire_lease("k", "c", later, later + ttl).await.unwrap());
    }
}
