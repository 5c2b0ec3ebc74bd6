//! Hierarchy, policy, and scheduling bookkeeping over the sqlite cache.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use elev_core::{
    Classify, ContextPath, EntityKind, ErrorClass, HierarchyEntity, ParseState, PathError,
    RemoteEntity, ScheduleSnapshot, ScopeState, SyncPolicyRow, SyncTarget, UpsertAction,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use thiserror::Error;
use uuid::Uuid;

const ENTITY_COLUMNS: &str =
    "id, external_id, parent_id, name, attributes_json, source_modified_at, last_synced_at, excluded_from_sync";

const TOUCH_CHUNK: usize = 400;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("attribute encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: i64 },
    #[error("elevation {elevation_id} no longer owns artifact {content_hash} in progress")]
    Superseded {
        elevation_id: i64,
        content_hash: String,
    },
    #[error("parse state cannot move from {from} to {to}")]
    IllegalTransition { from: ParseState, to: ParseState },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error(transparent)]
    Path(#[from] PathError),
}

impl Classify for RepositoryError {
    fn class(&self) -> ErrorClass {
        match self {
            RepositoryError::Database(_) => ErrorClass::Persistence,
            RepositoryError::Encoding(_)
            | RepositoryError::NotFound { .. }
            | RepositoryError::Superseded { .. }
            | RepositoryError::IllegalTransition { .. }
            | RepositoryError::Corrupt { .. }
            | RepositoryError::Path(_) => ErrorClass::Validation,
        }
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

pub(crate) fn table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Directory => "directories",
        EntityKind::Project => "projects",
        EntityKind::Phase => "phases",
        EntityKind::Elevation => "elevations",
    }
}

fn scope_key(scope_id: Option<i64>) -> i64 {
    scope_id.unwrap_or(0)
}

pub(crate) fn entity_from_row(kind: EntityKind, row: &SqliteRow) -> RepoResult<HierarchyEntity> {
    let attributes_json: String = row.try_get("attributes_json")?;
    Ok(HierarchyEntity {
        id: row.try_get("id")?,
        kind,
        external_id: row.try_get("external_id")?,
        name: row.try_get("name")?,
        parent_id: row.try_get("parent_id")?,
        attributes: serde_json::from_str(&attributes_json)?,
        source_modified_at: row.try_get("source_modified_at")?,
        last_synced_at: row.try_get("last_synced_at")?,
        excluded_from_sync: row.try_get("excluded_from_sync")?,
    })
}

async fn fetch_child(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    parent_id: Option<i64>,
    external_id: &str,
) -> RepoResult<Option<HierarchyEntity>> {
    let sql = format!(
        "SELECT {ENTITY_COLUMNS} FROM {} WHERE external_id = ? AND parent_id IS ?",
        table(kind)
    );
    let row = sqlx::query(&sql)
        .bind(external_id)
        .bind(parent_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(|r| entity_from_row(kind, &r)).transpose()
}

/// Rows hidden from scheduling and from downstream reads, either directly or
/// through an excluded ancestor.
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    excluded: HashMap<EntityKind, HashSet<i64>>,
}

impl ExclusionSet {
    pub fn contains(&self, kind: EntityKind, id: i64) -> bool {
        self.excluded.get(&kind).is_some_and(|ids| ids.contains(&id))
    }
}

/// Persisted summary of one orchestrated run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunRecord {
    pub run_id: Uuid,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub summary: serde_json::Value,
}

/// All reads and writes against the relational cache.
#[derive(Debug, Clone)]
pub struct EntityRepository {
    pool: SqlitePool,
    reader: SqlitePool,
}

impl EntityRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            reader: pool.clone(),
            pool,
        }
    }

    /// Serve downstream reads from `reader` while writes stay on `pool`.
    pub fn with_reader(pool: SqlitePool, reader: SqlitePool) -> Self {
        Self { pool, reader }
    }

    /// A view of the cache backed by the read pool only.
    pub fn downstream(&self) -> EntityRepository {
        Self::new(self.reader.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, kind: EntityKind, id: i64) -> RepoResult<Option<HierarchyEntity>> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM {} WHERE id = ?", table(kind));
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| entity_from_row(kind, &r)).transpose()
    }

    pub async fn require(&self, kind: EntityKind, id: i64) -> RepoResult<HierarchyEntity> {
        self.get(kind, id)
            .await?
            .ok_or(RepositoryError::NotFound { kind, id })
    }

    pub async fn find_child(
        &self,
        kind: EntityKind,
        parent_id: Option<i64>,
        external_id: &str,
    ) -> RepoResult<Option<HierarchyEntity>> {
        let mut conn = self.pool.acquire().await?;
        fetch_child(&mut conn, kind, parent_id, external_id).await
    }

    pub async fn list_children(
        &self,
        kind: EntityKind,
        parent_id: Option<i64>,
    ) -> RepoResult<Vec<HierarchyEntity>> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM {} WHERE parent_id IS ? ORDER BY external_id, id",
            table(kind)
        );
        let rows = sqlx::query(&sql).bind(parent_id).fetch_all(&self.pool).await?;
        rows.iter().map(|r| entity_from_row(kind, r)).collect()
    }

    /// Insert or refresh one child inside its own short transaction.
    pub async fn upsert_child(
        &self,
        kind: EntityKind,
        parent_id: Option<i64>,
        remote: &RemoteEntity,
        now: DateTime<Utc>,
    ) -> RepoResult<(UpsertAction, i64)> {
        let mut tx = self.pool.begin().await?;
        let existing = fetch_child(&mut tx, kind, parent_id, &remote.external_id).await?;
        let action = remote.reconcile(existing.as_ref());
        let attributes_json = serde_json::to_string(&remote.attributes)?;

        let id = match existing {
            None => {
                let sql = format!(
                    "INSERT INTO {} (external_id, parent_id, name, attributes_json, source_modified_at, last_synced_at, excluded_from_sync, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)",
                    table(kind)
                );
                sqlx::query(&sql)
                    .bind(&remote.external_id)
                    .bind(parent_id)
                    .bind(&remote.name)
                    .bind(&attributes_json)
                    .bind(remote.source_modified_at)
                    .bind(now)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?
                    .last_insert_rowid()
            }
            Some(row) if action == UpsertAction::Update => {
                let sql = format!(
                    "UPDATE {} SET name = ?, attributes_json = ?, source_modified_at = ?, last_synced_at = ?, updated_at = ? WHERE id = ?",
                    table(kind)
                );
                sqlx::query(&sql)
                    .bind(&remote.name)
                    .bind(&attributes_json)
                    .bind(remote.source_modified_at.or(row.source_modified_at))
                    .bind(now)
                    .bind(now)
                    .bind(row.id)
                    .execute(&mut *tx)
                    .await?;
                row.id
            }
            Some(row) => row.id,
        };

        tx.commit().await?;
        Ok((action, id))
    }

    /// Stamp `last_synced_at` on children that a listing reported unchanged.
    pub async fn touch_synced(
        &self,
        kind: EntityKind,
        parent_id: Option<i64>,
        external_ids: &[String],
        now: DateTime<Utc>,
    ) -> RepoResult<u64> {
        let mut touched = 0;
        for chunk in external_ids.chunks(TOUCH_CHUNK) {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "UPDATE {} SET last_synced_at = ",
                table(kind)
            ));
            qb.push_bind(now);
            qb.push(" WHERE parent_id IS ");
            qb.push_bind(parent_id);
            qb.push(" AND excluded_from_sync = 0 AND external_id IN (");
            let mut ids = qb.separated(", ");
            for external_id in chunk {
                ids.push_bind(external_id.clone());
            }
            ids.push_unseparated(")");
            touched += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(touched)
    }

    pub async fn set_excluded(&self, kind: EntityKind, id: i64, excluded: bool) -> RepoResult<()> {
        let sql = format!("UPDATE {} SET excluded_from_sync = ? WHERE id = ?", table(kind));
        let res = sqlx::query(&sql)
            .bind(excluded)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(RepositoryError::NotFound { kind, id });
        }
        Ok(())
    }

    /// Root-to-node external id chain for positioning a source session.
    pub async fn context_path(&self, kind: EntityKind, id: i64) -> RepoResult<ContextPath> {
        let mut chain = Vec::new();
        let mut cursor = Some((kind, id));
        while let Some((k, i)) = cursor {
            let row = self.require(k, i).await?;
            cursor = match (k.parent(), row.parent_id) {
                (Some(pk), Some(pid)) => Some((pk, pid)),
                (None, _) => None,
                (Some(_), None) => {
                    return Err(RepositoryError::Corrupt {
                        table: table(k),
                        detail: format!("row {i} has no parent"),
                    })
                }
            };
            chain.push((k, row.external_id));
        }
        let mut path = ContextPath::root();
        for (k, external_id) in chain.into_iter().rev() {
            path.push(k, external_id)?;
        }
        Ok(path)
    }

    pub async fn exclusions(&self) -> RepoResult<ExclusionSet> {
        let mut set = ExclusionSet::default();
        for kind in EntityKind::ALL {
            let sql = format!("SELECT id, parent_id, excluded_from_sync FROM {}", table(kind));
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            let mut hidden = HashSet::new();
            for row in rows {
                let id: i64 = row.try_get("id")?;
                let parent_id: Option<i64> = row.try_get("parent_id")?;
                let excluded: bool = row.try_get("excluded_from_sync")?;
                let parent_hidden = match (kind.parent(), parent_id) {
                    (Some(pk), Some(pid)) => set.contains(pk, pid),
                    _ => false,
                };
                if excluded || parent_hidden {
                    hidden.insert(id);
                }
            }
            set.excluded.insert(kind, hidden);
        }
        Ok(set)
    }

    pub async fn policy_rows(&self) -> RepoResult<Vec<SyncPolicyRow>> {
        let rows = sqlx::query(
            "SELECT target, interval_secs, staleness_threshold_secs, priority, depends_on, cascade, enabled
               FROM sync_policies
              ORDER BY priority, target",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(policy_from_row).collect()
    }

    pub async fn get_policy(&self, target: &str) -> RepoResult<Option<SyncPolicyRow>> {
        let row = sqlx::query(
            "SELECT target, interval_secs, staleness_threshold_secs, priority, depends_on, cascade, enabled
               FROM sync_policies WHERE target = ?",
        )
        .bind(target)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(policy_from_row).transpose()
    }

    /// Operator write: replaces the stored row.
    pub async fn upsert_policy(&self, row: &SyncPolicyRow, now: DateTime<Utc>) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO sync_policies (target, interval_secs, staleness_threshold_secs, priority, depends_on, cascade, enabled, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(target) DO UPDATE SET
                interval_secs = excluded.interval_secs,
                staleness_threshold_secs = excluded.staleness_threshold_secs,
                priority = excluded.priority,
                depends_on = excluded.depends_on,
                cascade = excluded.cascade,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
        )
        .bind(&row.target)
        .bind(row.interval_secs)
        .bind(row.staleness_threshold_secs)
        .bind(row.priority)
        .bind(&row.depends_on)
        .bind(row.cascade)
        .bind(row.enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Configuration seed: never overwrites an existing (possibly operator-edited) row.
    pub async fn seed_policy(&self, row: &SyncPolicyRow, now: DateTime<Utc>) -> RepoResult<bool> {
        let res = sqlx::query(
            "INSERT OR IGNORE INTO sync_policies (target, interval_secs, staleness_threshold_secs, priority, depends_on, cascade, enabled, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.target)
        .bind(row.interval_secs)
        .bind(row.staleness_threshold_secs)
        .bind(row.priority)
        .bind(&row.depends_on)
        .bind(row.cascade)
        .bind(row.enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    /// Record the outcome of one `(target, scope)` pass and clear its cascade flag.
    pub async fn record_pass(
        &self,
        target: SyncTarget,
        scope_id: Option<i64>,
        now: DateTime<Utc>,
        error: Option<&str>,
    ) -> RepoResult<()> {
        let success_at = if error.is_none() { Some(now) } else { None };
        sqlx::query(
            "INSERT INTO sync_marks (target, scope_id, last_synced_at, last_success_at, last_error, forced)
             VALUES (?, ?, ?, ?, ?, 0)
             ON CONFLICT(target, scope_id) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                last_success_at = COALESCE(excluded.last_success_at, sync_marks.last_success_at),
                last_error = excluded.last_error,
                forced = 0",
        )
        .bind(target.as_str())
        .bind(scope_key(scope_id))
        .bind(now)
        .bind(success_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flag scopes so the next tick picks them up regardless of interval.
    pub async fn force_scopes(&self, target: SyncTarget, scope_ids: &[i64]) -> RepoResult<()> {
        if scope_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for scope_id in scope_ids {
            sqlx::query(
                "INSERT INTO sync_marks (target, scope_id, forced) VALUES (?, ?, 1)
                 ON CONFLICT(target, scope_id) DO UPDATE SET forced = 1",
            )
            .bind(target.as_str())
            .bind(scope_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Everything the scheduler needs for one tick, read in one pass.
    pub async fn schedule_snapshot(&self) -> RepoResult<ScheduleSnapshot> {
        let exclusions = self.exclusions().await?;

        let mut marks: HashMap<(String, i64), ScopeState> = HashMap::new();
        let rows = sqlx::query(
            "SELECT target, scope_id, last_synced_at, last_success_at, forced FROM sync_marks",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in rows {
            let target: String = row.try_get("target")?;
            let scope_id: i64 = row.try_get("scope_id")?;
            marks.insert(
                (target, scope_id),
                ScopeState {
                    scope_id: (scope_id != 0).then_some(scope_id),
                    last_synced_at: row.try_get("last_synced_at")?,
                    last_success_at: row.try_get("last_success_at")?,
                    forced: row.try_get("forced")?,
                },
            );
        }

        let mut synced = BTreeSet::new();
        let mut visible: HashMap<EntityKind, Vec<i64>> = HashMap::new();
        for kind in EntityKind::ALL {
            let sql = format!("SELECT id, last_synced_at FROM {} ORDER BY id", table(kind));
            let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
            let mut ids = Vec::with_capacity(rows.len());
            for row in rows {
                let id: i64 = row.try_get("id")?;
                let last: Option<DateTime<Utc>> = row.try_get("last_synced_at")?;
                if last.is_some() {
                    synced.insert(SyncTarget::from(kind));
                }
                if !exclusions.contains(kind, id) {
                    ids.push(id);
                }
            }
            visible.insert(kind, ids);
        }
        let parsed: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM elevations WHERE parse_state = 'success'")
                .fetch_one(&self.pool)
                .await?;
        if parsed > 0 {
            synced.insert(SyncTarget::Artifact);
        }

        let mut scopes = BTreeMap::new();
        for target in SyncTarget::ALL {
            let scope_ids: Vec<Option<i64>> = match target.scope_kind() {
                None => vec![None],
                Some(kind) => visible
                    .get(&kind)
                    .map(|ids| ids.iter().copied().map(Some).collect())
                    .unwrap_or_default(),
            };
            let states = scope_ids
                .into_iter()
                .map(|scope_id| {
                    marks
                        .get(&(target.as_str().to_string(), scope_key(scope_id)))
                        .cloned()
                        .map(|mut s| {
                            s.scope_id = scope_id;
                            s
                        })
                        .unwrap_or(ScopeState {
                            scope_id,
                            ..ScopeState::default()
                        })
                })
                .collect();
            scopes.insert(target, states);
        }

        Ok(ScheduleSnapshot { scopes, synced })
    }

    pub async fn insert_run(&self, run: &SyncRunRecord) -> RepoResult<()> {
        sqlx::query(
            "INSERT INTO sync_runs (run_id, trigger_kind, started_at, finished_at, status, summary_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(run.run_id.to_string())
        .bind(&run.trigger)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.status)
        .bind(serde_json::to_string(&run.summary)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_runs(&self, limit: i64) -> RepoResult<Vec<SyncRunRecord>> {
        let rows = sqlx::query(
            "SELECT run_id, trigger_kind, started_at, finished_at, status, summary_json
               FROM sync_runs ORDER BY started_at DESC LIMIT ?",
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let run_id: String = row.try_get("run_id")?;
            let summary_json: String = row.try_get("summary_json")?;
            out.push(SyncRunRecord {
                run_id: Uuid::parse_str(&run_id).map_err(|e| RepositoryError::Corrupt {
                    table: "sync_runs",
                    detail: e.to_string(),
                })?,
                trigger: row.try_get("trigger_kind")?,
                started_at: row.try_get("started_at")?,
                finished_at: row.try_get("finished_at")?,
                status: row.try_get("status")?,
                summary: serde_json::from_str(&summary_json)?,
            });
        }
        Ok(out)
    }
}

fn policy_from_row(row: &SqliteRow) -> RepoResult<SyncPolicyRow> {
    Ok(SyncPolicyRow {
        target: row.try_get("target")?,
        interval_secs: row.try_get("interval_secs")?,
        staleness_threshold_secs: row.try_get("staleness_threshold_secs")?,
        priority: row.try_get("priority")?,
        depends_on: row.try_get("depends_on")?,
        cascade: row.try_get("cascade")?,
        enabled: row.try_get("enabled")?,
    })
}
