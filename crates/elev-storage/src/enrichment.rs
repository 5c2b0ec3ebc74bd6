//! Artifact metadata, parse state, derived rows, error log, and downstream reads.

use chrono::{DateTime, Utc};
use elev_core::{
    ArtifactRecord, ElevationDetails, EntityKind, ErrorClass, GlassSpec, HierarchyEntity,
    ParseState, ParseStatus, ParsedArtifact,
};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::repository::{entity_from_row, table, RepoResult, RepositoryError};
use crate::EntityRepository;

const CLAIM_EXPIRED: &str = "parse claim expired before completion";

/// Outcome of registering a freshly fetched artifact against its elevation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactDisposition {
    /// Different hash from the current one; parse state reset to pending.
    New,
    /// Same hash, previous parse never finished successfully.
    Resume(ParseState),
    /// Same hash, already parsed (or terminally rejected). Nothing to do.
    AlreadyProcessed(ParseState),
}

impl ArtifactDisposition {
    pub fn needs_parse(self) -> bool {
        !matches!(self, ArtifactDisposition::AlreadyProcessed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewErrorLog {
    pub occurred_at: DateTime<Utc>,
    pub entity_kind: EntityKind,
    pub entity_id: Option<i64>,
    pub run_id: Option<Uuid>,
    pub stage: String,
    pub class: ErrorClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: i64,
    pub occurred_at: DateTime<Utc>,
    pub entity_kind: String,
    pub entity_id: Option<i64>,
    pub run_id: Option<String>,
    pub stage: String,
    pub error_class: String,
    pub message: String,
}

/// Elevation as served to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElevationView {
    pub entity: HierarchyEntity,
    pub details: ElevationDetails,
    pub glass_specs: Vec<GlassSpec>,
    pub parse: ParseStatus,
}

fn parse_status_from_row(row: &SqliteRow) -> RepoResult<ParseStatus> {
    let state: String = row.try_get("parse_state")?;
    Ok(ParseStatus {
        elevation_id: row.try_get("id")?,
        state: state.parse().map_err(|e: elev_core::UnknownParseState| RepositoryError::Corrupt {
            table: "elevations",
            detail: e.to_string(),
        })?,
        artifact_hash: row.try_get("artifact_hash")?,
        error_message: row.try_get("parse_error")?,
        retry_count: row.try_get("retry_count")?,
        parsed_at: row.try_get("parsed_at")?,
        claimed_at: row.try_get("claimed_at")?,
    })
}

fn details_from_row(row: &SqliteRow) -> RepoResult<ElevationDetails> {
    Ok(ElevationDetails {
        width_mm: row.try_get("width_mm")?,
        height_mm: row.try_get("height_mm")?,
        description: row.try_get("description")?,
        system_code: row.try_get("system_code")?,
        material_code: row.try_get("material_code")?,
    })
}

const STATUS_COLUMNS: &str =
    "id, parse_state, artifact_hash, parse_error, retry_count, parsed_at, claimed_at";

impl EntityRepository {
    /// Register a fetched artifact and decide whether it still needs parsing.
    pub async fn record_artifact(
        &self,
        record: &ArtifactRecord,
        now: DateTime<Utc>,
    ) -> RepoResult<ArtifactDisposition> {
        let mut tx = self.pool().begin().await?;
        let row = sqlx::query("SELECT artifact_hash, parse_state FROM elevations WHERE id = ?")
            .bind(record.elevation_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(RepositoryError::NotFound {
                kind: EntityKind::Elevation,
                id: record.elevation_id,
            })?;
        let current_hash: Option<String> = row.try_get("artifact_hash")?;
        let state: String = row.try_get("parse_state")?;
        let state: ParseState = state.parse().map_err(|e: elev_core::UnknownParseState| {
            RepositoryError::Corrupt {
                table: "elevations",
                detail: e.to_string(),
            }
        })?;

        sqlx::query(
            "INSERT OR IGNORE INTO artifacts (elevation_id, content_hash, path, byte_size, trusted, fetched_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.elevation_id)
        .bind(&record.content_hash)
        .bind(&record.path)
        .bind(record.byte_size)
        .bind(record.trusted)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let disposition = if current_hash.as_deref() == Some(record.content_hash.as_str()) {
            if state.is_terminal() {
                ArtifactDisposition::AlreadyProcessed(state)
            } else {
                ArtifactDisposition::Resume(state)
            }
        } else {
            sqlx::query(
                "UPDATE elevations
                    SET artifact_hash = ?, parse_state = 'pending', parse_error = NULL,
                        retry_count = 0, claimed_at = NULL
                  WHERE id = ?",
            )
            .bind(&record.content_hash)
            .bind(record.elevation_id)
            .execute(&mut *tx)
            .await?;
            ArtifactDisposition::New
        };

        tx.commit().await?;
        Ok(disposition)
    }

    pub async fn current_artifact(&self, elevation_id: i64) -> RepoResult<Option<ArtifactRecord>> {
        let row = sqlx::query(
            "SELECT a.elevation_id, a.content_hash, a.path, a.byte_size, a.trusted
               FROM artifacts a
               JOIN elevations e ON e.id = a.elevation_id AND e.artifact_hash = a.content_hash
              WHERE a.elevation_id = ?",
        )
        .bind(elevation_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|row| -> RepoResult<ArtifactRecord> {
            Ok(ArtifactRecord {
                elevation_id: row.try_get("elevation_id")?,
                content_hash: row.try_get("content_hash")?,
                path: row.try_get("path")?,
                byte_size: row.try_get("byte_size")?,
                trusted: row.try_get("trusted")?,
            })
        })
        .transpose()
    }

    pub async fn parse_status(&self, elevation_id: i64) -> RepoResult<ParseStatus> {
        let sql = format!("SELECT {STATUS_COLUMNS} FROM elevations WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(elevation_id)
            .fetch_optional(self.pool())
            .await?
            .ok_or(RepositoryError::NotFound {
                kind: EntityKind::Elevation,
                id: elevation_id,
            })?;
        parse_status_from_row(&row)
    }

    /// `pending | failed(< ceiling) -> in_progress` for the given hash. Returns
    /// false when another job holds the claim or the state forbids it.
    pub async fn claim_parse(
        &self,
        elevation_id: i64,
        content_hash: &str,
        retry_ceiling: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let res = sqlx::query(
            "UPDATE elevations
                SET parse_state = 'in_progress', claimed_at = ?
              WHERE id = ? AND artifact_hash = ?
                AND (parse_state = 'pending' OR (parse_state = 'failed' AND retry_count < ?))",
        )
        .bind(now)
        .bind(elevation_id)
        .bind(content_hash)
        .bind(retry_ceiling)
        .execute(self.pool())
        .await?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn begin(&self) -> RepoResult<Transaction<'static, Sqlite>> {
        Ok(self.pool().begin().await?)
    }

    /// Leaf update, child replacement, and `success` transition. Runs on the
    /// caller's transaction; nothing here commits.
    pub async fn write_parse_result(
        conn: &mut SqliteConnection,
        elevation_id: i64,
        content_hash: &str,
        parsed: &ParsedArtifact,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        let d = &parsed.details;
        let res = sqlx::query(
            "UPDATE elevations
                SET width_mm = ?, height_mm = ?, description = ?, system_code = ?, material_code = ?,
                    parse_state = 'success', parse_error = NULL, parsed_at = ?, claimed_at = NULL,
                    updated_at = ?
              WHERE id = ? AND artifact_hash = ? AND parse_state = 'in_progress'",
        )
        .bind(d.width_mm)
        .bind(d.height_mm)
        .bind(&d.description)
        .bind(&d.system_code)
        .bind(&d.material_code)
        .bind(now)
        .bind(now)
        .bind(elevation_id)
        .bind(content_hash)
        .execute(&mut *conn)
        .await?;
        if res.rows_affected() != 1 {
            return Err(RepositoryError::Superseded {
                elevation_id,
                content_hash: content_hash.to_string(),
            });
        }

        sqlx::query("DELETE FROM glass_specs WHERE elevation_id = ?")
            .bind(elevation_id)
            .execute(&mut *conn)
            .await?;
        for (position, spec) in parsed.glass_specs.iter().enumerate() {
            sqlx::query(
                "INSERT INTO glass_specs (elevation_id, position, spec_id, name) VALUES (?, ?, ?, ?)",
            )
            .bind(elevation_id)
            .bind(position as i64)
            .bind(&spec.spec_id)
            .bind(&spec.name)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    /// `in_progress -> failed | validation_failed`, in its own transaction.
    pub async fn mark_parse_failed(
        &self,
        elevation_id: i64,
        content_hash: &str,
        state: ParseState,
        message: &str,
    ) -> RepoResult<()> {
        if !ParseState::InProgress.can_transition_to(state) {
            return Err(RepositoryError::IllegalTransition {
                from: ParseState::InProgress,
                to: state,
            });
        }
        let bump: i64 = if state == ParseState::Failed { 1 } else { 0 };
        let res = sqlx::query(
            "UPDATE elevations
                SET parse_state = ?, parse_error = ?, retry_count = retry_count + ?, claimed_at = NULL
              WHERE id = ? AND artifact_hash = ? AND parse_state = 'in_progress'",
        )
        .bind(state.as_str())
        .bind(message)
        .bind(bump)
        .bind(elevation_id)
        .bind(content_hash)
        .execute(self.pool())
        .await?;
        if res.rows_affected() == 0 {
            warn!(
                elevation_id,
                content_hash,
                state = state.as_str(),
                "parse failure not recorded: claim no longer held"
            );
        }
        Ok(())
    }

    /// Append-only; autocommits independently of any parse transaction.
    pub async fn append_error(&self, entry: &NewErrorLog) -> RepoResult<i64> {
        let res = sqlx::query(
            "INSERT INTO error_log (occurred_at, entity_kind, entity_id, run_id, stage, error_class, message)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.occurred_at)
        .bind(entry.entity_kind.as_str())
        .bind(entry.entity_id)
        .bind(entry.run_id.map(|id| id.to_string()))
        .bind(&entry.stage)
        .bind(entry.class.as_str())
        .bind(&entry.message)
        .execute(self.pool())
        .await?;
        Ok(res.last_insert_rowid())
    }

    pub async fn errors_for(
        &self,
        kind: EntityKind,
        entity_id: i64,
        limit: i64,
    ) -> RepoResult<Vec<ErrorLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, occurred_at, entity_kind, entity_id, run_id, stage, error_class, message
               FROM error_log WHERE entity_kind = ? AND entity_id = ?
              ORDER BY id DESC LIMIT ?",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .bind(limit.max(1))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(error_from_row).collect()
    }

    pub async fn recent_errors(&self, limit: i64) -> RepoResult<Vec<ErrorLogEntry>> {
        let rows = sqlx::query(
            "SELECT id, occurred_at, entity_kind, entity_id, run_id, stage, error_class, message
               FROM error_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit.max(1))
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(error_from_row).collect()
    }

    /// Reset claims older than `claimed_before` to `failed` so they re-enter the
    /// parse queue. Each reset counts as one attempt.
    pub async fn sweep_stale_claims(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepoResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id, artifact_hash, claimed_at FROM elevations WHERE parse_state = 'in_progress'",
        )
        .fetch_all(self.pool())
        .await?;

        let mut swept = Vec::new();
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let hash: Option<String> = row.try_get("artifact_hash")?;
            let claimed_at: Option<DateTime<Utc>> = row.try_get("claimed_at")?;
            if claimed_at.is_some_and(|at| at >= claimed_before) {
                continue;
            }
            let res = sqlx::query(
                "UPDATE elevations
                    SET parse_state = 'failed', parse_error = ?, retry_count = retry_count + 1, claimed_at = NULL
                  WHERE id = ? AND parse_state = 'in_progress' AND claimed_at IS ?",
            )
            .bind(CLAIM_EXPIRED)
            .bind(id)
            .bind(claimed_at)
            .execute(self.pool())
            .await?;
            if res.rows_affected() == 1 {
                self.append_error(&NewErrorLog {
                    occurred_at: now,
                    entity_kind: EntityKind::Elevation,
                    entity_id: Some(id),
                    run_id: None,
                    stage: "sweep".to_string(),
                    class: ErrorClass::Transient,
                    message: format!(
                        "{CLAIM_EXPIRED} (artifact {})",
                        hash.as_deref().unwrap_or("unknown")
                    ),
                })
                .await?;
                swept.push(id);
            }
        }
        Ok(swept)
    }

    /// Elevations holding a downloaded artifact that still needs a parse attempt.
    pub async fn parse_candidates(&self, retry_ceiling: i64) -> RepoResult<Vec<i64>> {
        let exclusions = self.exclusions().await?;
        let ids: Vec<i64> = sqlx::query_scalar(
            "SELECT id FROM elevations
              WHERE artifact_hash IS NOT NULL
                AND (parse_state = 'pending' OR (parse_state = 'failed' AND retry_count < ?))
              ORDER BY id",
        )
        .bind(retry_ceiling)
        .fetch_all(self.pool())
        .await?;
        Ok(ids
            .into_iter()
            .filter(|id| !exclusions.contains(EntityKind::Elevation, *id))
            .collect())
    }

    pub async fn glass_specs(&self, elevation_id: i64) -> RepoResult<Vec<GlassSpec>> {
        let rows = sqlx::query(
            "SELECT spec_id, name FROM glass_specs WHERE elevation_id = ? ORDER BY position",
        )
        .bind(elevation_id)
        .fetch_all(self.pool())
        .await?;
        rows.iter()
            .map(|row| {
                Ok(GlassSpec {
                    spec_id: row.try_get("spec_id")?,
                    name: row.try_get("name")?,
                })
            })
            .collect()
    }

    /// Children of `parent_id` visible to downstream readers.
    pub async fn visible_children(
        &self,
        kind: EntityKind,
        parent_id: Option<i64>,
    ) -> RepoResult<Vec<HierarchyEntity>> {
        let exclusions = self.exclusions().await?;
        if let (Some(pk), Some(pid)) = (kind.parent(), parent_id) {
            if exclusions.contains(pk, pid) {
                return Ok(Vec::new());
            }
        }
        Ok(self
            .list_children(kind, parent_id)
            .await?
            .into_iter()
            .filter(|e| !exclusions.contains(kind, e.id))
            .collect())
    }

    pub async fn visible_entity(&self, kind: EntityKind, id: i64) -> RepoResult<Option<HierarchyEntity>> {
        let exclusions = self.exclusions().await?;
        if exclusions.contains(kind, id) {
            return Ok(None);
        }
        self.get(kind, id).await
    }

    pub async fn elevation_view(&self, elevation_id: i64) -> RepoResult<Option<ElevationView>> {
        let exclusions = self.exclusions().await?;
        if exclusions.contains(EntityKind::Elevation, elevation_id) {
            return Ok(None);
        }
        let sql = format!(
            "SELECT * FROM {} WHERE id = ?",
            table(EntityKind::Elevation)
        );
        let Some(row) = sqlx::query(&sql)
            .bind(elevation_id)
            .fetch_optional(self.pool())
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(ElevationView {
            entity: entity_from_row(EntityKind::Elevation, &row)?,
            details: details_from_row(&row)?,
            glass_specs: self.glass_specs(elevation_id).await?,
            parse: parse_status_from_row(&row)?,
        }))
    }

    pub async fn elevation_views(&self, phase_id: i64) -> RepoResult<Vec<ElevationView>> {
        let mut out = Vec::new();
        for entity in self.visible_children(EntityKind::Elevation, Some(phase_id)).await? {
            if let Some(view) = self.elevation_view(entity.id).await? {
                out.push(view);
            }
        }
        Ok(out)
    }
}

fn error_from_row(row: &SqliteRow) -> RepoResult<ErrorLogEntry> {
    Ok(ErrorLogEntry {
        id: row.try_get("id")?,
        occurred_at: row.try_get("occurred_at")?,
        entity_kind: row.try_get("entity_kind")?,
        entity_id: row.try_get("entity_id")?,
        run_id: row.try_get("run_id")?,
        stage: row.try_get("stage")?,
        error_class: row.try_get("error_class")?,
        message: row.try_get("message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::tests::{at, repo, seed_chain};

    fn artifact(elevation_id: i64, hash: &str) -> ArtifactRecord {
        ArtifactRecord {
            elevation_id,
            content_hash: hash.to_string(),
            path: format!("/tmp/{hash}.sqlite"),
            byte_size: 4096,
            trusted: true,
        }
    }

    fn parsed(specs: &[(&str, &str)]) -> ParsedArtifact {
        ParsedArtifact {
            details: ElevationDetails {
                width_mm: Some(1200.0),
                height_mm: Some(2400.0),
                description: Some("Sliding door".into()),
                system_code: Some("ASS 70".into()),
                material_code: Some("AL".into()),
            },
            glass_specs: specs
                .iter()
                .map(|(id, name)| GlassSpec {
                    spec_id: id.to_string(),
                    name: name.to_string(),
                })
                .collect(),
        }
    }

    async fn parse_ok(repo: &EntityRepository, e: i64, hash: &str, body: &ParsedArtifact) {
        assert!(repo.claim_parse(e, hash, 3, at(9, 0)).await.unwrap());
        let mut tx = repo.begin().await.unwrap();
        EntityRepository::write_parse_result(&mut tx, e, hash, body, at(9, 1))
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn same_hash_after_success_is_already_processed() {
        let (_dir, repo) = repo().await;
        let (_, _, _, e) = seed_chain(&repo).await;

        assert_eq!(
            repo.record_artifact(&artifact(e, "h1"), at(9, 0)).await.unwrap(),
            ArtifactDisposition::New
        );
        parse_ok(&repo, e, "h1", &parsed(&[("g1", "Float 6mm")])).await;

        let before = repo.parse_status(e).await.unwrap();
        let again = repo.record_artifact(&artifact(e, "h1"), at(10, 0)).await.unwrap();
        assert_eq!(again, ArtifactDisposition::AlreadyProcessed(ParseState::Success));
        assert!(!again.needs_parse());
        assert_eq!(repo.parse_status(e).await.unwrap(), before);

        let changed = repo.record_artifact(&artifact(e, "h2"), at(11, 0)).await.unwrap();
        assert_eq!(changed, ArtifactDisposition::New);
        let status = repo.parse_status(e).await.unwrap();
        assert_eq!(status.state, ParseState::Pending);
        assert_eq!(status.artifact_hash.as_deref(), Some("h2"));
    }

    #[tokio::test]
    async fn parse_result_replaces_child_rows_wholesale() {
        let (_dir, repo) = repo().await;
        let (_, _, _, e) = seed_chain(&repo).await;

        repo.record_artifact(&artifact(e, "h1"), at(9, 0)).await.unwrap();
        parse_ok(&repo, e, "h1", &parsed(&[("g1", "Float"), ("g2", "Laminated")])).await;
        repo.record_artifact(&artifact(e, "h2"), at(9, 30)).await.unwrap();
        parse_ok(&repo, e, "h2", &parsed(&[("g9", "Triple")])).await;

        let specs = repo.glass_specs(e).await.unwrap();
        assert_eq!(
            specs,
            vec![GlassSpec {
                spec_id: "g9".into(),
                name: "Triple".into()
            }]
        );
        let view = repo.elevation_view(e).await.unwrap().unwrap();
        assert_eq!(view.details.system_code.as_deref(), Some("ASS 70"));
        assert_eq!(view.parse.state, ParseState::Success);
        assert_eq!(
            repo.current_artifact(e).await.unwrap().map(|a| a.content_hash),
            Some("h2".to_string())
        );
    }

    #[tokio::test]
    async fn failures_respect_retry_ceiling_and_validation_is_terminal() {
        let (_dir, repo) = repo().await;
        let (_, _, _, e) = seed_chain(&repo).await;
        repo.record_artifact(&artifact(e, "h1"), at(9, 0)).await.unwrap();

        for attempt in 0..2 {
            assert!(repo.claim_parse(e, "h1", 2, at(9, attempt)).await.unwrap());
            repo.mark_parse_failed(e, "h1", ParseState::Failed, "locked").await.unwrap();
        }
        let status = repo.parse_status(e).await.unwrap();
        assert_eq!(status.state, ParseState::Failed);
        assert_eq!(status.retry_count, 2);
        assert!(!repo.claim_parse(e, "h1", 2, at(9, 5)).await.unwrap());
        assert!(repo.parse_candidates(2).await.unwrap().is_empty());
        assert_eq!(repo.parse_candidates(3).await.unwrap(), vec![e]);

        assert!(repo.claim_parse(e, "h1", 3, at(9, 6)).await.unwrap());
        repo.mark_parse_failed(e, "h1", ParseState::ValidationFailed, "missing table")
            .await
            .unwrap();
        assert!(!repo.claim_parse(e, "h1", 10, at(9, 7)).await.unwrap());
        assert_eq!(
            repo.record_artifact(&artifact(e, "h1"), at(9, 8)).await.unwrap(),
            ArtifactDisposition::AlreadyProcessed(ParseState::ValidationFailed)
        );
    }

    #[tokio::test]
    async fn failure_marks_only_accept_failure_states() {
        let (_dir, repo) = repo().await;
        let (_, _, _, e) = seed_chain(&repo).await;
        repo.record_artifact(&artifact(e, "h1"), at(9, 0)).await.unwrap();
        assert!(repo.claim_parse(e, "h1", 3, at(9, 0)).await.unwrap());

        let err = repo
            .mark_parse_failed(e, "h1", ParseState::Pending, "rewind")
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::IllegalTransition { .. }));
        assert_eq!(repo.parse_status(e).await.unwrap().state, ParseState::InProgress);
    }

    #[tokio::test]
    async fn superseded_claims_cannot_commit() {
        let (_dir, repo) = repo().await;
        let (_, _, _, e) = seed_chain(&repo).await;
        repo.record_artifact(&artifact(e, "h1"), at(9, 0)).await.unwrap();
        assert!(repo.claim_parse(e, "h1", 3, at(9, 0)).await.unwrap());
        repo.record_artifact(&artifact(e, "h2"), at(9, 1)).await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        let err = EntityRepository::write_parse_result(&mut tx, e, "h1", &parsed(&[]), at(9, 2))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Superseded { .. }));
    }

    #[tokio::test]
    async fn sweep_requeues_expired_claims_and_logs_them() {
        let (_dir, repo) = repo().await;
        let (_, _, _, e) = seed_chain(&repo).await;
        repo.record_artifact(&artifact(e, "h1"), at(9, 0)).await.unwrap();
        assert!(repo.claim_parse(e, "h1", 3, at(9, 0)).await.unwrap());

        assert!(repo.sweep_stale_claims(at(8, 59), at(9, 1)).await.unwrap().is_empty());
        assert_eq!(repo.sweep_stale_claims(at(9, 30), at(9, 31)).await.unwrap(), vec![e]);

        let status = repo.parse_status(e).await.unwrap();
        assert_eq!(status.state, ParseState::Failed);
        assert_eq!(status.retry_count, 1);
        let errors = repo.errors_for(EntityKind::Elevation, e, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].stage, "sweep");
        assert_eq!(repo.parse_candidates(3).await.unwrap(), vec![e]);
    }

    #[tokio::test]
    async fn excluded_elevations_are_hidden_from_readers() {
        let (_dir, repo) = repo().await;
        let (_, _, ph, e) = seed_chain(&repo).await;
        assert_eq!(repo.elevation_views(ph).await.unwrap().len(), 1);
        repo.set_excluded(EntityKind::Elevation, e, true).await.unwrap();
        assert!(repo.elevation_views(ph).await.unwrap().is_empty());
        assert!(repo.elevation_view(e).await.unwrap().is_none());
        assert!(repo.visible_entity(EntityKind::Elevation, e).await.unwrap().is_none());
    }
}
