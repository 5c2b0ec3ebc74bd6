//! Artifact fetch, validation, extraction, and the single-transaction apply.

use std::path::Path;
use std::sync::Arc;

use elev_core::{
    ArtifactRecord, Classify, Clock, ElevationDetails, EntityKind, ErrorClass, GlassSpec,
    ParseState, ParsedArtifact,
};
use elev_source::SessionClient;
use elev_storage::{ArtifactStore, EntityRepository, NewErrorLog, RepositoryError, StoredArtifact};
use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row, SqliteConnection};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::JobError;

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Tables and columns an artifact must carry. Anything else is ignored.
pub const REQUIRED_SCHEMA: &[(&str, &[&str])] = &[
    (
        "elevation_info",
        &["width", "height", "description", "system_code", "material_code"],
    ),
    ("glass_specs", &["spec_id", "name"]),
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("artifact invalid: {0}")]
    Invalid(String),
    #[error("reading artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("artifact database: {0}")]
    Artifact(#[source] sqlx::Error),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("commit aborted: {0}")]
    Aborted(String),
}

impl Classify for ParseError {
    fn class(&self) -> ErrorClass {
        match self {
            ParseError::Invalid(_) | ParseError::Artifact(_) => ErrorClass::Validation,
            ParseError::Io(_) => ErrorClass::Transient,
            ParseError::Repository(err) => err.class(),
            ParseError::Aborted(_) => ErrorClass::Persistence,
        }
    }
}

/// Called after the parse result is written and before it commits. An error
/// rolls the whole parse back.
pub trait CommitHook: Send + Sync {
    fn before_commit(&self, elevation_id: i64, parsed: &ParsedArtifact) -> Result<(), ParseError>;
}

#[derive(Debug, Default)]
pub struct NoopCommitHook;

impl CommitHook for NoopCommitHook {
    fn before_commit(&self, _elevation_id: i64, _parsed: &ParsedArtifact) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Reads one artifact file over a single read-only connection.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactParser {
    pub max_bytes: u64,
}

impl ArtifactParser {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub async fn extract(&self, path: &Path, trusted: bool) -> Result<ParsedArtifact, ParseError> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ParseError::Invalid(format!("{} does not exist", path.display())))
            }
            Err(err) => return Err(err.into()),
        };
        if meta.len() > self.max_bytes {
            return Err(ParseError::Invalid(format!(
                "{} bytes exceeds the {} byte limit",
                meta.len(),
                self.max_bytes
            )));
        }
        let mut header = [0u8; 16];
        let mut file = tokio::fs::File::open(path).await?;
        if file.read_exact(&mut header).await.is_err() || &header != SQLITE_MAGIC {
            return Err(ParseError::Invalid("not a sqlite database".into()));
        }
        drop(file);

        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .read_only(true)
            .connect()
            .await
            .map_err(ParseError::Artifact)?;
        let parsed = read_artifact(&mut conn, trusted).await;
        let _ = conn.close().await;
        parsed
    }
}

async fn read_artifact(conn: &mut SqliteConnection, trusted: bool) -> Result<ParsedArtifact, ParseError> {
    if !trusted {
        let verdict: Vec<String> = sqlx::query_scalar("PRAGMA integrity_check")
            .fetch_all(&mut *conn)
            .await
            .map_err(ParseError::Artifact)?;
        if verdict.first().map(String::as_str) != Some("ok") {
            return Err(ParseError::Invalid(format!(
                "integrity check failed: {}",
                verdict.join("; ")
            )));
        }
    }

    for (table, columns) in REQUIRED_SCHEMA {
        let present: Vec<String> = sqlx::query(&format!("PRAGMA table_info({table})"))
            .fetch_all(&mut *conn)
            .await
            .map_err(ParseError::Artifact)?
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<_, _>>()
            .map_err(ParseError::Artifact)?;
        if present.is_empty() {
            return Err(ParseError::Invalid(format!("missing table `{table}`")));
        }
        let missing: Vec<&str> = columns
            .iter()
            .copied()
            .filter(|c| !present.iter().any(|p| p.eq_ignore_ascii_case(c)))
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::Invalid(format!(
                "table `{table}` lacks columns {}",
                missing.join(", ")
            )));
        }
    }

    let row = sqlx::query(
        "SELECT CAST(width AS REAL) AS width, CAST(height AS REAL) AS height,
                CAST(description AS TEXT) AS description, CAST(system_code AS TEXT) AS system_code,
                CAST(material_code AS TEXT) AS material_code
           FROM elevation_info LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await
    .map_err(ParseError::Artifact)?
    .ok_or_else(|| ParseError::Invalid("elevation_info is empty".into()))?;
    let details = ElevationDetails {
        width_mm: row.try_get("width").map_err(ParseError::Artifact)?,
        height_mm: row.try_get("height").map_err(ParseError::Artifact)?,
        description: row.try_get("description").map_err(ParseError::Artifact)?,
        system_code: row.try_get("system_code").map_err(ParseError::Artifact)?,
        material_code: row.try_get("material_code").map_err(ParseError::Artifact)?,
    };

    let rows = sqlx::query(
        "SELECT CAST(spec_id AS TEXT) AS spec_id, CAST(name AS TEXT) AS name
           FROM glass_specs ORDER BY rowid",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(ParseError::Artifact)?;
    let mut glass_specs = Vec::with_capacity(rows.len());
    for row in rows {
        let spec_id: Option<String> = row.try_get("spec_id").map_err(ParseError::Artifact)?;
        let name: Option<String> = row.try_get("name").map_err(ParseError::Artifact)?;
        let Some(spec_id) = spec_id else {
            return Err(ParseError::Invalid("glass_specs row without spec_id".into()));
        };
        glass_specs.push(GlassSpec {
            spec_id,
            name: name.unwrap_or_default(),
        });
    }

    Ok(ParsedArtifact {
        details,
        glass_specs,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ParseOutcome {
    Parsed { glass_specs: usize },
    /// Same hash as the current artifact and already processed.
    Skipped { state: ParseState },
    /// Another job holds the claim.
    NotClaimed,
    /// A newer artifact replaced this one mid-parse.
    Superseded,
    /// Terminal rejection, recorded as `validation_failed`.
    Rejected { message: String },
    /// Still `failed` and out of retries until a new artifact arrives.
    Exhausted {
        retry_count: i64,
        message: Option<String>,
    },
}

impl ParseOutcome {
    /// The elevation's enrichment matches its current artifact.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ParseOutcome::Parsed { .. }
                | ParseOutcome::Skipped {
                    state: ParseState::Success
                }
        )
    }

    /// Failure to report for this outcome, if it is one.
    pub fn failure(&self) -> Option<String> {
        match self {
            ParseOutcome::Rejected { message } => Some(message.clone()),
            ParseOutcome::Exhausted {
                retry_count,
                message,
            } => Some(format!(
                "retry ceiling reached after {retry_count} failed parses: {}",
                message.as_deref().unwrap_or("no error recorded")
            )),
            _ => None,
        }
    }
}

/// Fetch + parse for one elevation. One fresh session per leaf.
#[derive(Clone)]
pub struct ArtifactPipeline {
    repo: EntityRepository,
    store: ArtifactStore,
    client: SessionClient,
    parser: ArtifactParser,
    hook: Arc<dyn CommitHook>,
    clock: Arc<dyn Clock>,
    retry_ceiling: i64,
}

impl ArtifactPipeline {
    pub fn new(
        repo: EntityRepository,
        store: ArtifactStore,
        client: SessionClient,
        parser: ArtifactParser,
        clock: Arc<dyn Clock>,
        retry_ceiling: i64,
    ) -> Self {
        Self {
            repo,
            store,
            client,
            parser,
            hook: Arc::new(NoopCommitHook),
            clock,
            retry_ceiling,
        }
    }

    pub fn with_commit_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn fetch(&self, elevation_id: i64, run_id: Uuid) -> Result<ParseOutcome, JobError> {
        let path = self.repo.context_path(EntityKind::Elevation, elevation_id).await?;
        let span = info_span!("artifact_fetch", %run_id, elevation_id, %path);
        async {
            let mut session = self.client.open_at(&path).await?;
            let fetched = session.fetch_artifact().await;
            session.close().await;
            let bytes = fetched?;
            let stored = self.store.store_bytes(&bytes).await.map_err(JobError::Storage)?;
            self.register(elevation_id, stored, true, run_id).await
        }
        .instrument(span)
        .await
    }

    /// Operator-supplied file; parsed with the full integrity scan.
    pub async fn import(&self, elevation_id: i64, file: &Path, run_id: Uuid) -> Result<ParseOutcome, JobError> {
        self.repo.require(EntityKind::Elevation, elevation_id).await?;
        let stored = self.store.store_file(file).await.map_err(JobError::Storage)?;
        self.register(elevation_id, stored, false, run_id)
            .instrument(info_span!("artifact_import", %run_id, elevation_id))
            .await
    }

    /// Re-run a parse from the stored file of the current artifact.
    pub async fn reparse(&self, elevation_id: i64, run_id: Uuid) -> Result<ParseOutcome, JobError> {
        let Some(record) = self.repo.current_artifact(elevation_id).await? else {
            return Ok(ParseOutcome::NotClaimed);
        };
        self.parse(&record, run_id)
            .instrument(info_span!("artifact_reparse", %run_id, elevation_id))
            .await
    }

    async fn register(
        &self,
        elevation_id: i64,
        stored: StoredArtifact,
        trusted: bool,
        run_id: Uuid,
    ) -> Result<ParseOutcome, JobError> {
        let record = ArtifactRecord {
            elevation_id,
            content_hash: stored.content_hash,
            path: stored.absolute_path.display().to_string(),
            byte_size: stored.byte_size as i64,
            trusted,
        };
        let disposition = self.repo.record_artifact(&record, self.clock.now()).await?;
        if !disposition.needs_parse() {
            info!(hash = %record.content_hash, ?disposition, "artifact unchanged; parse skipped");
            let state = self.repo.parse_status(elevation_id).await?.state;
            return Ok(ParseOutcome::Skipped { state });
        }
        self.parse(&record, run_id).await
    }

    async fn parse(&self, record: &ArtifactRecord, run_id: Uuid) -> Result<ParseOutcome, JobError> {
        let id = record.elevation_id;
        let hash = record.content_hash.as_str();
        if !self
            .repo
            .claim_parse(id, hash, self.retry_ceiling, self.clock.now())
            .await?
        {
            return self.unclaimed(id, hash).await;
        }

        match self.apply(record).await {
            Ok(count) => {
                info!(hash, glass_specs = count, "artifact parsed");
                Ok(ParseOutcome::Parsed { glass_specs: count })
            }
            Err(ParseError::Repository(RepositoryError::Superseded { .. })) => {
                info!(hash, "artifact superseded during parse");
                Ok(ParseOutcome::Superseded)
            }
            Err(err) => {
                let class = err.class();
                let state = if class == ErrorClass::Validation {
                    ParseState::ValidationFailed
                } else {
                    ParseState::Failed
                };
                let message = err.to_string();
                warn!(hash, state = state.as_str(), error = %message, "artifact parse failed");
                self.repo.mark_parse_failed(id, hash, state, &message).await?;
                self.repo
                    .append_error(&NewErrorLog {
                        occurred_at: self.clock.now(),
                        entity_kind: EntityKind::Elevation,
                        entity_id: Some(id),
                        run_id: Some(run_id),
                        stage: "artifact_parse".to_string(),
                        class,
                        message: message.clone(),
                    })
                    .await?;
                if state == ParseState::ValidationFailed {
                    Ok(ParseOutcome::Rejected { message })
                } else {
                    Err(JobError::Parse(err))
                }
            }
        }
    }

    /// Explain a refused claim from the state the elevation is left in.
    async fn unclaimed(&self, elevation_id: i64, hash: &str) -> Result<ParseOutcome, JobError> {
        let status = self.repo.parse_status(elevation_id).await?;
        if status.artifact_hash.as_deref() != Some(hash) {
            info!(hash, "artifact superseded before claim");
            return Ok(ParseOutcome::Superseded);
        }
        let outcome = match status.state {
            ParseState::Failed => {
                warn!(hash, retry_count = status.retry_count, "parse retry ceiling reached");
                ParseOutcome::Exhausted {
                    retry_count: status.retry_count,
                    message: status.error_message,
                }
            }
            state @ (ParseState::Success | ParseState::ValidationFailed) => {
                ParseOutcome::Skipped { state }
            }
            ParseState::Pending | ParseState::InProgress => {
                info!(hash, state = status.state.as_str(), "parse claim held elsewhere");
                ParseOutcome::NotClaimed
            }
        };
        Ok(outcome)
    }

    /// Extract, write, commit. Dropping the transaction on any error rolls
    /// back every write made here.
    async fn apply(&self, record: &ArtifactRecord) -> Result<usize, ParseError> {
        let parsed = self
            .parser
            .extract(Path::new(&record.path), record.trusted)
            .await?;
        let mut tx = self.repo.begin().await?;
        EntityRepository::write_parse_result(
            &mut tx,
            record.elevation_id,
            &record.content_hash,
            &parsed,
            self.clock.now(),
        )
        .await?;
        self.hook.before_commit(record.elevation_id, &parsed)?;
        tx.commit()
            .await
            .map_err(|e| ParseError::Repository(RepositoryError::Database(e)))?;
        Ok(parsed.glass_specs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn build(path: &Path, schema: &str) {
        let mut conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await
            .unwrap();
        sqlx::raw_sql(schema).execute(&mut conn).await.unwrap();
        conn.close().await.unwrap();
    }

    const GOOD: &str = "
        CREATE TABLE elevation_info (width INTEGER, height REAL, description TEXT,
                                     system_code TEXT, material_code TEXT, finish TEXT);
        INSERT INTO elevation_info VALUES (1200, 2400.5, 'Window', 'AWS 75', 'AL', 'RAL 7016');
        CREATE TABLE glass_specs (spec_id INTEGER, name TEXT);
        INSERT INTO glass_specs VALUES (7, 'Float'), (3, 'Laminated');
        CREATE TABLE notes (body TEXT);
    ";

    #[tokio::test]
    async fn extracts_fields_and_ignores_unknown_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("good.sqlite");
        build(&path, GOOD).await;

        let parsed = ArtifactParser::new(1 << 20).extract(&path, false).await.unwrap();
        assert_eq!(parsed.details.width_mm, Some(1200.0));
        assert_eq!(parsed.details.height_mm, Some(2400.5));
        assert_eq!(parsed.details.system_code.as_deref(), Some("AWS 75"));
        assert_eq!(
            parsed.glass_specs,
            vec![
                GlassSpec { spec_id: "7".into(), name: "Float".into() },
                GlassSpec { spec_id: "3".into(), name: "Laminated".into() },
            ]
        );
    }

    #[tokio::test]
    async fn schema_and_size_violations_are_validation_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing_col = dir.path().join("cols.sqlite");
        build(
            &missing_col,
            "CREATE TABLE elevation_info (width REAL, height REAL);
             CREATE TABLE glass_specs (spec_id TEXT, name TEXT);",
        )
        .await;
        let err = ArtifactParser::new(1 << 20).extract(&missing_col, true).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(err.to_string().contains("description"), "{err}");

        let good = dir.path().join("good.sqlite");
        build(&good, GOOD).await;
        let err = ArtifactParser::new(16).extract(&good, true).await.unwrap_err();
        assert!(matches!(err, ParseError::Invalid(_)));

        let junk = dir.path().join("junk.sqlite");
        std::fs::write(&junk, b"definitely not sqlite, just text").unwrap();
        let err = ArtifactParser::new(1 << 20).extract(&junk, false).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);

        let absent = dir.path().join("absent.sqlite");
        let err = ArtifactParser::new(1 << 20).extract(&absent, true).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Validation);
    }

    #[tokio::test]
    async fn empty_leaf_table_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.sqlite");
        build(
            &path,
            "CREATE TABLE elevation_info (width REAL, height REAL, description TEXT,
                                          system_code TEXT, material_code TEXT);
             CREATE TABLE glass_specs (spec_id TEXT, name TEXT);",
        )
        .await;
        let err = ArtifactParser::new(1 << 20).extract(&path, false).await.unwrap_err();
        assert!(err.to_string().contains("empty"), "{err}");
    }
}
