use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use elev_core::SyncPolicyRow;
use elev_source::{FixtureTransport, HttpTransport, HttpTransportConfig, SourceTransport};
use elev_storage::{BackoffPolicy, EntityRepository};
use serde::Deserialize;
use tracing::{info, warn};

pub const POLICY_FILE: &str = "policies.yaml";

#[derive(Debug, Clone, Default)]
pub struct SourceSettings {
    pub url: Option<String>,
    pub username: String,
    pub password: String,
    /// When set, the upstream is served from this JSON catalog instead of HTTP.
    pub fixture: Option<PathBuf>,
    pub http_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub artifacts_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub scheduler_enabled: bool,
    pub tick_cron: String,
    pub source: SourceSettings,
    pub workers: usize,
    pub read_connections: u32,
    pub job_timeout: Duration,
    pub max_attempts: usize,
    pub parse_retry_ceiling: i64,
    pub max_artifact_bytes: u64,
    pub error_summary_limit: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, "ignoring unparseable environment value");
                default
            }
        },
        Err(_) => default,
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/elev.db".to_string()),
            artifacts_dir: std::env::var("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./artifacts")),
            workspace_root: PathBuf::from("."),
            scheduler_enabled: std::env::var("ELEV_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            tick_cron: std::env::var("ELEV_TICK_CRON").unwrap_or_else(|_| "0 * * * * *".to_string()),
            source: SourceSettings {
                url: std::env::var("ELEV_SOURCE_URL").ok(),
                username: std::env::var("ELEV_SOURCE_USER").unwrap_or_default(),
                password: std::env::var("ELEV_SOURCE_PASSWORD").unwrap_or_default(),
                fixture: std::env::var("ELEV_SOURCE_FIXTURE").ok().map(PathBuf::from),
                http_timeout_secs: env_parse("ELEV_HTTP_TIMEOUT_SECS", 20),
            },
            workers: env_parse("ELEV_WORKERS", 3usize).clamp(1, 5),
            read_connections: env_parse("ELEV_READ_CONNECTIONS", 4),
            job_timeout: Duration::from_secs(env_parse("ELEV_JOB_TIMEOUT_SECS", 120)),
            max_attempts: env_parse("ELEV_MAX_ATTEMPTS", 4usize).max(1),
            parse_retry_ceiling: env_parse("ELEV_PARSE_RETRY_CEILING", 3),
            max_artifact_bytes: env_parse("ELEV_MAX_ARTIFACT_BYTES", 64 * 1024 * 1024),
            error_summary_limit: env_parse("ELEV_ERROR_SUMMARY_LIMIT", 5),
        }
    }

    /// Self-contained layout under `root`, used by tests and demos.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_url: format!("sqlite://{}", root.join("elev.db").display()),
            artifacts_dir: root.join("artifacts"),
            workspace_root: root,
            scheduler_enabled: false,
            tick_cron: "0 * * * * *".to_string(),
            source: SourceSettings {
                http_timeout_secs: 20,
                ..SourceSettings::default()
            },
            workers: 3,
            read_connections: 4,
            job_timeout: Duration::from_secs(120),
            max_attempts: 4,
            parse_retry_ceiling: 3,
            max_artifact_bytes: 64 * 1024 * 1024,
            error_summary_limit: 5,
        }
    }

    pub fn policies_path(&self) -> PathBuf {
        self.workspace_root.join(POLICY_FILE)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            max_retries: self.max_attempts.saturating_sub(1),
            ..BackoffPolicy::default()
        }
    }

    pub fn build_transport(&self) -> Result<Arc<dyn SourceTransport>> {
        if let Some(path) = &self.source.fixture {
            info!(path = %path.display(), "using fixture source");
            return Ok(Arc::new(FixtureTransport::load(path)?));
        }
        let Some(url) = &self.source.url else {
            bail!("no upstream configured: set ELEV_SOURCE_URL or ELEV_SOURCE_FIXTURE");
        };
        let mut http = HttpTransportConfig::new(url.clone());
        http.username = self.source.username.clone();
        http.password = self.source.password.clone();
        http.timeout = Duration::from_secs(self.source.http_timeout_secs);
        Ok(Arc::new(HttpTransport::new(http)?))
    }
}

#[derive(Debug, Deserialize)]
struct PolicyFile {
    policies: Vec<PolicyEntry>,
}

#[derive(Debug, Deserialize)]
struct PolicyEntry {
    target: String,
    interval: String,
    staleness_threshold: String,
    priority: i32,
    #[serde(default)]
    depends_on: Option<String>,
    #[serde(default)]
    cascade: bool,
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// `90s`, `30m`, `6h`, `1d`, or bare seconds.
pub fn parse_duration_secs(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit() && c != '-') {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };
    let value: i64 = digits
        .parse()
        .with_context(|| format!("invalid duration `{raw}`"))?;
    let scale = match unit.trim() {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        other => bail!("unknown duration unit `{other}` in `{raw}`"),
    };
    value
        .checked_mul(scale)
        .with_context(|| format!("duration `{raw}` is out of range"))
}

pub fn parse_policy_file(text: &str) -> Result<Vec<SyncPolicyRow>> {
    let file: PolicyFile = serde_yaml::from_str(text).context("parsing policy file")?;
    file.policies
        .into_iter()
        .map(|p| {
            Ok(SyncPolicyRow {
                interval_secs: parse_duration_secs(&p.interval)
                    .with_context(|| format!("policy `{}` interval", p.target))?,
                staleness_threshold_secs: parse_duration_secs(&p.staleness_threshold)
                    .with_context(|| format!("policy `{}` staleness_threshold", p.target))?,
                target: p.target,
                priority: p.priority,
                depends_on: p.depends_on,
                cascade: p.cascade,
                enabled: p.enabled,
            })
        })
        .collect()
}

pub async fn load_policy_file(path: &Path) -> Result<Vec<SyncPolicyRow>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    parse_policy_file(&text).with_context(|| format!("loading {}", path.display()))
}

/// Insert configured policies the database does not know yet. Rows edited by
/// operators are left alone. Invalid rows are still seeded; the scheduler skips
/// them with a warning so the operator can fix them in place.
pub async fn seed_policies(
    repo: &EntityRepository,
    rows: &[SyncPolicyRow],
    now: DateTime<Utc>,
) -> Result<usize> {
    let mut inserted = 0;
    for row in rows {
        if let Err(err) = row.validate() {
            warn!(target_name = %row.target, error = %err, "seeding misconfigured policy");
        }
        if repo.seed_policy(row, now).await? {
            inserted += 1;
        }
    }
    info!(inserted, configured = rows.len(), "policies seeded");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
policies:
  - target: directory
    interval: 6h
    staleness_threshold: 1d
    priority: 1
    cascade: true
  - target: artifact
    interval: 30m
    staleness_threshold: 2h
    priority: 5
    depends_on: elevation
    enabled: false
"#;

    #[test]
    fn durations_accept_common_units() {
        assert_eq!(parse_duration_secs("90").unwrap(), 90);
        assert_eq!(parse_duration_secs("30m").unwrap(), 1_800);
        assert_eq!(parse_duration_secs("6h").unwrap(), 21_600);
        assert_eq!(parse_duration_secs(" 1d ").unwrap(), 86_400);
        assert!(parse_duration_secs("5w").is_err());
        assert!(parse_duration_secs("soon").is_err());
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let err = parse_duration_secs("999999999999999999d").unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err:#}");
        let text = SAMPLE.replace("interval: 6h", "interval: 9000000000000000000h");
        assert!(parse_policy_file(&text).is_err());
    }

    #[test]
    fn policy_file_maps_to_rows() {
        let rows = parse_policy_file(SAMPLE).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].target, "directory");
        assert_eq!(rows[0].interval_secs, 21_600);
        assert!(rows[0].cascade);
        assert!(rows[0].enabled);
        assert_eq!(rows[1].depends_on.as_deref(), Some("elevation"));
        assert!(!rows[1].enabled);
    }

    #[test]
    fn workspace_policy_file_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../..").join(POLICY_FILE);
        let text = std::fs::read_to_string(path).unwrap();
        let rows = parse_policy_file(&text).unwrap();
        assert_eq!(rows.len(), 5);
        for row in rows {
            row.validate().unwrap();
        }
    }

    #[test]
    fn missing_source_is_reported() {
        let cfg = SyncConfig::for_workspace("/tmp/none");
        assert!(cfg.build_transport().is_err());
        assert_eq!(cfg.backoff().max_attempts(), 4);
    }
}
