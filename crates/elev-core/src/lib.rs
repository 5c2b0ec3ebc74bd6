//! Core domain model for the elevation catalog cache.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "elev-core";

/// Levels of the source hierarchy, root first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Directory,
    Project,
    Phase,
    Elevation,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Directory,
        EntityKind::Project,
        EntityKind::Phase,
        EntityKind::Elevation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Directory => "directory",
            EntityKind::Project => "project",
            EntityKind::Phase => "phase",
            EntityKind::Elevation => "elevation",
        }
    }

    /// Zero-based navigation depth.
    pub fn depth(self) -> usize {
        match self {
            EntityKind::Directory => 0,
            EntityKind::Project => 1,
            EntityKind::Phase => 2,
            EntityKind::Elevation => 3,
        }
    }

    pub fn parent(self) -> Option<EntityKind> {
        match self {
            EntityKind::Directory => None,
            EntityKind::Project => Some(EntityKind::Directory),
            EntityKind::Phase => Some(EntityKind::Project),
            EntityKind::Elevation => Some(EntityKind::Phase),
        }
    }

    pub fn child(self) -> Option<EntityKind> {
        match self {
            EntityKind::Directory => Some(EntityKind::Project),
            EntityKind::Project => Some(EntityKind::Phase),
            EntityKind::Phase => Some(EntityKind::Elevation),
            EntityKind::Elevation => None,
        }
    }

    pub fn is_leaf(self) -> bool {
        self == EntityKind::Elevation
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "directory" => Ok(EntityKind::Directory),
            "project" => Ok(EntityKind::Project),
            "phase" => Ok(EntityKind::Phase),
            "elevation" => Ok(EntityKind::Elevation),
            other => Err(PolicyError::UnknownTarget(other.to_string())),
        }
    }
}

/// Unit of scheduling. Each hierarchy level is refreshed by listing it under its
/// parent; `Artifact` is the per-elevation enrichment pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    Directory,
    Project,
    Phase,
    Elevation,
    Artifact,
}

impl SyncTarget {
    pub const ALL: [SyncTarget; 5] = [
        SyncTarget::Directory,
        SyncTarget::Project,
        SyncTarget::Phase,
        SyncTarget::Elevation,
        SyncTarget::Artifact,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncTarget::Directory => "directory",
            SyncTarget::Project => "project",
            SyncTarget::Phase => "phase",
            SyncTarget::Elevation => "elevation",
            SyncTarget::Artifact => "artifact",
        }
    }

    /// The hierarchy level whose rows this target writes.
    pub fn entity_kind(self) -> Option<EntityKind> {
        match self {
            SyncTarget::Directory => Some(EntityKind::Directory),
            SyncTarget::Project => Some(EntityKind::Project),
            SyncTarget::Phase => Some(EntityKind::Phase),
            SyncTarget::Elevation => Some(EntityKind::Elevation),
            SyncTarget::Artifact => None,
        }
    }

    /// The level whose instances partition this target's work. `None` is the
    /// single root scope.
    pub fn scope_kind(self) -> Option<EntityKind> {
        match self {
            SyncTarget::Directory => None,
            SyncTarget::Project => Some(EntityKind::Directory),
            SyncTarget::Phase => Some(EntityKind::Project),
            SyncTarget::Elevation => Some(EntityKind::Phase),
            SyncTarget::Artifact => Some(EntityKind::Elevation),
        }
    }

    pub fn structural_parent(self) -> Option<SyncTarget> {
        self.scope_kind().map(SyncTarget::from)
    }

    pub fn children(self) -> Vec<SyncTarget> {
        SyncTarget::ALL
            .into_iter()
            .filter(|t| t.structural_parent() == Some(self))
            .collect()
    }

    pub fn is_ancestor_of(self, other: SyncTarget) -> bool {
        let mut cursor = other.structural_parent();
        while let Some(t) = cursor {
            if t == self {
                return true;
            }
            cursor = t.structural_parent();
        }
        false
    }
}

impl From<EntityKind> for SyncTarget {
    fn from(kind: EntityKind) -> Self {
        match kind {
            EntityKind::Directory => SyncTarget::Directory,
            EntityKind::Project => SyncTarget::Project,
            EntityKind::Phase => SyncTarget::Phase,
            EntityKind::Elevation => SyncTarget::Elevation,
        }
    }
}

impl fmt::Display for SyncTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTarget {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "artifact" => Ok(SyncTarget::Artifact),
            other => other.parse::<EntityKind>().map(SyncTarget::from),
        }
    }
}

/// A cached hierarchy row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchyEntity {
    pub id: i64,
    pub kind: EntityKind,
    pub external_id: String,
    pub name: String,
    pub parent_id: Option<i64>,
    pub attributes: BTreeMap<String, String>,
    pub source_modified_at: Option<DateTime<Utc>>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub excluded_from_sync: bool,
}

/// One child as reported by the source listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntity {
    pub external_id: String,
    pub name: String,
    #[serde(default)]
    pub source_modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// What the reconciler should do with a remote child given the cached row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertAction {
    Insert,
    Update,
    Unchanged,
    Skip,
}

impl RemoteEntity {
    /// Newer `source_modified_at` wins. Without a remote timestamp the row is
    /// only rewritten when its visible fields differ.
    pub fn reconcile(&self, cached: Option<&HierarchyEntity>) -> UpsertAction {
        let Some(cached) = cached else {
            return UpsertAction::Insert;
        };
        if cached.excluded_from_sync {
            return UpsertAction::Skip;
        }
        match (self.source_modified_at, cached.source_modified_at) {
            (Some(remote), Some(local)) if remote > local => UpsertAction::Update,
            (Some(_), None) => UpsertAction::Update,
            (Some(_), Some(_)) => UpsertAction::Unchanged,
            (None, _) => {
                if self.name != cached.name || self.attributes != cached.attributes {
                    UpsertAction::Update
                } else {
                    UpsertAction::Unchanged
                }
            }
        }
    }
}

/// Root-to-node chain of external ids, used to position a source session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextPath {
    segments: Vec<PathSegment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathSegment {
    pub kind: EntityKind,
    pub external_id: String,
}

impl ContextPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Appends the next level; levels must be pushed root first.
    pub fn push(&mut self, kind: EntityKind, external_id: impl Into<String>) -> Result<(), PathError> {
        let expected = self.depth();
        if kind.depth() != expected {
            return Err(PathError::OutOfOrder {
                expected_depth: expected,
                got: kind,
            });
        }
        self.segments.push(PathSegment {
            kind,
            external_id: external_id.into(),
        });
        Ok(())
    }

    pub fn with(mut self, kind: EntityKind, external_id: impl Into<String>) -> Result<Self, PathError> {
        self.push(kind, external_id)?;
        Ok(self)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn leaf_kind(&self) -> Option<EntityKind> {
        self.segments.last().map(|s| s.kind)
    }
}

impl fmt::Display for ContextPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for seg in &self.segments {
            write!(f, "/{}:{}", seg.kind, seg.external_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path segment {got} out of order (expected depth {expected_depth})")]
    OutOfOrder { expected_depth: usize, got: EntityKind },
}

/// Per-target refresh policy, validated from its stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPolicy {
    pub target: SyncTarget,
    pub interval: Duration,
    pub staleness_threshold: Duration,
    pub priority: i32,
    pub depends_on: Option<SyncTarget>,
    pub cascade: bool,
    pub enabled: bool,
}

/// SyncPolicy as persisted and edited by operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicyRow {
    pub target: String,
    pub interval_secs: i64,
    pub staleness_threshold_secs: i64,
    pub priority: i32,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub cascade: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unknown sync target `{0}`")]
    UnknownTarget(String),
    #[error("policy `{target}` has non-positive interval {secs}s")]
    NonPositiveInterval { target: String, secs: i64 },
    #[error("policy `{target}` has negative staleness threshold {secs}s")]
    NegativeThreshold { target: String, secs: i64 },
    #[error("policy `{target}` depends on `{depends_on}`, which is not one of its ancestors")]
    DependencyNotAncestor { target: String, depends_on: String },
    #[error("policy `{target}` duration {secs}s is out of range")]
    OutOfRange { target: String, secs: i64 },
}

impl SyncPolicyRow {
    pub fn validate(&self) -> Result<SyncPolicy, PolicyError> {
        let target: SyncTarget = self.target.parse()?;
        if self.interval_secs <= 0 {
            return Err(PolicyError::NonPositiveInterval {
                target: self.target.clone(),
                secs: self.interval_secs,
            });
        }
        if self.staleness_threshold_secs < 0 {
            return Err(PolicyError::NegativeThreshold {
                target: self.target.clone(),
                secs: self.staleness_threshold_secs,
            });
        }
        let depends_on = match self.depends_on.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) => {
                let dep: SyncTarget = name.parse()?;
                if !dep.is_ancestor_of(target) {
                    return Err(PolicyError::DependencyNotAncestor {
                        target: self.target.clone(),
                        depends_on: name.to_string(),
                    });
                }
                Some(dep)
            }
        };
        let seconds = |secs: i64| {
            Duration::try_seconds(secs).ok_or_else(|| PolicyError::OutOfRange {
                target: self.target.clone(),
                secs,
            })
        };
        Ok(SyncPolicy {
            target,
            interval: seconds(self.interval_secs)?,
            staleness_threshold: seconds(self.staleness_threshold_secs)?,
            priority: self.priority,
            depends_on,
            cascade: self.cascade,
            enabled: self.enabled,
        })
    }
}

/// Parse lifecycle of an elevation's current artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseState {
    Pending,
    InProgress,
    Success,
    Failed,
    ValidationFailed,
}

impl ParseState {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseState::Pending => "pending",
            ParseState::InProgress => "in_progress",
            ParseState::Success => "success",
            ParseState::Failed => "failed",
            ParseState::ValidationFailed => "validation_failed",
        }
    }

    /// Transitions for a single artifact. A different artifact hash resets the
    /// leaf to `Pending` and is not governed by this table.
    pub fn can_transition_to(self, next: ParseState) -> bool {
        use ParseState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Success)
                | (InProgress, Failed)
                | (InProgress, ValidationFailed)
                | (Failed, InProgress)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ParseState::Success | ParseState::ValidationFailed)
    }
}

impl fmt::Display for ParseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown parse state `{0}`")]
pub struct UnknownParseState(pub String);

impl FromStr for ParseState {
    type Err = UnknownParseState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParseState::Pending),
            "in_progress" => Ok(ParseState::InProgress),
            "success" => Ok(ParseState::Success),
            "failed" => Ok(ParseState::Failed),
            "validation_failed" => Ok(ParseState::ValidationFailed),
            other => Err(UnknownParseState(other.to_string())),
        }
    }
}

/// Scalar enrichment extracted from an elevation artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElevationDetails {
    pub width_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub description: Option<String>,
    pub system_code: Option<String>,
    pub material_code: Option<String>,
}

/// Child specification row owned by an elevation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlassSpec {
    pub spec_id: String,
    pub name: String,
}

/// Everything one successful parse writes for a leaf.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedArtifact {
    pub details: ElevationDetails,
    pub glass_specs: Vec<GlassSpec>,
}

/// Artifact metadata as tracked in the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub elevation_id: i64,
    pub content_hash: String,
    pub path: String,
    pub byte_size: i64,
    pub trusted: bool,
}

/// Parse bookkeeping for one elevation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseStatus {
    pub elevation_id: i64,
    pub state: ParseState,
    pub artifact_hash: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: i64,
    pub parsed_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Error classes shared by every layer; they drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ContextConflict,
    Transient,
    Validation,
    Persistence,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::ContextConflict => "context_conflict",
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Persistence => "persistence",
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::Persistence)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every crate-level error so the worker pool can decide on retries.
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

/// Per-child failure inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityError {
    pub external_id: String,
    pub class: ErrorClass,
    pub message: String,
}

/// Aggregate of one reconcile pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub errors: Vec<EntityError>,
}

impl SyncResult {
    pub fn record(&mut self, action: UpsertAction) {
        match action {
            UpsertAction::Insert => self.created += 1,
            UpsertAction::Update => self.updated += 1,
            UpsertAction::Unchanged => self.unchanged += 1,
            UpsertAction::Skip => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: SyncResult) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }
}

/// Why a scope was put on the work list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DueReason {
    NeverSynced,
    IntervalElapsed,
    Cascade,
}

/// One scheduled pass: refresh `target` inside `scope_id` (`None` = root).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub target: SyncTarget,
    pub scope_id: Option<i64>,
    pub priority: i32,
    pub reason: DueReason,
    pub stale: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Bookkeeping for one `(target, scope)` pair as seen by the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeState {
    pub scope_id: Option<i64>,
    /// Last pass attempt, successful or not. Drives the interval trigger.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Last successful pass. Drives the staleness signal.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Set by a cascading parent sync; cleared by the next pass.
    pub forced: bool,
}

/// Timestamps the scheduler reads on a tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSnapshot {
    pub scopes: BTreeMap<SyncTarget, Vec<ScopeState>>,
    /// Targets with at least one successfully synced instance.
    pub synced: BTreeSet<SyncTarget>,
}

impl ScheduleSnapshot {
    pub fn scopes_for(&self, target: SyncTarget) -> &[ScopeState] {
        self.scopes.get(&target).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_synced_instance(&self, target: SyncTarget) -> bool {
        self.synced.contains(&target)
    }
}

/// Identifier for an orchestrated run; carried in every job span.
pub fn new_run_id() -> Uuid {
    Uuid::new_v4()
}

/// Time source. Injected everywhere timestamps are compared.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and replays.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, m, 0).single().unwrap()
    }

    fn cached(modified: Option<DateTime<Utc>>) -> HierarchyEntity {
        HierarchyEntity {
            id: 1,
            kind: EntityKind::Phase,
            external_id: "0".into(),
            name: "Default".into(),
            parent_id: Some(7),
            attributes: BTreeMap::new(),
            source_modified_at: modified,
            last_synced_at: None,
            excluded_from_sync: false,
        }
    }

    fn remote(modified: Option<DateTime<Utc>>) -> RemoteEntity {
        RemoteEntity {
            external_id: "0".into(),
            name: "Default".into(),
            source_modified_at: modified,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn reconcile_prefers_newer_source_timestamp() {
        assert_eq!(remote(Some(ts(10, 0))).reconcile(None), UpsertAction::Insert);
        assert_eq!(
            remote(Some(ts(11, 0))).reconcile(Some(&cached(Some(ts(10, 0))))),
            UpsertAction::Update
        );
        assert_eq!(
            remote(Some(ts(10, 0))).reconcile(Some(&cached(Some(ts(10, 0))))),
            UpsertAction::Unchanged
        );
        assert_eq!(
            remote(Some(ts(9, 0))).reconcile(Some(&cached(Some(ts(10, 0))))),
            UpsertAction::Unchanged
        );
    }

    #[test]
    fn reconcile_without_timestamp_compares_fields() {
        let mut r = remote(None);
        assert_eq!(r.reconcile(Some(&cached(None))), UpsertAction::Unchanged);
        r.name = "Renamed".into();
        assert_eq!(r.reconcile(Some(&cached(None))), UpsertAction::Update);
    }

    #[test]
    fn excluded_rows_are_skipped() {
        let mut row = cached(Some(ts(8, 0)));
        row.excluded_from_sync = true;
        assert_eq!(remote(Some(ts(12, 0))).reconcile(Some(&row)), UpsertAction::Skip);
    }

    #[test]
    fn targets_know_their_ancestry() {
        assert_eq!(SyncTarget::Directory.structural_parent(), None);
        assert_eq!(SyncTarget::Artifact.structural_parent(), Some(SyncTarget::Elevation));
        assert!(SyncTarget::Directory.is_ancestor_of(SyncTarget::Artifact));
        assert!(!SyncTarget::Artifact.is_ancestor_of(SyncTarget::Phase));
        assert_eq!(SyncTarget::Phase.children(), vec![SyncTarget::Elevation]);
        assert_eq!("ARTIFACT".parse::<SyncTarget>().unwrap(), SyncTarget::Artifact);
    }

    #[test]
    fn policy_rows_validate() {
        let row = SyncPolicyRow {
            target: "phase".into(),
            interval_secs: 1800,
            staleness_threshold_secs: 7200,
            priority: 2,
            depends_on: Some("project".into()),
            cascade: true,
            enabled: true,
        };
        let policy = row.validate().unwrap();
        assert_eq!(policy.target, SyncTarget::Phase);
        assert_eq!(policy.interval, Duration::minutes(30));
        assert_eq!(policy.depends_on, Some(SyncTarget::Project));

        let bad_dep = SyncPolicyRow {
            depends_on: Some("elevation".into()),
            ..row.clone()
        };
        assert!(matches!(
            bad_dep.validate(),
            Err(PolicyError::DependencyNotAncestor { .. })
        ));

        let zero = SyncPolicyRow {
            interval_secs: 0,
            ..row.clone()
        };
        assert!(matches!(zero.validate(), Err(PolicyError::NonPositiveInterval { .. })));

        let endless = SyncPolicyRow {
            interval_secs: i64::MAX,
            ..row.clone()
        };
        assert!(matches!(endless.validate(), Err(PolicyError::OutOfRange { .. })));

        let unknown = SyncPolicyRow {
            target: "facade".into(),
            ..row
        };
        assert!(matches!(unknown.validate(), Err(PolicyError::UnknownTarget(_))));
    }

    #[test]
    fn parse_state_transitions() {
        use ParseState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(ValidationFailed));
        assert!(Failed.can_transition_to(InProgress));
        assert!(!ValidationFailed.can_transition_to(InProgress));
        assert!(!Success.can_transition_to(Failed));
        assert_eq!("validation_failed".parse::<ParseState>().unwrap(), ValidationFailed);
        assert_eq!(serde_json::to_string(&InProgress).unwrap(), "\"in_progress\"");
    }

    #[test]
    fn context_paths_are_forward_only() {
        let path = ContextPath::root()
            .with(EntityKind::Directory, "D1")
            .and_then(|p| p.with(EntityKind::Project, "P1"))
            .unwrap();
        assert_eq!(path.to_string(), "/directory:D1/project:P1");
        assert!(path.clone().with(EntityKind::Elevation, "E1").is_err());
        assert_eq!(path.depth(), 2);
        assert_eq!(path.leaf_kind(), Some(EntityKind::Project));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(ts(8, 0));
        clock.advance(Duration::minutes(45));
        assert_eq!(clock.now(), ts(8, 45));
    }
}
