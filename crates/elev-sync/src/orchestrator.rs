use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use elev_core::{
    new_run_id, Classify, Clock, EntityKind, ErrorClass, SyncResult, SyncTarget, SystemClock,
    WorkItem,
};
use elev_source::{SessionClient, SourceTransport};
use elev_storage::{db, ArtifactStore, EntityRepository, NewErrorLog, SyncRunRecord};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::artifact::{ArtifactParser, ArtifactPipeline, CommitHook, ParseOutcome};
use crate::config::{load_policy_file, seed_policies, SyncConfig};
use crate::entity_sync::{ChildSync, EntitySyncService};
use crate::scheduler::{SkippedPolicy, SyncScheduler, TickContext, TickPlan};
use crate::worker::{JobReport, WorkerPool};
use crate::JobError;

/// One unit handed to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncJob {
    Children {
        target: SyncTarget,
        scope_id: Option<i64>,
    },
    Artifact {
        elevation_id: i64,
    },
    Reparse {
        elevation_id: i64,
    },
}

impl SyncJob {
    fn from_item(item: &WorkItem) -> Option<Self> {
        match (item.target, item.scope_id) {
            (SyncTarget::Artifact, Some(elevation_id)) => Some(SyncJob::Artifact { elevation_id }),
            (SyncTarget::Artifact, None) => None,
            (target, scope_id) => Some(SyncJob::Children { target, scope_id }),
        }
    }

    /// The job that refreshes what sits under `id`, a row written by `target`.
    fn below(target: SyncTarget, id: i64) -> Option<Self> {
        match target.children().first().copied()? {
            SyncTarget::Artifact => Some(SyncJob::Artifact { elevation_id: id }),
            child => Some(SyncJob::Children {
                target: child,
                scope_id: Some(id),
            }),
        }
    }

    fn stage(&self) -> &'static str {
        match self {
            SyncJob::Children { .. } => "entity_sync",
            SyncJob::Artifact { .. } => "artifact_fetch",
            SyncJob::Reparse { .. } => "artifact_parse",
        }
    }

    /// The entity an error on this job is filed against.
    fn subject(&self) -> (EntityKind, Option<i64>) {
        match *self {
            SyncJob::Children { target, scope_id } => {
                (target.scope_kind().unwrap_or(EntityKind::Directory), scope_id)
            }
            SyncJob::Artifact { elevation_id } | SyncJob::Reparse { elevation_id } => {
                (EntityKind::Elevation, Some(elevation_id))
            }
        }
    }
}

enum JobOutput {
    Children(ChildSync),
    Artifact(ParseOutcome),
}

/// Counts and first errors of one orchestrated run; persisted to `sync_runs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub trigger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub work_items: usize,
    pub entities: SyncResult,
    pub artifacts_parsed: usize,
    pub artifacts_skipped: usize,
    pub artifacts_failed: usize,
    pub jobs_failed: usize,
    pub swept: usize,
    pub stale_scopes: usize,
    pub skipped_policies: Vec<SkippedPolicy>,
    pub error_count: usize,
    pub errors: Vec<String>,
    #[serde(skip)]
    error_limit: usize,
}

impl RunSummary {
    fn new(run_id: Uuid, trigger: &str, started_at: DateTime<Utc>, error_limit: usize) -> Self {
        Self {
            run_id,
            trigger: trigger.to_string(),
            started_at,
            finished_at: started_at,
            work_items: 0,
            entities: SyncResult::default(),
            artifacts_parsed: 0,
            artifacts_skipped: 0,
            artifacts_failed: 0,
            jobs_failed: 0,
            swept: 0,
            stale_scopes: 0,
            skipped_policies: Vec::new(),
            error_count: 0,
            errors: Vec::new(),
            error_limit,
        }
    }

    fn note_error(&mut self, message: String) {
        self.error_count += 1;
        if self.errors.len() < self.error_limit {
            self.errors.push(message);
        }
    }

    pub fn status(&self) -> &'static str {
        if self.error_count == 0 {
            "success"
        } else {
            "partial"
        }
    }
}

/// Owns one tick at a time: sweep, plan, execute waves, persist the run.
pub struct SyncOrchestrator {
    config: SyncConfig,
    repo: EntityRepository,
    entities: EntitySyncService,
    artifacts: ArtifactPipeline,
    pool: WorkerPool,
    clock: Arc<dyn Clock>,
    tick_lock: Mutex<()>,
    cancel: watch::Sender<bool>,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        repo: EntityRepository,
        transport: Arc<dyn SourceTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let client = SessionClient::new(transport);
        let (cancel, cancel_rx) = watch::channel(false);
        let pool = WorkerPool::new(config.workers, config.backoff(), config.job_timeout, cancel_rx);
        let entities = EntitySyncService::new(repo.clone(), client.clone(), Arc::clone(&clock));
        let artifacts = ArtifactPipeline::new(
            repo.clone(),
            ArtifactStore::new(config.artifacts_dir.clone()),
            client,
            ArtifactParser::new(config.max_artifact_bytes),
            Arc::clone(&clock),
            config.parse_retry_ceiling,
        );
        Self {
            config,
            repo,
            entities,
            artifacts,
            pool,
            clock,
            tick_lock: Mutex::new(()),
            cancel,
        }
    }

    /// Open and migrate the cache, seed policies, and connect the configured upstream.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let pool = db::open(&config.database_url).await?;
        let reader = db::connect_reader(&config.database_url, config.read_connections).await?;
        let repo = EntityRepository::with_reader(pool, reader);
        let transport = config.build_transport()?;
        let orchestrator = Self::new(config, repo, transport, Arc::new(SystemClock));
        orchestrator.seed_policies().await?;
        Ok(orchestrator)
    }

    pub fn with_commit_hook(mut self, hook: Arc<dyn CommitHook>) -> Self {
        self.artifacts = self.artifacts.with_commit_hook(hook);
        self
    }

    pub fn repo(&self) -> &EntityRepository {
        &self.repo
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stop handing out new attempts. Running attempts finish.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    pub async fn seed_policies(&self) -> Result<usize> {
        let path = self.config.policies_path();
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            warn!(path = %path.display(), "no policy file; keeping stored policies");
            return Ok(0);
        }
        let rows = load_policy_file(&path).await?;
        seed_policies(&self.repo, &rows, self.clock.now()).await
    }

    /// Reset parse claims older than the job timeout.
    pub async fn sweep(&self) -> Result<Vec<i64>> {
        let now = self.clock.now();
        let timeout = chrono::Duration::from_std(self.config.job_timeout)
            .context("job timeout out of range")?;
        let swept = self.repo.sweep_stale_claims(now - timeout, now).await?;
        if !swept.is_empty() {
            warn!(count = swept.len(), "expired parse claims re-queued");
        }
        Ok(swept)
    }

    /// What the next tick would run, without running it.
    pub async fn preview(&self) -> Result<TickPlan> {
        let policies = self.repo.policy_rows().await?;
        let snapshot = self.repo.schedule_snapshot().await?;
        Ok(SyncScheduler::tick(&TickContext {
            now: self.clock.now(),
            policies: &policies,
            snapshot: &snapshot,
        }))
    }

    /// One scheduler pass. Returns `None` when a previous tick still runs.
    pub async fn run_tick(&self) -> Result<Option<RunSummary>> {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!("previous tick still running; skipping");
            return Ok(None);
        };
        let run_id = new_run_id();
        self.tick(run_id)
            .instrument(info_span!("sync_tick", %run_id))
            .await
            .map(Some)
    }

    async fn tick(&self, run_id: Uuid) -> Result<RunSummary> {
        let mut summary = RunSummary::new(
            run_id,
            "scheduled",
            self.clock.now(),
            self.config.error_summary_limit,
        );
        summary.swept = self.sweep().await?.len();

        let plan = self.preview().await?;
        for stale in &plan.stale {
            debug!(target_name = %stale.target, scope_id = ?stale.scope_id, "scope stale but not due");
        }
        if !plan.stale.is_empty() {
            warn!(count = plan.stale.len(), "stale scopes waiting for their interval");
        }
        summary.work_items = plan.item_count();
        summary.stale_scopes = plan.stale.len();
        summary.skipped_policies = plan.skipped.clone();
        info!(items = summary.work_items, waves = plan.waves.len(), "tick planned");

        let mut handled = HashSet::new();
        for wave in &plan.waves {
            let jobs: Vec<SyncJob> = wave.items.iter().filter_map(SyncJob::from_item).collect();
            handled.extend(jobs.iter().filter_map(|job| match job {
                SyncJob::Artifact { elevation_id } => Some(*elevation_id),
                _ => None,
            }));
            self.run_wave(run_id, jobs, wave.policy.cascade, &mut summary)
                .await?;
        }

        let retries: Vec<SyncJob> = self
            .repo
            .parse_candidates(self.config.parse_retry_ceiling)
            .await?
            .into_iter()
            .filter(|id| !handled.contains(id))
            .map(|elevation_id| SyncJob::Reparse { elevation_id })
            .collect();
        if !retries.is_empty() {
            info!(count = retries.len(), "re-parsing queued artifacts");
            self.run_wave(run_id, retries, false, &mut summary).await?;
        }

        self.finish(summary).await
    }

    /// Operator-triggered full refresh of a subtree (`None` = whole catalog),
    /// ignoring intervals. Waits for a running tick instead of skipping.
    pub async fn force_sync(&self, root: Option<(EntityKind, i64)>) -> Result<RunSummary> {
        let _guard = self.tick_lock.lock().await;
        let run_id = new_run_id();
        let span = info_span!("forced_sync", %run_id, root = ?root);
        async {
            let mut summary = RunSummary::new(
                run_id,
                "manual",
                self.clock.now(),
                self.config.error_summary_limit,
            );
            let mut level = match root {
                None => vec![SyncJob::Children {
                    target: SyncTarget::Directory,
                    scope_id: None,
                }],
                Some((kind, id)) => {
                    if self.repo.visible_entity(kind, id).await?.is_none() {
                        bail!("{kind} {id} is unknown or excluded from sync");
                    }
                    match kind.child() {
                        None => vec![SyncJob::Artifact { elevation_id: id }],
                        Some(child) => vec![SyncJob::Children {
                            target: SyncTarget::from(child),
                            scope_id: Some(id),
                        }],
                    }
                }
            };

            while !level.is_empty() {
                summary.work_items += level.len();
                let produced = self.run_wave(run_id, level, false, &mut summary).await?;
                level = produced
                    .into_iter()
                    .flat_map(|(target, child)| {
                        child
                            .child_ids
                            .into_iter()
                            .filter_map(move |id| SyncJob::below(target, id))
                    })
                    .collect();
            }
            self.finish(summary).await
        }
        .instrument(span)
        .await
    }

    /// Store an operator-supplied artifact for an elevation and parse it untrusted.
    pub async fn import_artifact(&self, elevation_id: i64, file: &Path) -> Result<ParseOutcome> {
        let run_id = new_run_id();
        self.artifacts
            .import(elevation_id, file, run_id)
            .await
            .with_context(|| format!("importing {} for elevation {elevation_id}", file.display()))
    }

    /// Execute one wave through the pool and settle bookkeeping. Returns the
    /// successful listing passes for callers that descend further.
    async fn run_wave(
        &self,
        run_id: Uuid,
        jobs: Vec<SyncJob>,
        cascade: bool,
        summary: &mut RunSummary,
    ) -> Result<Vec<(SyncTarget, ChildSync)>> {
        let entities = self.entities.clone();
        let artifacts = self.artifacts.clone();
        let reports = self
            .pool
            .run(jobs, move |job| {
                let entities = entities.clone();
                let artifacts = artifacts.clone();
                async move {
                    match job {
                        SyncJob::Children { target, scope_id } => {
                            entities.sync(target, scope_id).await.map(JobOutput::Children)
                        }
                        SyncJob::Artifact { elevation_id } => {
                            artifacts.fetch(elevation_id, run_id).await.map(JobOutput::Artifact)
                        }
                        SyncJob::Reparse { elevation_id } => {
                            artifacts.reparse(elevation_id, run_id).await.map(JobOutput::Artifact)
                        }
                    }
                }
            })
            .await;

        let mut produced = Vec::new();
        for report in reports {
            if let Some(pass) = self.settle(run_id, report, cascade, summary).await? {
                produced.push(pass);
            }
        }
        Ok(produced)
    }

    async fn settle(
        &self,
        run_id: Uuid,
        report: JobReport<SyncJob, JobOutput>,
        cascade: bool,
        summary: &mut RunSummary,
    ) -> Result<Option<(SyncTarget, ChildSync)>> {
        let now = self.clock.now();
        let job = report.job;
        match report.outcome {
            Ok(JobOutput::Children(child)) => {
                let SyncJob::Children { target, scope_id } = job else {
                    bail!("listing output for {job:?}");
                };
                self.repo.record_pass(target, scope_id, now, None).await?;
                if cascade {
                    for child_target in target.children() {
                        self.repo.force_scopes(child_target, &child.child_ids).await?;
                    }
                }
                self.repo
                    .force_scopes(SyncTarget::Artifact, &child.changed_leaves)
                    .await?;
                let (kind, _) = job.subject();
                for err in &child.result.errors {
                    let message = format!("{} `{}`: {}", target, err.external_id, err.message);
                    self.log_error(run_id, kind, scope_id, job.stage(), err.class, &message)
                        .await?;
                    summary.note_error(message);
                }
                summary.entities.merge(child.result.clone());
                Ok(Some((target, child)))
            }
            Ok(JobOutput::Artifact(outcome)) => {
                let failure = outcome.failure();
                // Only a settled leaf counts as a successful pass.
                let note = match (&failure, outcome.is_settled()) {
                    (Some(message), _) => Some(message.clone()),
                    (None, true) => None,
                    (None, false) => Some(format!("artifact left unsettled: {outcome:?}")),
                };
                if let SyncJob::Artifact { elevation_id } = job {
                    self.repo
                        .record_pass(SyncTarget::Artifact, Some(elevation_id), now, note.as_deref())
                        .await?;
                }
                if let Some(message) = failure {
                    summary.artifacts_failed += 1;
                    let (_, id) = job.subject();
                    summary.note_error(format!("elevation {}: {message}", id.unwrap_or_default()));
                } else if matches!(outcome, ParseOutcome::Parsed { .. }) {
                    summary.artifacts_parsed += 1;
                } else {
                    summary.artifacts_skipped += 1;
                }
                Ok(None)
            }
            Err(JobError::Cancelled) => {
                summary.jobs_failed += 1;
                summary.note_error(format!("{job:?}: cancelled"));
                Ok(None)
            }
            Err(err) => {
                summary.jobs_failed += 1;
                let message = err.to_string();
                // A conflict leaves the scope's marks alone; it stays due for a fresh session.
                if err.class() != ErrorClass::ContextConflict {
                    match job {
                        SyncJob::Children { target, scope_id } => {
                            self.repo.record_pass(target, scope_id, now, Some(&message)).await?;
                        }
                        SyncJob::Artifact { elevation_id } => {
                            self.repo
                                .record_pass(SyncTarget::Artifact, Some(elevation_id), now, Some(&message))
                                .await?;
                        }
                        SyncJob::Reparse { .. } => {}
                    }
                }
                if matches!(job, SyncJob::Artifact { .. } | SyncJob::Reparse { .. }) {
                    summary.artifacts_failed += 1;
                }
                // Parse failures were logged by the pipeline with their own stage.
                if !matches!(err, JobError::Parse(_)) {
                    let (kind, id) = job.subject();
                    self.log_error(run_id, kind, id, job.stage(), err.class(), &message)
                        .await?;
                }
                summary.note_error(format!("{job:?}: {message}"));
                Ok(None)
            }
        }
    }

    async fn log_error(
        &self,
        run_id: Uuid,
        kind: EntityKind,
        entity_id: Option<i64>,
        stage: &str,
        class: ErrorClass,
        message: &str,
    ) -> Result<()> {
        self.repo
            .append_error(&NewErrorLog {
                occurred_at: self.clock.now(),
                entity_kind: kind,
                entity_id,
                run_id: Some(run_id),
                stage: stage.to_string(),
                class,
                message: message.to_string(),
            })
            .await?;
        Ok(())
    }

    async fn finish(&self, mut summary: RunSummary) -> Result<RunSummary> {
        summary.finished_at = self.clock.now();
        self.repo
            .insert_run(&SyncRunRecord {
                run_id: summary.run_id,
                trigger: summary.trigger.clone(),
                started_at: summary.started_at,
                finished_at: summary.finished_at,
                status: summary.status().to_string(),
                summary: serde_json::to_value(&summary).context("encoding run summary")?,
            })
            .await?;
        info!(
            run_id = %summary.run_id,
            trigger = %summary.trigger,
            created = summary.entities.created,
            updated = summary.entities.updated,
            parsed = summary.artifacts_parsed,
            failed_jobs = summary.jobs_failed,
            errors = summary.error_count,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Register the cron-driven tick when the scheduler is enabled.
    pub async fn start_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.tick_cron.clone();
        let orchestrator = Arc::clone(&self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                match orchestrator.run_tick().await {
                    Ok(Some(summary)) => {
                        debug!(run_id = %summary.run_id, status = summary.status(), "scheduled tick done")
                    }
                    Ok(None) => {}
                    Err(err) => error!(error = ?err, "scheduled tick failed"),
                }
            })
        })
        .with_context(|| format!("creating tick job for cron {cron}"))?;
        sched.add(job).await.context("adding tick job")?;
        sched.start().await.context("starting scheduler")?;
        info!(%cron, "tick scheduler started");
        Ok(Some(sched))
    }
}
