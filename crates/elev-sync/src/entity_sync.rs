use std::sync::Arc;

use elev_core::{
    Classify, Clock, ContextPath, EntityError, EntityKind, SyncResult, SyncTarget, UpsertAction,
};
use elev_source::SessionClient;
use elev_storage::EntityRepository;
use tracing::{debug, info};

use crate::JobError;

/// Outcome of one listing pass under a single parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildSync {
    pub result: SyncResult,
    /// Cache ids of every child the listing reported, excluded ones left out.
    pub child_ids: Vec<i64>,
    /// Elevations that were inserted or changed upstream in this pass.
    pub changed_leaves: Vec<i64>,
}

/// Reconciles one hierarchy level under one parent against the upstream
/// listing. Rows missing upstream are never deleted here.
#[derive(Clone)]
pub struct EntitySyncService {
    repo: EntityRepository,
    client: SessionClient,
    clock: Arc<dyn Clock>,
}

impl EntitySyncService {
    pub fn new(repo: EntityRepository, client: SessionClient, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            client,
            clock,
        }
    }

    /// Refresh the children `target` writes inside `scope_id` (`None` = root).
    pub async fn sync(&self, target: SyncTarget, scope_id: Option<i64>) -> Result<ChildSync, JobError> {
        let kind = target
            .entity_kind()
            .ok_or(JobError::NotAHierarchyTarget(target))?;
        let path = match (kind.parent(), scope_id) {
            (Some(parent_kind), Some(id)) => self.repo.context_path(parent_kind, id).await?,
            (None, None) => ContextPath::root(),
            _ => return Err(JobError::ScopeMismatch { target, scope_id }),
        };

        let mut session = self.client.open_at(&path).await?;
        let listed = session.list_children(kind).await;
        session.close().await;
        let remote = listed?;
        debug!(%path, %kind, listed = remote.len(), "remote listing fetched");

        let now = self.clock.now();
        let mut out = ChildSync::default();
        let mut unchanged = Vec::new();
        for child in &remote {
            match self.repo.upsert_child(kind, scope_id, child, now).await {
                Ok((action, id)) => {
                    out.result.record(action);
                    match action {
                        UpsertAction::Skip => continue,
                        UpsertAction::Unchanged => unchanged.push(child.external_id.clone()),
                        UpsertAction::Insert | UpsertAction::Update => {
                            if kind == EntityKind::Elevation {
                                out.changed_leaves.push(id);
                            }
                        }
                    }
                    out.child_ids.push(id);
                }
                Err(err) => out.result.errors.push(EntityError {
                    external_id: child.external_id.clone(),
                    class: err.class(),
                    message: err.to_string(),
                }),
            }
        }
        self.repo.touch_synced(kind, scope_id, &unchanged, now).await?;

        info!(
            %path,
            %kind,
            created = out.result.created,
            updated = out.result.updated,
            unchanged = out.result.unchanged,
            skipped = out.result.skipped,
            errors = out.result.error_count(),
            "children reconciled"
        );
        Ok(out)
    }
}
