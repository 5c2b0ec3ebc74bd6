//! In-memory upstream backed by a JSON catalog. Enforces the same forward-only
//! navigation rule as the real API.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elev_core::{ContextPath, EntityKind, RemoteEntity};
use serde::{Deserialize, Serialize};

use crate::{SessionToken, SourceError, SourceTransport};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FixtureNode>,
    /// Base64 artifact; only meaningful on elevations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
}

impl FixtureNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn modified(mut self, at: DateTime<Utc>) -> Self {
        self.modified_at = Some(at);
        self
    }

    pub fn child(mut self, node: FixtureNode) -> Self {
        self.children.push(node);
        self
    }

    pub fn with_artifact(mut self, base64: impl Into<String>) -> Self {
        self.artifact = Some(base64.into());
        self
    }

    fn remote(&self) -> RemoteEntity {
        RemoteEntity {
            external_id: self.id.clone(),
            name: self.name.clone(),
            source_modified_at: self.modified_at,
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureCatalog {
    pub directories: Vec<FixtureNode>,
}

impl FixtureCatalog {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture catalog {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("parsing fixture catalog {}", path.display()))
    }

    pub fn children_at(&self, path: &ContextPath) -> Option<&[FixtureNode]> {
        let mut level = self.directories.as_slice();
        for seg in path.segments() {
            level = level
                .iter()
                .find(|n| n.id == seg.external_id)?
                .children
                .as_slice();
        }
        Some(level)
    }

    pub fn node_mut(&mut self, path: &ContextPath) -> Option<&mut FixtureNode> {
        let (last, ancestors) = path.segments().split_last()?;
        let mut level = &mut self.directories;
        for seg in ancestors {
            level = &mut { level }.iter_mut().find(|n| n.id == seg.external_id)?.children;
        }
        level.iter_mut().find(|n| n.id == last.external_id)
    }

    pub fn node(&self, path: &ContextPath) -> Option<&FixtureNode> {
        let (last, ancestors) = path.segments().split_last()?;
        let mut level = self.directories.as_slice();
        for seg in ancestors {
            level = level.iter().find(|n| n.id == seg.external_id)?.children.as_slice();
        }
        level.iter().find(|n| n.id == last.external_id)
    }
}

/// Sessions a fixture keeps before the oldest are forgotten. Closed sessions
/// are released right away; this only bounds the ones abandoned mid-job.
pub const MAX_OPEN_SESSIONS: usize = 64;

const TOKEN_PREFIX: &str = "fixture-";

/// Serves a [`FixtureCatalog`] through the [`SourceTransport`] contract.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    catalog: RwLock<FixtureCatalog>,
    /// Keyed by the token's sequence number, so the first entry is the oldest.
    sessions: Mutex<BTreeMap<usize, ContextPath>>,
    auth_count: AtomicUsize,
    transient_failures: AtomicUsize,
    context_conflicts: AtomicUsize,
}

fn token_slot(token: &SessionToken) -> Option<usize> {
    token.0.strip_prefix(TOKEN_PREFIX)?.parse().ok()
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl FixtureTransport {
    pub fn new(catalog: FixtureCatalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            ..Self::default()
        }
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self::new(FixtureCatalog::load(path)?))
    }

    /// Sessions opened so far.
    pub fn auth_count(&self) -> usize {
        self.auth_count.load(Ordering::SeqCst)
    }

    /// Sessions authenticated and not yet released.
    pub fn open_sessions(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// The next `n` listing or artifact calls fail as transient.
    pub fn inject_transient_failures(&self, n: usize) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    /// The next `n` listing or artifact calls report that the session's
    /// upstream context moved, as a concurrent reuse of the token would.
    pub fn inject_context_conflicts(&self, n: usize) {
        self.context_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut FixtureCatalog) -> R) -> R {
        let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        f(&mut catalog)
    }

    fn take_injected(&self, current: &ContextPath) -> Result<(), SourceError> {
        if take_one(&self.context_conflicts) {
            return Err(SourceError::ContextConflict {
                path: current.to_string(),
                detail: "session context changed upstream".into(),
            });
        }
        if take_one(&self.transient_failures) {
            return Err(SourceError::Transient("injected fixture failure".into()));
        }
        Ok(())
    }

    fn context(&self, token: &SessionToken) -> Result<ContextPath, SourceError> {
        let slot = token_slot(token).ok_or(SourceError::Unauthorized)?;
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(&slot).cloned().ok_or(SourceError::Unauthorized)
    }
}

#[async_trait]
impl SourceTransport for FixtureTransport {
    async fn authenticate(&self) -> Result<SessionToken, SourceError> {
        let n = self.auth_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        while sessions.len() >= MAX_OPEN_SESSIONS {
            sessions.pop_first();
        }
        sessions.insert(n, ContextPath::root());
        Ok(SessionToken(format!("{TOKEN_PREFIX}{n}")))
    }

    async fn select(
        &self,
        token: &SessionToken,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<(), SourceError> {
        let current = self.context(token)?;
        let next = current.clone().with(kind, external_id).map_err(|e| {
            SourceError::ContextConflict {
                path: current.to_string(),
                detail: e.to_string(),
            }
        })?;
        {
            let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
            let exists = catalog
                .children_at(&current)
                .is_some_and(|nodes| nodes.iter().any(|n| n.id == external_id));
            if !exists {
                return Err(SourceError::NotFound {
                    kind,
                    external_id: external_id.to_string(),
                });
            }
        }
        if let Some(slot) = token_slot(token) {
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(slot, next);
        }
        Ok(())
    }

    async fn list_children(
        &self,
        token: &SessionToken,
        kind: EntityKind,
    ) -> Result<Vec<RemoteEntity>, SourceError> {
        let current = self.context(token)?;
        if kind.depth() != current.depth() {
            return Err(SourceError::ContextConflict {
                path: current.to_string(),
                detail: format!("{kind} is not the next level"),
            });
        }
        self.take_injected(&current)?;
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        Ok(catalog
            .children_at(&current)
            .map(|nodes| nodes.iter().map(FixtureNode::remote).collect())
            .unwrap_or_default())
    }

    async fn get_artifact(
        &self,
        token: &SessionToken,
        elevation_external_id: &str,
    ) -> Result<String, SourceError> {
        let current = self.context(token)?;
        let selected = current
            .segments()
            .last()
            .is_some_and(|s| s.kind == EntityKind::Elevation && s.external_id == elevation_external_id);
        if !selected {
            return Err(SourceError::ContextConflict {
                path: current.to_string(),
                detail: format!("elevation `{elevation_external_id}` is not selected"),
            });
        }
        self.take_injected(&current)?;
        let catalog = self.catalog.read().unwrap_or_else(|e| e.into_inner());
        catalog
            .node(&current)
            .and_then(|n| n.artifact.clone())
            .ok_or_else(|| SourceError::NotFound {
                kind: EntityKind::Elevation,
                external_id: elevation_external_id.to_string(),
            })
    }

    async fn release(&self, token: &SessionToken) {
        if let Some(slot) = token_slot(token) {
            self.sessions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&slot);
        }
    }
}
