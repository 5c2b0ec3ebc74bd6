//! Session-oriented access to the upstream design-system API.
//!
//! The upstream keeps a navigation context per session and only ever lets it
//! move deeper: directory, project, phase, elevation. [`Session`] mirrors that
//! context locally so an out-of-order select fails before any request is sent,
//! and a session that hit a conflict is poisoned for good. Callers that need a
//! different branch open a new session through [`SessionClient`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use elev_core::{Classify, ContextPath, EntityKind, ErrorClass, PathError, RemoteEntity};
use thiserror::Error;
use tracing::debug;

pub mod fixture;
pub mod http;

pub use fixture::{FixtureCatalog, FixtureNode, FixtureTransport};
pub use http::{HttpTransport, HttpTransportConfig, RequestBudget};

pub const CRATE_NAME: &str = "elev-source";

/// Opaque credential returned by `authenticate`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(pub String);

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(..)")
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("context conflict at {path}: {detail}")]
    ContextConflict { path: String, detail: String },
    #[error("session already failed with a context conflict")]
    Poisoned,
    #[error("upstream unavailable: {0}")]
    Transient(String),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("authentication rejected")]
    Unauthorized,
    #[error("{kind} `{external_id}` not found upstream")]
    NotFound {
        kind: EntityKind,
        external_id: String,
    },
    #[error("invalid upstream payload: {0}")]
    Payload(String),
    #[error(transparent)]
    Path(#[from] PathError),
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        match self {
            SourceError::ContextConflict { .. } | SourceError::Poisoned | SourceError::Path(_) => {
                ErrorClass::ContextConflict
            }
            SourceError::Transient(_) => ErrorClass::Transient,
            SourceError::HttpStatus { status, .. } => http::class_for_status(*status),
            SourceError::Request(err) => {
                if err.is_timeout() || err.is_connect() || err.is_request() {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Validation
                }
            }
            SourceError::Unauthorized | SourceError::NotFound { .. } | SourceError::Payload(_) => {
                ErrorClass::Validation
            }
        }
    }
}

/// Wire-level operations. Implementations are stateless with respect to
/// navigation; the context lives upstream, keyed by the token.
#[async_trait]
pub trait SourceTransport: Send + Sync {
    async fn authenticate(&self) -> Result<SessionToken, SourceError>;

    async fn select(
        &self,
        token: &SessionToken,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<(), SourceError>;

    /// Children of `kind` under the session's current context.
    async fn list_children(
        &self,
        token: &SessionToken,
        kind: EntityKind,
    ) -> Result<Vec<RemoteEntity>, SourceError>;

    /// Base64 artifact of the currently selected elevation.
    async fn get_artifact(
        &self,
        token: &SessionToken,
        elevation_external_id: &str,
    ) -> Result<String, SourceError>;

    /// Forget a finished session. Upstream tokens that simply expire need nothing here.
    async fn release(&self, _token: &SessionToken) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Poisoned,
}

/// One authenticated, forward-only navigation context. Not `Clone`: a session
/// belongs to exactly one job.
pub struct Session {
    transport: Arc<dyn SourceTransport>,
    token: SessionToken,
    path: ContextPath,
    state: SessionState,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.path.to_string())
            .field("state", &self.state)
            .finish()
    }
}

impl Session {
    pub fn path(&self) -> &ContextPath {
        &self.path
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == SessionState::Poisoned
    }

    fn next_kind(&self) -> Option<EntityKind> {
        match self.path.leaf_kind() {
            None => Some(EntityKind::Directory),
            Some(kind) => kind.child(),
        }
    }

    fn conflict(&mut self, detail: String) -> SourceError {
        self.state = SessionState::Poisoned;
        SourceError::ContextConflict {
            path: self.path.to_string(),
            detail,
        }
    }

    /// Move one level deeper. Anything but the next level poisons the session.
    pub async fn select(&mut self, kind: EntityKind, external_id: &str) -> Result<(), SourceError> {
        if self.is_poisoned() {
            return Err(SourceError::Poisoned);
        }
        if self.next_kind() != Some(kind) {
            return Err(self.conflict(format!("cannot select {kind} `{external_id}` here")));
        }
        match self.transport.select(&self.token, kind, external_id).await {
            Ok(()) => {
                self.path.push(kind, external_id)?;
                debug!(path = %self.path, "session context advanced");
                Ok(())
            }
            Err(SourceError::ContextConflict { detail, .. }) => Err(self.conflict(detail)),
            Err(err) => Err(err),
        }
    }

    /// List the children one level below the current context.
    pub async fn list_children(&mut self, kind: EntityKind) -> Result<Vec<RemoteEntity>, SourceError> {
        if self.is_poisoned() {
            return Err(SourceError::Poisoned);
        }
        if self.next_kind() != Some(kind) {
            return Err(self.conflict(format!("cannot list {kind} children here")));
        }
        match self.transport.list_children(&self.token, kind).await {
            Err(SourceError::ContextConflict { detail, .. }) => Err(self.conflict(detail)),
            other => other,
        }
    }

    /// End the session. Its context cannot be reused afterwards.
    pub async fn close(self) {
        self.transport.release(&self.token).await;
        debug!(path = %self.path, "session closed");
    }

    /// Download and decode the artifact. Requires a fully selected leaf.
    pub async fn fetch_artifact(&mut self) -> Result<Vec<u8>, SourceError> {
        if self.is_poisoned() {
            return Err(SourceError::Poisoned);
        }
        let leaf = match self.path.segments().last() {
            Some(seg) if seg.kind == EntityKind::Elevation => seg.external_id.clone(),
            _ => return Err(self.conflict("artifact requires a selected elevation".into())),
        };
        let encoded = match self.transport.get_artifact(&self.token, &leaf).await {
            Err(SourceError::ContextConflict { detail, .. }) => return Err(self.conflict(detail)),
            other => other?,
        };
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| SourceError::Payload(format!("artifact for `{leaf}` is not base64: {e}")))
    }
}

/// Hands out fresh sessions; never reuses one across contexts.
#[derive(Clone)]
pub struct SessionClient {
    transport: Arc<dyn SourceTransport>,
}

impl fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionClient").finish_non_exhaustive()
    }
}

impl SessionClient {
    pub fn new(transport: Arc<dyn SourceTransport>) -> Self {
        Self { transport }
    }

    pub async fn authenticate(&self) -> Result<Session, SourceError> {
        let token = self.transport.authenticate().await?;
        Ok(Session {
            transport: Arc::clone(&self.transport),
            token,
            path: ContextPath::root(),
            state: SessionState::Open,
        })
    }

    /// Authenticate and walk down to `path`.
    pub async fn open_at(&self, path: &ContextPath) -> Result<Session, SourceError> {
        let mut session = self.authenticate().await?;
        for segment in path.segments() {
            if let Err(err) = session.select(segment.kind, &segment.external_id).await {
                session.close().await;
                return Err(err);
            }
        }
        Ok(session)
    }
}
