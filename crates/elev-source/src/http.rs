use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use elev_core::{EntityKind, ErrorClass, RemoteEntity};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};

use crate::{SessionToken, SourceError, SourceTransport};

pub fn class_for_status(status: u16) -> ErrorClass {
    match StatusCode::from_u16(status) {
        Ok(StatusCode::CONFLICT) => ErrorClass::ContextConflict,
        Ok(StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT) => ErrorClass::Transient,
        Ok(s) if s.is_server_error() => ErrorClass::Transient,
        _ => ErrorClass::Validation,
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// `(burst, refill_every)`; `None` disables client-side rate limiting.
    pub rate_limit: Option<(u32, Duration)>,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: String::new(),
            password: String::new(),
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("elev-sync/{}", env!("CARGO_PKG_VERSION"))),
            rate_limit: Some((10, Duration::from_millis(100))),
        }
    }
}

/// Client-side request budget: a burst of `capacity` requests, then one more
/// each `refill_every`. Waiters queue on the lock in arrival order.
#[derive(Debug)]
pub struct RequestBudget {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<BudgetState>,
}

#[derive(Debug)]
struct BudgetState {
    available: u32,
    next_refill: Instant,
}

impl RequestBudget {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(BudgetState {
                available: capacity,
                next_refill: Instant::now() + refill_every,
            }),
        }
    }

    /// Wait until one more request may go out.
    pub async fn acquire(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if now >= state.next_refill {
            let behind = (now - state.next_refill).as_nanos() / self.refill_every.as_nanos();
            let periods = u32::try_from(behind + 1).unwrap_or(u32::MAX);
            if periods >= self.capacity {
                state.available = self.capacity;
                state.next_refill = now + self.refill_every;
            } else {
                state.available = (state.available + periods).min(self.capacity);
                state.next_refill += self.refill_every * periods;
            }
        }
        if state.available > 0 {
            state.available -= 1;
            return;
        }
        tokio::time::sleep_until(state.next_refill).await;
        state.next_refill += self.refill_every;
    }
}

#[derive(Debug, Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
}

#[derive(Debug, Serialize)]
struct SelectBody<'a> {
    level: &'a str,
    id: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChildBody {
    id: String,
    name: String,
    #[serde(default)]
    modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attributes: BTreeMap<String, serde_json::Value>,
}

impl From<ChildBody> for RemoteEntity {
    fn from(body: ChildBody) -> Self {
        let attributes = body
            .attributes
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| match v {
                serde_json::Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect();
        RemoteEntity {
            external_id: body.id,
            name: body.name,
            source_modified_at: body.modified_at,
            attributes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArtifactBody {
    data: String,
}

/// JSON-over-HTTP client for the upstream API.
///
/// Endpoints, relative to `base_url`:
/// `POST session`, `POST session/select`, `GET session/children?level=`,
/// `GET session/elevations/{id}/artifact`.
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
    base: Url,
    budget: Option<RequestBudget>,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing upstream url {}", config.base_url))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("upstream url {} cannot carry a path", config.base_url);
        }
        let budget = config
            .rate_limit
            .map(|(burst, refill_every)| RequestBudget::new(burst, refill_every));
        Ok(Self {
            client,
            config,
            base,
            budget,
        })
    }

    /// `base_url` plus `segments`, each percent-encoded as a single path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, SourceError> {
        if let Some(budget) = &self.budget {
            budget.acquire().await;
        }
        let resp = request.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let url = resp.url().to_string();
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(SourceError::Unauthorized),
            StatusCode::CONFLICT => Err(SourceError::ContextConflict {
                path: url,
                detail: resp.text().await.unwrap_or_default(),
            }),
            _ => Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            }),
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, SourceError> {
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| SourceError::Payload(e.to_string()))
    }
}

#[async_trait]
impl SourceTransport for HttpTransport {
    async fn authenticate(&self) -> Result<SessionToken, SourceError> {
        let request = self.client.post(self.url(&["session"])).json(&Credentials {
            username: &self.config.username,
            password: &self.config.password,
        });
        let body: TokenBody = Self::json(self.send(request).await?).await?;
        debug!("upstream session opened");
        Ok(SessionToken(body.token))
    }

    async fn select(
        &self,
        token: &SessionToken,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<(), SourceError> {
        let request = self
            .client
            .post(self.url(&["session", "select"]))
            .bearer_auth(&token.0)
            .json(&SelectBody {
                level: kind.as_str(),
                id: external_id,
            });
        self.send(request)
            .instrument(info_span!("source_select", level = kind.as_str(), external_id))
            .await?;
        Ok(())
    }

    async fn list_children(
        &self,
        token: &SessionToken,
        kind: EntityKind,
    ) -> Result<Vec<RemoteEntity>, SourceError> {
        let request = self
            .client
            .get(self.url(&["session", "children"]))
            .bearer_auth(&token.0)
            .query(&[("level", kind.as_str())]);
        let resp = self
            .send(request)
            .instrument(info_span!("source_list", level = kind.as_str()))
            .await?;
        let children: Vec<ChildBody> = Self::json(resp).await?;
        Ok(children.into_iter().map(RemoteEntity::from).collect())
    }

    async fn get_artifact(
        &self,
        token: &SessionToken,
        elevation_external_id: &str,
    ) -> Result<String, SourceError> {
        let request = self
            .client
            .get(self.url(&["session", "elevations", elevation_external_id, "artifact"]))
            .bearer_auth(&token.0);
        let resp = self
            .send(request)
            .instrument(info_span!("source_artifact", elevation_external_id))
            .await?;
        let body: ArtifactBody = Self::json(resp).await?;
        Ok(body.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SessionClient;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use elev_core::Classify;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/api")
    }

    fn upstream() -> Router {
        Router::new()
            .route(
                "/api/session",
                post(|| async { Json(serde_json::json!({ "token": "abc" })) }),
            )
            .route(
                "/api/session/select",
                post(|Json(body): Json<serde_json::Value>| async move {
                    if body["level"] == "directory" {
                        AxumStatus::NO_CONTENT
                    } else {
                        AxumStatus::CONFLICT
                    }
                }),
            )
            .route(
                "/api/session/children",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("level").map(String::as_str) == Some("project") {
                        Json(serde_json::json!([
                            { "id": "P1", "name": "Tower", "modified_at": "2026-01-01T00:00:00Z",
                              "attributes": { "floors": 12, "site": "North" } }
                        ]))
                    } else {
                        Json(serde_json::json!([]))
                    }
                }),
            )
            .route(
                "/api/session/elevations/{id}/artifact",
                get(|Path(id): Path<String>| async move { Json(serde_json::json!({ "data": id })) }),
            )
    }

    #[test]
    fn status_classes_follow_the_retry_taxonomy() {
        assert_eq!(class_for_status(409), ErrorClass::ContextConflict);
        assert_eq!(class_for_status(503), ErrorClass::Transient);
        assert_eq!(class_for_status(429), ErrorClass::Transient);
        assert_eq!(class_for_status(404), ErrorClass::Validation);
    }

    #[tokio::test]
    async fn http_transport_lists_children_and_maps_conflicts() {
        let base = serve(upstream()).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(base)).unwrap();
        let client = SessionClient::new(Arc::new(transport));

        let mut session = client.authenticate().await.unwrap();
        session.select(EntityKind::Directory, "D1").await.unwrap();
        let children = session.list_children(EntityKind::Project).await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].external_id, "P1");
        assert_eq!(children[0].attributes["floors"], "12");
        assert_eq!(children[0].attributes["site"], "North");

        let err = session.select(EntityKind::Project, "P1").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ContextConflict);
        assert!(session.is_poisoned());
    }

    #[tokio::test]
    async fn elevation_ids_stay_one_path_segment() {
        let base = serve(upstream()).await;
        let transport = HttpTransport::new(HttpTransportConfig::new(format!("{base}/"))).unwrap();
        assert_eq!(
            transport.url(&["session", "elevations", "E/1?x#y", "artifact"]).path(),
            "/api/session/elevations/E%2F1%3Fx%23y/artifact"
        );
        let echoed = transport
            .get_artifact(&SessionToken("abc".into()), "E/1?x#y")
            .await
            .unwrap();
        assert_eq!(echoed, "E/1?x#y");
    }

    #[tokio::test]
    async fn request_budget_spaces_requests_after_the_burst() {
        let started = Instant::now();
        let budget = RequestBudget::new(2, Duration::from_millis(40));
        budget.acquire().await;
        budget.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(40));
        budget.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn base_urls_must_carry_a_path() {
        assert!(HttpTransport::new(HttpTransportConfig::new("mailto:ops@example.com")).is_err());
        assert!(HttpTransport::new(HttpTransportConfig::new("not a url")).is_err());
    }
}
