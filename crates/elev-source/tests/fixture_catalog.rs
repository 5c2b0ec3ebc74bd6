use std::path::Path;
use std::sync::Arc;

use elev_core::{Classify, ContextPath, EntityKind, ErrorClass};
use elev_source::fixture::MAX_OPEN_SESSIONS;
use elev_source::{FixtureTransport, SessionClient, SourceError};

fn catalog_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/catalog.json")
}

fn client() -> (Arc<FixtureTransport>, SessionClient) {
    let transport = Arc::new(FixtureTransport::load(catalog_path()).expect("fixture catalog"));
    (transport.clone(), SessionClient::new(transport))
}

#[tokio::test]
async fn walks_the_catalog_top_down() {
    let (_transport, client) = client();
    let mut session = client.authenticate().await.unwrap();

    let dirs = session.list_children(EntityKind::Directory).await.unwrap();
    assert_eq!(
        dirs.iter().map(|d| d.external_id.as_str()).collect::<Vec<_>>(),
        ["D1", "D2"]
    );
    session.select(EntityKind::Directory, "D1").await.unwrap();
    let projects = session.list_children(EntityKind::Project).await.unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(projects[0].attributes["city"], "Rotterdam");
    session.select(EntityKind::Project, "P1").await.unwrap();
    session.select(EntityKind::Phase, "0").await.unwrap();
    let elevations = session.list_children(EntityKind::Elevation).await.unwrap();
    assert_eq!(elevations.len(), 2);
    session.select(EntityKind::Elevation, "E1").await.unwrap();

    let bytes = session.fetch_artifact().await.unwrap();
    assert!(bytes.starts_with(b"SQLite format 3\0"));
}

#[tokio::test]
async fn sentinel_phase_ids_resolve_per_parent() {
    let (_transport, client) = client();
    let annex = ContextPath::root()
        .with(EntityKind::Directory, "D1")
        .unwrap()
        .with(EntityKind::Project, "P2")
        .unwrap()
        .with(EntityKind::Phase, "0")
        .unwrap();
    let mut session = client.open_at(&annex).await.unwrap();
    let elevations = session.list_children(EntityKind::Elevation).await.unwrap();
    assert_eq!(elevations.len(), 1);
    assert_eq!(elevations[0].name, "Side door");
}

#[tokio::test]
async fn going_back_up_needs_a_new_session() {
    let (transport, client) = client();
    let mut session = client.authenticate().await.unwrap();
    session.select(EntityKind::Directory, "D1").await.unwrap();
    session.select(EntityKind::Project, "P1").await.unwrap();

    let err = session.select(EntityKind::Project, "P2").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::ContextConflict);
    assert!(matches!(
        session.list_children(EntityKind::Phase).await,
        Err(SourceError::Poisoned)
    ));

    let mut fresh = client.authenticate().await.unwrap();
    fresh.select(EntityKind::Directory, "D1").await.unwrap();
    fresh.select(EntityKind::Project, "P2").await.unwrap();
    assert_eq!(transport.auth_count(), 2);
}

#[tokio::test]
async fn unknown_ids_are_not_found_and_injected_failures_are_transient() {
    let (transport, client) = client();
    let mut session = client.authenticate().await.unwrap();
    let err = session.select(EntityKind::Directory, "nope").await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Validation);
    assert!(!session.is_poisoned());

    transport.inject_transient_failures(1);
    let err = session.list_children(EntityKind::Directory).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Transient);
    assert!(session.list_children(EntityKind::Directory).await.is_ok());
}

#[tokio::test]
async fn closed_sessions_are_forgotten() {
    let (transport, client) = client();
    let session = client
        .open_at(&ContextPath::root().with(EntityKind::Directory, "D1").unwrap())
        .await
        .unwrap();
    assert_eq!(transport.open_sessions(), 1);
    session.close().await;
    assert_eq!(transport.open_sessions(), 0);

    // A failed walk does not leave its session behind either.
    let missing = ContextPath::root().with(EntityKind::Directory, "nope").unwrap();
    assert!(client.open_at(&missing).await.is_err());
    assert_eq!(transport.open_sessions(), 0);
}

#[tokio::test]
async fn abandoned_sessions_are_capped() {
    let (transport, client) = client();
    let mut first = client.authenticate().await.unwrap();
    for _ in 0..MAX_OPEN_SESSIONS + 10 {
        drop(client.authenticate().await.unwrap());
    }
    assert_eq!(transport.open_sessions(), MAX_OPEN_SESSIONS);
    assert!(matches!(
        first.select(EntityKind::Directory, "D1").await,
        Err(SourceError::Unauthorized)
    ));
}

#[tokio::test]
async fn injected_conflicts_poison_the_session() {
    let (transport, client) = client();
    let mut session = client.authenticate().await.unwrap();
    transport.inject_context_conflicts(1);
    let err = session.list_children(EntityKind::Directory).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::ContextConflict);
    assert!(session.is_poisoned());
}
