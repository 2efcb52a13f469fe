//! Real feed server against the real HTTP source. No mocks.

use hearth_core::{UpdateState, Updater};
use hearth_remote::{FeedConfig, HttpSource, Release, RemoteError, UpdateSource};
use hearth_schema::{ArtifactDigest, ProductCard, ServiceIdentity, Version};
use hearth_server::TestServer;
use hearth_store::RuntimeLayout;
use std::fs;
use std::sync::Arc;

fn start_server() -> (TestServer, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let server = TestServer::start(dir.path().to_path_buf());
    (server, dir)
}

fn make_client(url: &str) -> HttpSource {
    HttpSource::new(FeedConfig::new(url))
}

fn identity() -> ServiceIdentity {
    ServiceIdentity::new("org.example", "heartbeat").unwrap()
}

#[test]
fn health_endpoint() {
    let (server, _dir) = start_server();
    let body = ureq::get(&format!("{}/health", server.url))
        .call()
        .unwrap()
        .into_body()
        .read_to_string()
        .unwrap();
    assert!(body.contains("ok"));
}

#[test]
fn unknown_identity_has_no_releases() {
    let (server, _dir) = start_server();
    let client = make_client(&server.url);
    assert!(client.list_releases(&identity()).unwrap().is_empty());
}

#[test]
fn publish_list_and_fetch() {
    let (server, _dir) = start_server();
    let client = make_client(&server.url);

    let v1 = Release::for_artifact(Version::new(1, 0, 0), b"heartbeat 1.0.0");
    let mut v2 = Release::for_artifact(Version::new(1, 1, 0), b"heartbeat 1.1.0");
    v2.released = Some("2026-01-01T00:00:00Z".to_owned());
    client.publish(&identity(), &v2, b"heartbeat 1.1.0").unwrap();
    client.publish(&identity(), &v1, b"heartbeat 1.0.0").unwrap();

    let listing = client.list_releases(&identity()).unwrap();
    assert_eq!(listing, vec![v1, v2.clone()]);
    assert_eq!(client.fetch_artifact(&v2).unwrap(), b"heartbeat 1.1.0");

    // Server data directory is laid out as a directory feed
    assert!(server
        .data_dir
        .join("releases/org.example/heartbeat.json")
        .exists());
    assert!(server.data_dir.join("artifacts").join(v2.digest.as_str()).exists());
}

#[test]
fn missing_artifact_is_not_found() {
    let (server, _dir) = start_server();
    let client = make_client(&server.url);
    let release = Release::for_artifact(Version::new(3, 0, 0), b"never uploaded");
    assert!(matches!(
        client.fetch_artifact(&release),
        Err(RemoteError::NotFound(_))
    ));
}

#[test]
fn server_rejects_bytes_under_wrong_digest() {
    let (server, _dir) = start_server();
    let digest = ArtifactDigest::of(b"the real thing");
    let result = ureq::put(&format!("{}/artifacts/{digest}", server.url)).send(&b"an impostor"[..]);
    assert!(matches!(result, Err(ureq::Error::StatusCode(422))));

    let release = Release::for_artifact(Version::new(1, 0, 0), b"the real thing");
    let body = serde_json::to_vec(&release).unwrap();
    let result = ureq::put(&format!("{}/releases/org.example/heartbeat", server.url))
        .header("Content-Type", "application/json")
        .send(&body[..]);
    assert!(matches!(result, Err(ureq::Error::StatusCode(409))));
}

#[test]
fn invalid_identity_is_bad_request() {
    let (server, _dir) = start_server();
    let result = ureq::get(&format!("{}/releases/org.ex!ample/heartbeat", server.url)).call();
    assert!(matches!(result, Err(ureq::Error::StatusCode(400))));
}

#[test]
fn updater_stages_release_from_http_feed() {
    let (server, dir) = start_server();
    let publisher = make_client(&server.url);
    let data = b"heartbeat 1.2.0";
    let release = Release::for_artifact(Version::new(1, 2, 0), data);
    publisher.publish(&identity(), &release, data).unwrap();

    let layout = RuntimeLayout::for_identity(dir.path().join("state"), &identity());
    layout.initialize().unwrap();
    let target = dir.path().join("bin/heartbeat");
    fs::create_dir_all(target.parent().unwrap()).unwrap();
    fs::write(&target, b"heartbeat 1.0.0").unwrap();

    let source: Arc<dyn UpdateSource> = Arc::new(make_client(&server.url));
    let updater = Updater::new(
        ProductCard::new(identity(), "Heartbeat", Version::new(1, 0, 0)),
        layout,
        Some(source),
        target.clone(),
    );
    let record = updater.check().unwrap().unwrap();
    assert_eq!(record.card.version, Version::new(1, 2, 0));
    assert!(matches!(updater.state(), UpdateState::Staged(_)));

    assert_eq!(updater.apply_pending().unwrap(), Some(Version::new(1, 2, 0)));
    assert_eq!(fs::read(&target).unwrap(), data);
}
