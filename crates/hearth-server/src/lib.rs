//! Reference HTTP update feed for hearth.
//!
//! Serves the feed protocol consumed by `hearth_remote::HttpSource`:
//!
//! ```text
//! GET  /releases/<namespace>/<artifact>   JSON array of releases (empty if none)
//! PUT  /releases/<namespace>/<artifact>   add or replace one release (JSON body)
//! GET  /artifacts/<digest>                artifact bytes
//! HEAD /artifacts/<digest>                200 or 404
//! PUT  /artifacts/<digest>                upload bytes; must hash to <digest>
//! GET  /health
//! ```
//!
//! Data lives in the [`DirectorySource`] layout, so a server data directory
//! doubles as a directory feed. The [`TestServer`] helper starts a server on
//! a random port for integration testing.

use hearth_remote::{DirectorySource, Release, RemoteError, UpdateSource};
use hearth_schema::{ArtifactDigest, ServiceIdentity};
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tiny_http::{Header, Method, Response, Server, StatusCode};
use tracing::{debug, error, info, warn};

/// File-backed release and artifact store.
pub struct FeedStore {
    feed: DirectorySource,
    /// Serializes read-modify-write of release listings.
    writes: Mutex<()>,
}

impl FeedStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            feed: DirectorySource::new(data_dir),
            writes: Mutex::new(()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        self.feed.root()
    }

    pub fn releases(&self, identity: &ServiceIdentity) -> Result<Vec<Release>, RemoteError> {
        self.feed.list_releases(identity)
    }

    /// Register `release`. Its artifact must already be uploaded and match.
    pub fn put_release(&self, identity: &ServiceIdentity, release: Release) -> Result<(), RemoteError> {
        let data = self.feed.fetch_artifact(&release)?;
        release.verify(&data)?;
        let _guard = self.writes.lock();
        self.feed.add_release(identity, release)
    }

    pub fn get_artifact(&self, digest: &str) -> Option<Vec<u8>> {
        fs::read(self.feed.artifact_path(digest)).ok()
    }

    pub fn has_artifact(&self, digest: &str) -> bool {
        self.feed.artifact_path(digest).exists()
    }

    /// Store `data` under `digest` after checking it hashes to it.
    pub fn put_artifact(&self, digest: &str, data: &[u8]) -> Result<(), RemoteError> {
        let actual = ArtifactDigest::of(data);
        if actual.as_str() != digest {
            return Err(RemoteError::IntegrityFailure {
                key: digest.to_owned(),
                expected: digest.to_owned(),
                actual: actual.into_inner(),
            });
        }
        let dest = self.feed.artifact_path(digest);
        let dir = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&dest).map_err(|e| RemoteError::Io(e.error))?;
        Ok(())
    }
}

/// A parsed request path.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    Releases { namespace: &'a str, artifact: &'a str },
    Artifact(&'a str),
    Health,
}

pub fn parse_route(path: &str) -> Option<Route<'_>> {
    let path = path.split('?').next().unwrap_or(path);
    if path == "/health" {
        return Some(Route::Health);
    }
    if let Some(rest) = path.strip_prefix("/releases/") {
        let (namespace, artifact) = rest.split_once('/')?;
        if namespace.is_empty() || artifact.is_empty() || artifact.contains('/') {
            return None;
        }
        return Some(Route::Releases { namespace, artifact });
    }
    if let Some(digest) = path.strip_prefix("/artifacts/") {
        if ArtifactDigest::new(digest).is_well_formed() {
            return Some(Route::Artifact(digest));
        }
    }
    None
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn respond_typed(req: tiny_http::Request, data: Vec<u8>, content_type: &str) {
    let mut response = Response::from_data(data);
    if let Ok(header) = Header::from_bytes("Content-Type", content_type) {
        response.add_header(header);
    }
    let _ = req.respond(response);
}

fn read_body(req: &mut tiny_http::Request) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    if req.as_reader().read_to_end(&mut body).is_ok() {
        Some(body)
    } else {
        None
    }
}

fn status_for(e: &RemoteError) -> u16 {
    match e {
        RemoteError::NotFound(_) => 409,
        RemoteError::IntegrityFailure { .. } | RemoteError::Serialization(_) => 422,
        _ => 500,
    }
}

fn handle_releases(store: &FeedStore, mut req: tiny_http::Request, method: &Method, identity: &ServiceIdentity) {
    match *method {
        Method::Get => match store.releases(identity) {
            Ok(listing) => match serde_json::to_vec(&listing) {
                Ok(json) => respond_typed(req, json, "application/json"),
                Err(e) => respond_err(req, 500, &e.to_string()),
            },
            Err(e) => {
                error!("GET releases of {identity}: {e}");
                respond_err(req, 500, &e.to_string());
            }
        },
        Method::Put => {
            let Some(body) = read_body(&mut req) else {
                respond_err(req, 500, "read error");
                return;
            };
            let release: Release = match serde_json::from_slice(&body) {
                Ok(release) => release,
                Err(e) => {
                    respond_err(req, 400, &format!("invalid release: {e}"));
                    return;
                }
            };
            let version = release.version.clone();
            match store.put_release(identity, release) {
                Ok(()) => {
                    info!("PUT release {identity} {version}");
                    let _ = req.respond(Response::from_string("ok"));
                }
                Err(e) => {
                    warn!("PUT release {identity} {version}: {e}");
                    respond_err(req, status_for(&e), &e.to_string());
                }
            }
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

fn handle_artifact(store: &FeedStore, mut req: tiny_http::Request, method: &Method, digest: &str) {
    match *method {
        Method::Get => match store.get_artifact(digest) {
            Some(data) => respond_typed(req, data, "application/octet-stream"),
            None => respond_err(req, 404, "not found"),
        },
        Method::Head => {
            let code = if store.has_artifact(digest) { 200 } else { 404 };
            let _ = req.respond(Response::empty(code));
        }
        Method::Put => {
            let Some(body) = read_body(&mut req) else {
                respond_err(req, 500, "read error");
                return;
            };
            match store.put_artifact(digest, &body) {
                Ok(()) => {
                    info!("PUT artifact {digest}: {} bytes", body.len());
                    let _ = req.respond(Response::from_string("ok"));
                }
                Err(e) => {
                    warn!("PUT artifact {digest}: {e}");
                    respond_err(req, status_for(&e), &e.to_string());
                }
            }
        }
        _ => respond_err(req, 405, "method not allowed"),
    }
}

/// Handle a single HTTP request, dispatching to the appropriate route handler.
pub fn handle_request(store: &FeedStore, req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    debug!("{method} {url}");

    match parse_route(&url) {
        Some(Route::Health) if method == Method::Get => {
            let _ = req.respond(Response::from_string(r#"{"status":"ok"}"#));
        }
        Some(Route::Releases { namespace, artifact }) => match ServiceIdentity::new(namespace, artifact) {
            Ok(identity) => handle_releases(store, req, &method, &identity),
            Err(e) => respond_err(req, 400, &e.to_string()),
        },
        Some(Route::Artifact(digest)) => handle_artifact(store, req, &method, digest),
        Some(Route::Health) => respond_err(req, 405, "method not allowed"),
        None => respond_err(req, 404, "not found"),
    }
}

/// Bind `addr` and serve requests, blocking the current thread.
pub fn run_server(store: &Arc<FeedStore>, addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let server = Server::http(addr)?;
    info!("listening on {addr}");
    for request in server.incoming_requests() {
        handle_request(store, request);
    }
    Ok(())
}

/// A test helper that starts a feed server on a random port in a background thread.
///
/// Drop the `TestServer` to stop the server (via `Server::unblock`).
pub struct TestServer {
    pub url: String,
    pub port: u16,
    pub data_dir: PathBuf,
    server: Arc<Server>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    /// Start a test server on `127.0.0.1:0` storing data in `data_dir`.
    pub fn start(data_dir: PathBuf) -> Self {
        fs::create_dir_all(&data_dir).expect("failed to create test data dir");
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let store = Arc::new(FeedStore::new(data_dir.clone()));
        let srv = Arc::clone(&server);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                handle_request(&store, request);
            }
        });

        Self {
            url,
            port,
            data_dir,
            server,
            handle: Some(handle),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
