use crate::{FeedConfig, Release, RemoteError, UpdateSource, PROTOCOL_HEADER, PROTOCOL_VERSION};
use hearth_schema::ServiceIdentity;
use std::io::Read;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP update feed client.
///
/// Expects the feed API served by `hearth-server`:
/// - `GET  /releases/<namespace>/<artifact>` returns a JSON array of releases
/// - `GET  /artifacts/<digest>` returns the artifact bytes
/// - `PUT` on the same paths publishes (artifact bytes, or a single release)
pub struct HttpSource {
    config: FeedConfig,
    agent: ureq::Agent,
}

impl HttpSource {
    pub fn new(config: FeedConfig) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .build()
            .into();
        Self { config, agent }
    }

    /// Route every request through the proxy at `proxy_url`
    /// (`http://[user:pass@]host:port`).
    pub fn with_proxy(config: FeedConfig, proxy_url: &str) -> Result<Self, RemoteError> {
        let proxy = ureq::Proxy::new(proxy_url)
            .map_err(|e| RemoteError::Config(format!("invalid proxy: {e}")))?;
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .proxy(Some(proxy))
            .build()
            .into();
        Ok(Self { config, agent })
    }

    pub fn config(&self) -> &FeedConfig {
        &self.config
    }

    fn releases_url(&self, identity: &ServiceIdentity) -> String {
        format!(
            "{}/releases/{}/{}",
            self.config.url,
            identity.namespace(),
            identity.artifact()
        )
    }

    fn artifact_url(&self, digest: &str) -> String {
        format!("{}/artifacts/{digest}", self.config.url)
    }

    /// Upload an artifact and register its release.
    pub fn publish(
        &self,
        identity: &ServiceIdentity,
        release: &Release,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        release.verify(data)?;
        let url = self.artifact_url(release.digest.as_str());
        tracing::debug!("PUT {url} ({} bytes)", data.len());
        self.do_put(&url, "application/octet-stream", data)?;

        let url = self.releases_url(identity);
        let body =
            serde_json::to_vec(release).map_err(|e| RemoteError::Serialization(e.to_string()))?;
        tracing::debug!("PUT {url}");
        self.do_put(&url, "application/json", &body)
    }

    fn do_put(&self, url: &str, content_type: &str, data: &[u8]) -> Result<(), RemoteError> {
        let mut req = self
            .agent
            .put(url)
            .header("Content-Type", content_type)
            .header(PROTOCOL_HEADER, &PROTOCOL_VERSION.to_string());
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        req.send(data)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(())
    }

    fn do_get(&self, url: &str) -> Result<Vec<u8>, RemoteError> {
        let mut req = self
            .agent
            .get(url)
            .header(PROTOCOL_HEADER, &PROTOCOL_VERSION.to_string());
        if let Some(ref token) = self.config.auth_token {
            req = req.header("Authorization", &format!("Bearer {token}"));
        }
        let resp = match req.call() {
            Ok(r) => r,
            Err(ureq::Error::StatusCode(404)) => {
                return Err(RemoteError::NotFound(url.to_owned()));
            }
            Err(ureq::Error::StatusCode(code)) => {
                return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
            }
            Err(e) => {
                return Err(RemoteError::Http(e.to_string()));
            }
        };

        let code = resp.status().as_u16();
        if code == 404 {
            return Err(RemoteError::NotFound(url.to_owned()));
        }
        if code >= 400 {
            return Err(RemoteError::Http(format!("HTTP {code} for {url}")));
        }

        let mut reader = resp.into_body().into_reader();
        let mut body = Vec::new();
        reader
            .read_to_end(&mut body)
            .map_err(|e| RemoteError::Http(e.to_string()))?;
        Ok(body)
    }
}

impl UpdateSource for HttpSource {
    fn list_releases(&self, identity: &ServiceIdentity) -> Result<Vec<Release>, RemoteError> {
        let url = self.releases_url(identity);
        tracing::debug!("GET {url}");
        let body = match self.do_get(&url) {
            Ok(body) => body,
            // A feed that never heard of this identity has no releases for it
            Err(RemoteError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        serde_json::from_slice(&body).map_err(|e| RemoteError::Serialization(e.to_string()))
    }

    fn fetch_artifact(&self, release: &Release) -> Result<Vec<u8>, RemoteError> {
        let url = self.artifact_url(release.digest.as_str());
        tracing::debug!("GET {url}");
        self.do_get(&url)
    }
}
