use crate::settings::SettingsStore;
use std::fmt;
use tracing::warn;

pub const PROXY_HOST_KEY: &str = "proxy/host";
pub const PROXY_PORT_KEY: &str = "proxy/port";
pub const PROXY_USERNAME_KEY: &str = "proxy/username";
pub const PROXY_PASSWORD_KEY: &str = "proxy/password";

const DEFAULT_PROXY_PORT: u16 = 8080;

/// Username and password for an authenticating proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    /// Credentials stored under `proxy/`. Returns `None` unless both the
    /// username and the password are present and non-empty.
    pub fn lookup(settings: &SettingsStore) -> Option<Self> {
        let node = settings.node("proxy");
        let username = node.get("username").filter(|u| !u.is_empty())?;
        let password = node.get("password").filter(|p| !p.is_empty())?;
        Some(Self {
            username: username.to_owned(),
            password: password.to_owned(),
        })
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Proxy endpoint configured in the settings store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub host: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl ProxySettings {
    pub fn lookup(settings: &SettingsStore) -> Option<Self> {
        let host = settings.get(PROXY_HOST_KEY).filter(|h| !h.is_empty())?;
        let port = match settings.get(PROXY_PORT_KEY) {
            None => DEFAULT_PROXY_PORT,
            Some(raw) => match raw.parse::<u16>() {
                Ok(port) => port,
                Err(_) => {
                    warn!("invalid proxy port {raw:?}, using {DEFAULT_PROXY_PORT}");
                    DEFAULT_PROXY_PORT
                }
            },
        };
        Some(Self {
            host: host.to_owned(),
            port,
            credentials: ProxyCredentials::lookup(settings),
        })
    }

    /// `http://[user:pass@]host:port`, with credentials percent-encoded.
    pub fn url(&self) -> String {
        match &self.credentials {
            Some(creds) => format!(
                "http://{}:{}@{}:{}",
                encode_userinfo(&creds.username),
                encode_userinfo(&creds.password),
                self.host,
                self.port
            ),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

fn encode_userinfo(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}
