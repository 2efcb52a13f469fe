//! Local command channel between a peer invocation and the primary.
//!
//! The primary listens on a Unix socket inside its runtime directory (a
//! loopback TCP port published in `channel.port` where Unix sockets are not
//! available). A peer writes one JSON request line carrying its raw
//! arguments and reads back one JSON [`Ack`] line. Requests are served one
//! at a time, in arrival order.

use hearth_schema::{CommandLine, ServiceIdentity};
use hearth_store::RuntimeLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

/// Version of the request/ack line format.
pub const CHANNEL_PROTOCOL_VERSION: u32 = 1;

const CHANNEL_TARGET: &str = "hearth::channel";
const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);
const READ_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_REQUEST_BYTES: u64 = 64 * 1024;
// sun_path is 104 bytes on macOS, 108 on Linux
#[cfg(unix)]
const MAX_SOCKET_PATH: usize = 100;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to bind command channel at {path}: {source}")]
    BindUnix {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to bind loopback command channel: {source}")]
    BindTcp {
        #[source]
        source: io::Error,
    },
    #[error("command channel path {path} exists and is not a socket")]
    NotSocket { path: String },
    #[error("failed to remove stale command channel {path}: {source}")]
    Cleanup {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to configure command channel: {source}")]
    NonBlocking {
        #[source]
        source: io::Error,
    },
    #[error("no command channel published in {0}")]
    NotListening(String),
    #[error("failed to connect to primary at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("command channel I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed command channel message: {0}")]
    Protocol(String),
    #[error("command channel listener thread panicked")]
    ThreadPanic,
}

/// Where the primary's command channel can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    #[cfg(unix)]
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Peer to primary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandRequest {
    pub protocol: u32,
    pub identity: String,
    pub args: CommandLine,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Accepted,
    Rejected,
}

/// Primary to peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub status: AckStatus,
    #[serde(default)]
    pub message: String,
}

impl Ack {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Accepted,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Rejected,
            message: message.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.status == AckStatus::Accepted
    }
}

/// Receives every command line forwarded by a peer.
pub trait CommandHandler: Send + Sync {
    /// `Ok` text is acknowledged as accepted, `Err` text as rejected.
    fn handle(&self, args: CommandLine) -> Result<String, String>;
}

/// Endpoint a peer should use for `identity`.
///
/// On Unix the socket lives in the runtime directory unless that path is
/// too long for `sun_path`, in which case a name derived from the identity
/// key in the temporary directory is used.
pub fn resolve_endpoint(
    layout: &RuntimeLayout,
    identity: &ServiceIdentity,
) -> Result<Endpoint, ChannelError> {
    #[cfg(unix)]
    {
        let path = layout.socket_path();
        if path.as_os_str().len() <= MAX_SOCKET_PATH {
            return Ok(Endpoint::Unix(path));
        }
        Ok(Endpoint::Unix(
            std::env::temp_dir().join(format!("hearth-{}.sock", identity.key())),
        ))
    }

    #[cfg(not(unix))]
    {
        let _ = identity;
        let port_file = layout.channel_port_file();
        let raw = fs::read_to_string(&port_file)
            .map_err(|_| ChannelError::NotListening(port_file.display().to_string()))?;
        let port: u16 = raw
            .trim()
            .parse()
            .map_err(|_| ChannelError::NotListening(port_file.display().to_string()))?;
        Ok(Endpoint::Tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port))))
    }
}

enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_timeouts(&self, timeout: Duration) -> io::Result<()> {
        match self {
            Self::Tcp(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
            #[cfg(unix)]
            Self::Unix(s) => {
                s.set_read_timeout(Some(timeout))?;
                s.set_write_timeout(Some(timeout))
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
        }
    }
}

/// An open connection to the primary's command channel.
pub struct HolderConnection {
    stream: Stream,
    endpoint: Endpoint,
}

impl HolderConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Connect to whoever holds the instance lock. Fails fast when nothing
/// listens at `endpoint` yet.
pub fn connect_to_holder(endpoint: &Endpoint, timeout: Duration) -> Result<HolderConnection, ChannelError> {
    let connect_err = |source| ChannelError::Connect {
        endpoint: endpoint.to_string(),
        source,
    };
    let stream = match endpoint {
        #[cfg(unix)]
        Endpoint::Unix(path) => Stream::Unix(UnixStream::connect(path).map_err(connect_err)?),
        Endpoint::Tcp(addr) => {
            Stream::Tcp(TcpStream::connect_timeout(addr, timeout).map_err(connect_err)?)
        }
    };
    stream.set_timeouts(timeout)?;
    Ok(HolderConnection {
        stream,
        endpoint: endpoint.clone(),
    })
}

/// Forward `args` to the primary and wait up to `timeout` for its acknowledgment.
pub fn send_command(
    endpoint: &Endpoint,
    identity: &ServiceIdentity,
    args: &CommandLine,
    timeout: Duration,
) -> Result<Ack, ChannelError> {
    let mut conn = connect_to_holder(endpoint, timeout)?;
    let request = CommandRequest {
        protocol: CHANNEL_PROTOCOL_VERSION,
        identity: identity.to_string(),
        args: args.clone(),
    };
    write_line(&mut conn.stream, &request)?;
    let line = read_line(&mut conn.stream)?;
    let ack: Ack = serde_json::from_str(&line).map_err(|e| ChannelError::Protocol(e.to_string()))?;
    debug!(target: CHANNEL_TARGET, endpoint = %conn.endpoint, status = ?ack.status, "command acknowledged");
    Ok(ack)
}

fn write_line<T: Serialize>(stream: &mut Stream, value: &T) -> Result<(), ChannelError> {
    let mut line = serde_json::to_vec(value).map_err(|e| ChannelError::Protocol(e.to_string()))?;
    line.push(b'\n');
    stream.write_all(&line)?;
    stream.flush()?;
    Ok(())
}

fn read_line(stream: &mut Stream) -> Result<String, ChannelError> {
    let mut reader = BufReader::new(stream.take(MAX_REQUEST_BYTES));
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ChannelError::Protocol("connection closed before a message".to_owned()));
    }
    Ok(line)
}

enum ListenerKind {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// The primary's side of the command channel.
pub struct CommandListener {
    endpoint: Endpoint,
    identity: ServiceIdentity,
    listener: ListenerKind,
    /// File removed when the listener exits: the socket or the port file.
    published: Option<PathBuf>,
    #[cfg(unix)]
    inode: Option<u64>,
}

impl CommandListener {
    /// Bind the channel for `identity`. Call only while holding the instance
    /// lock: a leftover socket at the endpoint is treated as stale and removed.
    pub fn bind(layout: &RuntimeLayout, identity: &ServiceIdentity) -> Result<Self, ChannelError> {
        #[cfg(unix)]
        {
            let Endpoint::Unix(path) = resolve_endpoint(layout, identity)? else {
                return Err(ChannelError::NotListening(layout.root().display().to_string()));
            };
            let listener = bind_unix(&path)?;
            let inode = fs::metadata(&path).ok().map(|m| m.ino());
            info!(target: CHANNEL_TARGET, path = %path.display(), "command channel bound");
            Ok(Self {
                endpoint: Endpoint::Unix(path.clone()),
                identity: identity.clone(),
                listener: ListenerKind::Unix(listener),
                published: Some(path),
                inode,
            })
        }

        #[cfg(not(unix))]
        {
            Self::bind_loopback(layout, identity)
        }
    }

    /// Bind a loopback TCP port and publish it in `channel.port`.
    pub fn bind_loopback(layout: &RuntimeLayout, identity: &ServiceIdentity) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|source| ChannelError::BindTcp { source })?;
        let addr = listener.local_addr()?;
        let port_file = layout.channel_port_file();
        fs::write(&port_file, format!("{}\n", addr.port()))?;
        info!(target: CHANNEL_TARGET, %addr, "command channel bound");
        Ok(Self {
            endpoint: Endpoint::Tcp(addr),
            identity: identity.clone(),
            listener: ListenerKind::Tcp(listener),
            published: Some(port_file),
            #[cfg(unix)]
            inode: None,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Serve requests on a background thread until the handle is shut down.
    pub fn start(self, handler: Arc<dyn CommandHandler>) -> Result<ListenerHandle, ChannelError> {
        let nonblocking = match &self.listener {
            ListenerKind::Tcp(l) => l.set_nonblocking(true),
            #[cfg(unix)]
            ListenerKind::Unix(l) => l.set_nonblocking(true),
        };
        if let Err(source) = nonblocking {
            self.cleanup();
            return Err(ChannelError::NonBlocking { source });
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("hearth-channel".to_owned())
            .spawn(move || self.run_accept_loop(&flag, handler.as_ref()))?;
        Ok(ListenerHandle {
            shutdown,
            handle: Some(handle),
        })
    }

    fn run_accept_loop(&self, shutdown: &AtomicBool, handler: &dyn CommandHandler) {
        info!(target: CHANNEL_TARGET, endpoint = %self.endpoint, "command channel active");
        let mut last_error = None::<io::ErrorKind>;
        while !shutdown.load(Ordering::SeqCst) {
            match self.accept() {
                Ok(Some(stream)) => {
                    last_error = None;
                    // Served inline: peer commands are handled strictly in arrival order
                    if let Err(e) = self.serve(stream, handler) {
                        warn!(target: CHANNEL_TARGET, error = %e, "command request failed");
                    }
                }
                Ok(None) => thread::sleep(ACCEPT_BACKOFF),
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(target: CHANNEL_TARGET, error = %error, "command channel accept error");
                    }
                    last_error = Some(kind);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        self.cleanup();
        debug!(target: CHANNEL_TARGET, "command channel closed");
    }

    fn accept(&self) -> io::Result<Option<Stream>> {
        let accepted = match &self.listener {
            ListenerKind::Tcp(l) => l.accept().map(|(s, _)| {
                s.set_nonblocking(false).map(|()| Stream::Tcp(s))
            }),
            #[cfg(unix)]
            ListenerKind::Unix(l) => l.accept().map(|(s, _)| {
                s.set_nonblocking(false).map(|()| Stream::Unix(s))
            }),
        };
        match accepted {
            Ok(stream) => stream.map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn serve(&self, mut stream: Stream, handler: &dyn CommandHandler) -> Result<(), ChannelError> {
        stream.set_timeouts(READ_TIMEOUT)?;
        let line = read_line(&mut stream)?;
        let ack = match serde_json::from_str::<CommandRequest>(&line) {
            Err(e) => Ack::rejected(format!("malformed request: {e}")),
            Ok(req) if req.protocol != CHANNEL_PROTOCOL_VERSION => Ack::rejected(format!(
                "unsupported protocol {}, expected {CHANNEL_PROTOCOL_VERSION}",
                req.protocol
            )),
            Ok(req) if req.identity != self.identity.to_string() => Ack::rejected(format!(
                "request for {} reached {}",
                req.identity, self.identity
            )),
            Ok(req) => {
                info!(target: CHANNEL_TARGET, args = %req.args, "command received from peer");
                match handler.handle(req.args) {
                    Ok(message) => Ack::accepted(message),
                    Err(message) => Ack::rejected(message),
                }
            }
        };
        write_line(&mut stream, &ack)
    }

    fn cleanup(&self) {
        let Some(path) = &self.published else {
            return;
        };
        // A newer primary may already have replaced the socket
        #[cfg(unix)]
        if let Some(inode) = self.inode {
            if fs::metadata(path).map(|m| m.ino()).ok() != Some(inode) {
                return;
            }
        }
        if let Err(error) = fs::remove_file(path) {
            if error.kind() != io::ErrorKind::NotFound {
                warn!(target: CHANNEL_TARGET, error = %error, path = %path.display(), "failed to remove command channel file");
            }
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: &std::path::Path) -> Result<UnixListener, ChannelError> {
    if let Ok(metadata) = fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(ChannelError::NotSocket {
                path: path.display().to_string(),
            });
        }
        fs::remove_file(path).map_err(|source| ChannelError::Cleanup {
            path: path.display().to_string(),
            source,
        })?;
        debug!(target: CHANNEL_TARGET, path = %path.display(), "removed stale command channel socket");
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    UnixListener::bind(path).map_err(|source| ChannelError::BindUnix {
        path: path.display().to_string(),
        source,
    })
}

/// Handle to the background listener thread.
pub struct ListenerHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn join(mut self) -> Result<(), ChannelError> {
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| ChannelError::ThreadPanic),
            None => Ok(()),
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Echo {
        seen: Mutex<Vec<String>>,
    }

    impl CommandHandler for Echo {
        fn handle(&self, args: CommandLine) -> Result<String, String> {
            let text = args.to_string();
            self.seen.lock().push(text.clone());
            if text == "fail" {
                return Err("refused".to_owned());
            }
            Ok(format!("got {text}"))
        }
    }

    fn setup() -> (tempfile::TempDir, RuntimeLayout, ServiceIdentity) {
        let dir = tempfile::tempdir().unwrap();
        let layout = RuntimeLayout::new(dir.path().join("rt"));
        layout.initialize().unwrap();
        let identity = ServiceIdentity::new("org.example", "heartbeat").unwrap();
        (dir, layout, identity)
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            seen: Mutex::new(Vec::new()),
        })
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn forwards_arguments_and_acks() {
        let (_dir, layout, identity) = setup();
        let handler = echo();
        let listener = CommandListener::bind(&layout, &identity).unwrap();
        let endpoint = listener.endpoint().clone();
        let handle = listener.start(Arc::clone(&handler) as Arc<dyn CommandHandler>).unwrap();

        let ack = send_command(&endpoint, &identity, &CommandLine::new(["status", "x"]), TIMEOUT).unwrap();
        assert!(ack.is_accepted());
        assert_eq!(ack.message, "got status x");

        let ack = send_command(&endpoint, &identity, &CommandLine::new(["fail"]), TIMEOUT).unwrap();
        assert_eq!(ack.status, AckStatus::Rejected);
        assert_eq!(ack.message, "refused");

        handle.shutdown();
        handle.join().unwrap();
        assert_eq!(*handler.seen.lock(), vec!["status x", "fail"]);
    }

    #[test]
    fn wrong_identity_is_rejected_without_dispatch() {
        let (_dir, layout, identity) = setup();
        let handler = echo();
        let listener = CommandListener::bind(&layout, &identity).unwrap();
        let endpoint = listener.endpoint().clone();
        let handle = listener.start(Arc::clone(&handler) as Arc<dyn CommandHandler>).unwrap();

        let stranger = ServiceIdentity::new("org.other", "heartbeat").unwrap();
        let ack = send_command(&endpoint, &stranger, &CommandLine::new(["stop"]), TIMEOUT).unwrap();
        assert_eq!(ack.status, AckStatus::Rejected);
        assert!(handler.seen.lock().is_empty());

        handle.shutdown();
        handle.join().unwrap();
    }

    #[test]
    fn connect_without_listener_fails() {
        let (_dir, layout, identity) = setup();
        let endpoint = resolve_endpoint(&layout, &identity).unwrap_or(Endpoint::Tcp(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 1)),
        ));
        assert!(matches!(
            connect_to_holder(&endpoint, Duration::from_millis(200)),
            Err(ChannelError::Connect { .. })
        ));
    }

    #[test]
    fn loopback_listener_publishes_port() {
        let (_dir, layout, identity) = setup();
        let handler = echo();
        let listener = CommandListener::bind_loopback(&layout, &identity).unwrap();
        let Endpoint::Tcp(addr) = listener.endpoint().clone() else {
            panic!("expected tcp endpoint");
        };
        let published = fs::read_to_string(layout.channel_port_file()).unwrap();
        assert_eq!(published.trim(), addr.port().to_string());

        let handle = listener.start(handler).unwrap();
        let ack = send_command(&Endpoint::Tcp(addr), &identity, &CommandLine::new(["ping"]), TIMEOUT).unwrap();
        assert!(ack.is_accepted());
        handle.shutdown();
        handle.join().unwrap();
        assert!(!layout.channel_port_file().exists());
    }

    #[cfg(unix)]
    #[test]
    fn stale_socket_is_replaced() {
        let (_dir, layout, identity) = setup();
        let Endpoint::Unix(path) = resolve_endpoint(&layout, &identity).unwrap() else {
            panic!("expected unix endpoint");
        };
        {
            let _stale = UnixListener::bind(&path).unwrap();
        }
        assert!(path.exists());

        let listener = CommandListener::bind(&layout, &identity).unwrap();
        let handle = listener.start(echo()).unwrap();
        let ack = send_command(&Endpoint::Unix(path.clone()), &identity, &CommandLine::new(["ping"]), TIMEOUT).unwrap();
        assert!(ack.is_accepted());
        handle.shutdown();
        handle.join().unwrap();
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn regular_file_at_socket_path_is_an_error() {
        let (_dir, layout, identity) = setup();
        let Endpoint::Unix(path) = resolve_endpoint(&layout, &identity).unwrap() else {
            panic!("expected unix endpoint");
        };
        fs::write(&path, b"not a socket").unwrap();
        assert!(matches!(
            CommandListener::bind(&layout, &identity),
            Err(ChannelError::NotSocket { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn long_runtime_dir_falls_back_to_temp_dir() {
        let layout = RuntimeLayout::new(PathBuf::from("/").join("x".repeat(120)));
        let identity = ServiceIdentity::new("org.example", "heartbeat").unwrap();
        let Endpoint::Unix(path) = resolve_endpoint(&layout, &identity).unwrap() else {
            panic!("expected unix endpoint");
        };
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(path.to_string_lossy().contains(&identity.key()));
    }

    #[test]
    fn ack_wire_format() {
        let json = serde_json::to_string(&Ack::accepted("ok")).unwrap();
        assert_eq!(json, r#"{"status":"accepted","message":"ok"}"#);
        let req = CommandRequest {
            protocol: 1,
            identity: "a/b".to_owned(),
            args: CommandLine::new(["stop"]),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"protocol":1,"identity":"a/b","args":["stop"]}"#);
    }
}
