//! `git://` daemon.
//!
//! Each connection opens with a request line naming a service and a
//! repository:
//!
//! ```text
//! 0033git-receive-pack /team/site.git\0host=example.org\0
//! ```
//!
//! Only `git-receive-pack` is served. Repositories live in a shared
//! [`RepoStore`] and are created on first push.

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use weir_git::{PktLineReader, PktLineWriter, ReceiveConfig, ReceivePack};
use weir_storage::RepoStore;

/// Service name of the push side of the protocol.
pub const RECEIVE_PACK: &str = "git-receive-pack";

/// Repository paths: slash-separated segments that start with an
/// alphanumeric character.
pub static REPO_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*(/[a-zA-Z0-9][a-zA-Z0-9_.-]*)*$")
        .expect("Invalid regex")
});

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// The request line that opens a daemon connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonRequest {
    /// Requested service, e.g. `git-receive-pack`.
    pub service: String,
    /// Repository name, without the leading slash or a `.git` suffix.
    pub repo: String,
    /// Value of the `host=` parameter, if sent.
    pub host: Option<String>,
}

impl DaemonRequest {
    /// Parses `<service> <path>\0host=<host>\0`.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let mut fields = line.split(|&b| b == 0);
        let head = fields.next().unwrap_or_default();
        let head = std::str::from_utf8(head)
            .map_err(|_| NodeError::InvalidRequest("request is not UTF-8".to_string()))?
            .trim_end_matches('\n');
        let (service, path) = head
            .split_once(' ')
            .ok_or_else(|| NodeError::InvalidRequest(format!("missing path in {head:?}")))?;

        let host = fields
            .filter_map(|f| std::str::from_utf8(f).ok())
            .find_map(|f| f.strip_prefix("host="))
            .map(str::to_string);

        Ok(Self {
            service: service.to_string(),
            repo: normalize_repo_path(path)?,
            host,
        })
    }
}

/// Strips the leading slash and `.git` suffix and checks the remaining name.
pub fn normalize_repo_path(path: &str) -> Result<String> {
    let name = path.trim_start_matches('/');
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.contains("..") || !REPO_PATH_REGEX.is_match(name) {
        return Err(NodeError::InvalidRequest(format!(
            "invalid repository path {path:?}"
        )));
    }
    Ok(name.to_string())
}

/// A daemon that has not been started yet.
#[derive(Debug)]
pub struct Server {
    config: NodeConfig,
    repos: Arc<RepoStore>,
}

/// A running daemon.
#[derive(Debug)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    /// The bound address; useful when listening on port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections and waits for the accept loop to exit.
    /// Sessions already running finish on their own threads.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        join_accept_loop(self.join);
    }

    /// Blocks until the accept loop exits.
    pub fn wait(self) {
        join_accept_loop(self.join);
    }
}

/// Joins the accept loop, logging a panic instead of dropping it. Returns
/// false if the loop panicked.
fn join_accept_loop(join: JoinHandle<()>) -> bool {
    match join.join() {
        Ok(()) => true,
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(reason = %reason, "accept loop panicked");
            false
        }
    }
}

impl Server {
    /// Creates a daemon serving `repos`.
    pub fn new(config: NodeConfig, repos: Arc<RepoStore>) -> Self {
        Self { config, repos }
    }

    /// Binds the listener and spawns the accept loop.
    pub fn start(self) -> Result<ServerHandle> {
        let max_connections = NonZeroUsize::new(self.config.max_connections)
            .ok_or_else(|| NodeError::Config("max_connections must be at least 1".to_string()))?;
        let listener = TcpListener::bind(self.config.listen_addr)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let runtime = Runtime {
            repos: self.repos,
            receive: Arc::new(self.config.receive),
            max_connections,
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: Arc::clone(&shutdown),
        };

        tracing::info!(addr = %local_addr, "daemon listening");
        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(ServerHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

#[derive(Clone)]
struct Runtime {
    repos: Arc<RepoStore>,
    receive: Arc<ReceiveConfig>,
    max_connections: NonZeroUsize,
    active: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionGuard {
    fn try_acquire(active: &Arc<AtomicUsize>, max: NonZeroUsize) -> Option<Self> {
        let mut current = active.load(Ordering::Acquire);
        loop {
            if current >= max.get() {
                return None;
            }
            match active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Self {
                        active: Arc::clone(active),
                    })
                }
                Err(next) => current = next,
            }
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let prev = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "active connection counter underflow");
    }
}

fn run_accept_loop(listener: TcpListener, runtime: Runtime) {
    while !runtime.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                match ConnectionGuard::try_acquire(&runtime.active, runtime.max_connections) {
                    Some(guard) => {
                        let runtime = runtime.clone();
                        thread::spawn(move || {
                            let _guard = guard;
                            if let Err(err) = serve_connection(stream, &runtime) {
                                tracing::warn!(peer = %peer, error = %err, "session failed");
                            }
                        });
                    }
                    None => {
                        tracing::warn!(peer = %peer, "connection limit reached");
                        send_err(&stream, "too many connections");
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    tracing::info!("daemon stopped");
}

fn serve_connection(stream: TcpStream, runtime: &Runtime) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(runtime.receive.timeout())?;

    let line = match PktLineReader::new(&stream).read()? {
        Some(pkt) => match pkt.data() {
            Some(data) => data.to_vec(),
            None => return Err(NodeError::InvalidRequest("empty request".to_string())),
        },
        None => return Ok(()),
    };
    let request = match DaemonRequest::parse(&line) {
        Ok(request) => request,
        Err(err) => {
            send_err(&stream, &err.to_string());
            return Err(err);
        }
    };
    if request.service != RECEIVE_PACK {
        let err = NodeError::ServiceNotEnabled(request.service);
        send_err(&stream, &err.to_string());
        return Err(err);
    }

    let repo = runtime.repos.get_or_create(&request.repo);
    tracing::debug!(repo = %request.repo, host = ?request.host, "receive-pack request");

    let mut session = ReceivePack::new(repo, (*runtime.receive).clone())
        .timeout_control(Box::new(stream.try_clone()?));
    session.send_advertisement(&stream)?;
    let outcome = session.receive(&stream, &stream, None)?;
    drop(session);

    tracing::info!(
        repo = %request.repo,
        commands = outcome.commands.len(),
        all_ok = outcome.all_ok(),
        "push served"
    );
    let _ = stream.shutdown(Shutdown::Write);
    Ok(())
}

/// Replies with an `ERR` pkt-line; the client prints it and hangs up.
fn send_err(stream: &TcpStream, message: &str) {
    let mut writer = PktLineWriter::new(stream);
    let sent = writer
        .write_line(&format!("ERR {message}"))
        .and_then(|()| writer.flush());
    if let Err(err) = sent {
        tracing::debug!(error = %err, "could not send ERR line");
    }
}
