//! Single-instance coordination.
//!
//! A starting process first tries to reach an existing instance over a named
//! local channel. If one answers, the process forwards its environment and is
//! secondary. Otherwise it takes an exclusive lock file, clears any stale
//! channel registration and listens for the rest of its life. Every step is
//! best-effort: the worst outcome is two independent instances, never a hang.

use std::{
    fs::{self, File, TryLockError},
    io::{self, Read, Write},
    net::Shutdown,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::env_state::EnvMap;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
const ACCEPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl InstanceError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What the primary received on one inbound connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    Environment(EnvMap),
    Malformed(String),
    Empty,
}

impl Handoff {
    pub fn parse(bytes: &[u8]) -> Self {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Handoff::Empty;
        }
        match serde_json::from_slice::<EnvMap>(bytes) {
            Ok(vars) => Handoff::Environment(vars),
            Err(err) => Handoff::Malformed(err.to_string()),
        }
    }
}

/// Outcome of startup arbitration.
pub enum InstanceRole {
    Primary(PrimaryInstance),
    /// Another instance owns the channel. `forwarded` tells whether the
    /// environment reached it.
    Secondary { forwarded: bool },
}

pub struct InstanceCoordinator {
    name: String,
    dir: PathBuf,
    timeout: Duration,
}

impl InstanceCoordinator {
    pub fn new(name: impl Into<String>, dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            timeout,
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.lock", self.name))
    }

    /// Decides this process's role, forwarding `env` when secondary.
    pub fn start(&self, env: &EnvMap) -> Result<InstanceRole, InstanceError> {
        let endpoint = channel::Endpoint::new(&self.name, &self.dir);

        if let Ok(stream) = channel::connect(&endpoint, self.timeout) {
            debug!(channel = %self.name, "existing instance answered");
            return Ok(InstanceRole::Secondary {
                forwarded: forward(stream, env, self.timeout),
            });
        }

        fs::create_dir_all(&self.dir)
            .map_err(|source| InstanceError::io("create", &self.dir, source))?;
        let lock_path = self.lock_path();
        let lock = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|source| InstanceError::io("open", &lock_path, source))?;

        match lock.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                debug!(channel = %self.name, "another instance is starting; retrying handoff");
                return Ok(InstanceRole::Secondary {
                    forwarded: self.retry_forward(&endpoint, env),
                });
            }
            Err(TryLockError::Error(source)) => {
                return Err(InstanceError::io("lock", &lock_path, source));
            }
        }

        endpoint.remove_stale();
        let listener = channel::bind(&endpoint)
            .map_err(|source| InstanceError::io("listen on", endpoint.path(), source))?;
        info!(channel = %self.name, "running as primary instance");
        Ok(InstanceRole::Primary(PrimaryInstance {
            endpoint,
            listener,
            lock,
            timeout: self.timeout,
        }))
    }

    fn retry_forward(&self, endpoint: &channel::Endpoint, env: &EnvMap) -> bool {
        let deadline = Instant::now() + self.timeout;
        while Instant::now() < deadline {
            if let Ok(stream) = channel::connect(endpoint, self.timeout) {
                return forward(stream, env, self.timeout);
            }
            thread::sleep(CONNECT_RETRY_DELAY);
        }
        warn!(channel = %self.name, "primary instance never answered; environment not forwarded");
        false
    }
}

fn forward(mut stream: channel::Stream, env: &EnvMap, timeout: Duration) -> bool {
    let payload = match serde_json::to_vec(env) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to encode handoff environment");
            return false;
        }
    };
    let _ = stream.set_write_timeout(Some(timeout));
    let sent = stream
        .write_all(&payload)
        .and_then(|()| stream.flush())
        .is_ok();
    let _ = stream.shutdown(Shutdown::Both);
    debug!(bytes = payload.len(), sent, "handoff forwarded");
    sent
}

/// Channel ownership held by the primary until it starts serving.
pub struct PrimaryInstance {
    endpoint: channel::Endpoint,
    listener: channel::Listener,
    lock: File,
    timeout: Duration,
}

impl PrimaryInstance {
    /// Accepts handoffs on a background thread, calling `on_handoff` once per
    /// inbound connection.
    pub fn serve<F>(self, mut on_handoff: F) -> Result<InstanceListener, InstanceError>
    where
        F: FnMut(Handoff) + Send + 'static,
    {
        let PrimaryInstance {
            endpoint,
            listener,
            lock,
            timeout,
        } = self;
        listener
            .set_nonblocking(true)
            .map_err(|source| InstanceError::io("configure", endpoint.path(), source))?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("launcher-instance".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => on_handoff(read_handoff(stream, timeout)),
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(ACCEPT_POLL);
                        }
                        Err(err) => {
                            debug!(error = %err, "failed to accept handoff connection");
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
                debug!("instance listener exited");
            })
            .map_err(|source| InstanceError::io("spawn listener for", endpoint.path(), source))?;

        Ok(InstanceListener {
            endpoint,
            stop,
            handle: Some(handle),
            _lock: lock,
        })
    }
}

fn read_handoff(mut stream: channel::Stream, timeout: Duration) -> Handoff {
    // Accepted sockets may inherit the listener's non-blocking mode.
    let _ = stream.set_nonblocking(false);
    let _ = stream.set_read_timeout(Some(timeout));
    let mut buffer = Vec::new();
    if let Err(err) = stream.read_to_end(&mut buffer) {
        debug!(error = %err, bytes = buffer.len(), "handoff read ended early");
    }
    let handoff = Handoff::parse(&buffer);
    if let Handoff::Malformed(reason) = &handoff {
        warn!(%reason, "ignoring malformed handoff payload");
    }
    handoff
}

/// Running accept loop. Dropping it closes the channel.
pub struct InstanceListener {
    endpoint: channel::Endpoint,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    _lock: File,
}

impl InstanceListener {
    /// Closes the listener and unregisters the channel name.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        let _ = handle.join();
        self.endpoint.remove_stale();
        debug!("instance channel closed");
    }
}

impl Drop for InstanceListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Foreground control over the main window.
pub trait WindowControl {
    fn is_minimized(&self) -> bool;
    fn unminimize(&mut self);
    fn is_visible(&self) -> bool;
    fn show(&mut self);
    fn raise(&mut self);
    fn focus(&mut self);
}

/// Unminimizes, shows, raises and focuses `window`.
pub fn activate_window(window: &mut dyn WindowControl) {
    if window.is_minimized() {
        window.unminimize();
    }
    if !window.is_visible() {
        window.show();
    }
    window.raise();
    window.focus();
}

#[cfg(unix)]
mod channel {
    use std::{
        fs, io,
        os::unix::net::{UnixListener, UnixStream},
        path::{Path, PathBuf},
        time::Duration,
    };

    pub type Listener = UnixListener;
    pub type Stream = UnixStream;

    pub struct Endpoint {
        path: PathBuf,
    }

    impl Endpoint {
        pub fn new(name: &str, dir: &Path) -> Self {
            Self {
                path: dir.join(format!("{name}.sock")),
            }
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        pub fn remove_stale(&self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<Stream> {
        let stream = UnixStream::connect(&endpoint.path)?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    }

    pub fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
        UnixListener::bind(&endpoint.path)
    }
}

#[cfg(not(unix))]
mod channel {
    use std::{
        io,
        net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
        path::{Path, PathBuf},
        time::Duration,
    };

    use sha2::{Digest, Sha256};

    pub type Listener = TcpListener;
    pub type Stream = TcpStream;

    /// Loopback port derived from the channel name and directory.
    pub struct Endpoint {
        addr: SocketAddr,
        label: PathBuf,
    }

    impl Endpoint {
        pub fn new(name: &str, dir: &Path) -> Self {
            let mut hasher = Sha256::new();
            hasher.update(name.as_bytes());
            hasher.update(dir.to_string_lossy().as_bytes());
            let digest = hasher.finalize();
            let port = 49152 + (u16::from_be_bytes([digest[0], digest[1]]) % 16000);
            Self {
                addr: SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
                label: dir.join(name),
            }
        }

        pub fn path(&self) -> &Path {
            &self.label
        }

        pub fn remove_stale(&self) {}
    }

    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> io::Result<Stream> {
        let stream = TcpStream::connect_timeout(&endpoint.addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    }

    pub fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
        TcpListener::bind(endpoint.addr)
    }
}
