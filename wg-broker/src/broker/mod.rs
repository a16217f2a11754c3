// Privilege broker endpoints

//! Privilege broker
//!
//! The broker listens on a world-connectable bootstrap socket that serves
//! only `createSession` (and `ping`). Each session gets its own socket under
//! the runtime directory; the first client to connect owns it, the listener
//! is closed at that point, and every call on the connection is dispatched to
//! [`PrivilegedServices`]. Backend failure events are pushed to every
//! connected session.

pub mod protocol;
pub mod services;
pub mod session;

use anyhow::{Context, Result};
use futures::FutureExt;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{DaemonError, DaemonResult};
use crate::types::ErrorCode;
use protocol::{
    read_frame, write_frame, Call, Outcome, Request, Response, ServerMessage, WireError,
};
use services::PrivilegedServices;
use session::{SessionEvent, SessionRegistry};

/// File name of the bootstrap endpoint inside the runtime directory
pub const BOOTSTRAP_SOCKET: &str = "broker.sock";

/// Endpoints are connectable by any local user
const SOCKET_MODE: u32 = 0o666;

/// An unclaimed session endpoint is closed after this long
pub const SESSION_ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Unclaimed sessions allowed at once
pub const MAX_PENDING_SESSIONS: usize = 16;

/// Endpoint path of session `id`
pub fn session_socket_path(runtime_dir: &Path, id: u32) -> PathBuf {
    runtime_dir.join(format!("session-{}.sock", id))
}

fn is_broker_socket(name: &str) -> bool {
    name == BOOTSTRAP_SOCKET || (name.starts_with("session-") && name.ends_with(".sock"))
}

fn lock(sessions: &Mutex<SessionRegistry>) -> MutexGuard<'_, SessionRegistry> {
    sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn record(sessions: &Mutex<SessionRegistry>, event: SessionEvent) {
    let unlink = lock(sessions).apply(event);
    if let Some(path) = unlink {
        session::unlink(&path);
    }
}

fn bind_endpoint(path: &Path) -> DaemonResult<UnixListener> {
    let listener = UnixListener::bind(path)
        .map_err(|e| DaemonError::Permission(format!("bind {}: {}", path.display(), e)))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(SOCKET_MODE)).map_err(|e| {
        session::unlink(path);
        DaemonError::Permission(format!("chmod {}: {}", path.display(), e))
    })?;
    Ok(listener)
}

fn error_response(id: u64, code: ErrorCode, message: String) -> ServerMessage {
    ServerMessage::Response(Response {
        id,
        outcome: Outcome::Err(WireError { code, message }),
    })
}

/// Bootstrap listener plus the live session set
pub struct Broker {
    runtime_dir: PathBuf,
    services: Arc<PrivilegedServices>,
    sessions: Arc<Mutex<SessionRegistry>>,
    next_id: AtomicU32,
    accept_timeout: Duration,
}

impl Broker {
    pub fn new(runtime_dir: PathBuf, services: Arc<PrivilegedServices>) -> Self {
        Self {
            runtime_dir,
            services,
            sessions: Arc::new(Mutex::new(SessionRegistry::default())),
            next_id: AtomicU32::new(1),
            accept_timeout: SESSION_ACCEPT_TIMEOUT,
        }
    }

    /// Override how long a session endpoint waits for its client
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    pub fn bootstrap_path(&self) -> PathBuf {
        self.runtime_dir.join(BOOTSTRAP_SOCKET)
    }

    pub fn services(&self) -> &Arc<PrivilegedServices> {
        &self.services
    }

    /// Number of sessions that are listening or connected
    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Open a private endpoint and return its session id.
    ///
    /// Must be called from within the tokio runtime.
    pub fn create_session(&self) -> DaemonResult<u32> {
        // Registry lock is held until the record exists, so the task's
        // first event always finds it
        let mut registry = lock(&self.sessions);
        if registry.pending() >= MAX_PENDING_SESSIONS {
            log::warn!("Refusing session: {} endpoints unclaimed", registry.pending());
            return Err(DaemonError::Permission(
                "too many unclaimed sessions".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let path = session_socket_path(&self.runtime_dir, id);
        let listener = bind_endpoint(&path)?;

        let services = self.services.clone();
        let sessions = self.sessions.clone();
        let accept_timeout = self.accept_timeout;
        let handle = tokio::spawn(async move {
            let session = run_session(listener, id, accept_timeout, services, sessions.clone());
            let served = AssertUnwindSafe(session).catch_unwind().await;
            if served.is_err() {
                log::error!("Session {} task panicked", id);
            }
            record(&sessions, SessionEvent::Exited(id));
        });
        registry.insert(id, path.clone(), handle);

        log::info!("Session {} listening on {}", id, path.display());
        Ok(id)
    }

    /// Serve the bootstrap endpoint until `shutdown` resolves, then tear
    /// everything down
    pub async fn serve<F>(self: Arc<Self>, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        std::fs::create_dir_all(&self.runtime_dir).with_context(|| {
            format!("Failed to create runtime dir {}", self.runtime_dir.display())
        })?;
        self.remove_stale_sockets()?;

        let path = self.bootstrap_path();
        let listener = bind_endpoint(&path).context("Failed to open bootstrap endpoint")?;
        log::info!("Broker listening on {}", path.display());

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let broker = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = broker.serve_bootstrap(stream).await {
                                log::warn!("Bootstrap connection failed: {:#}", e);
                            }
                        });
                    }
                    Err(e) => log::error!("Failed to accept bootstrap connection: {}", e),
                },
            }
        }

        drop(listener);
        session::unlink(&path);
        self.shutdown().await;
        Ok(())
    }

    fn remove_stale_sockets(&self) -> Result<()> {
        let entries = std::fs::read_dir(&self.runtime_dir)
            .with_context(|| format!("Failed to read {}", self.runtime_dir.display()))?;
        for entry in entries.flatten() {
            if is_broker_socket(&entry.file_name().to_string_lossy()) {
                log::debug!("Removing stale {}", entry.path().display());
                session::unlink(&entry.path());
            }
        }
        Ok(())
    }

    async fn serve_bootstrap(&self, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let request = match read_frame::<_, Request>(&mut lines).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                    let reply = error_response(0, ErrorCode::InternalError, format!("{:#}", e));
                    write_frame(&mut writer, &reply).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let outcome = match request.call {
                Call::Ping => Outcome::Ok("pong".into()),
                Call::CreateSession => match self.create_session() {
                    Ok(id) => Outcome::Ok(id.into()),
                    Err(e) => {
                        log::error!("createSession failed: {}", e);
                        Outcome::Err(WireError::from(&e))
                    }
                },
                other => {
                    log::warn!("Refused {} on the bootstrap endpoint", other.method());
                    Outcome::Err(WireError {
                        code: ErrorCode::PermissionError,
                        message: format!("{} requires a session", other.method()),
                    })
                }
            };
            let reply = ServerMessage::Response(Response {
                id: request.id,
                outcome,
            });
            write_frame(&mut writer, &reply).await?;
        }
    }

    /// Close every session and remove every tunnel
    pub async fn shutdown(&self) {
        let records = lock(&self.sessions).drain();
        for record in records {
            if let Some(handle) = record.handle {
                handle.abort();
            }
            session::unlink(&record.socket_path);
        }
        self.services.shutdown().await;
        log::info!("Broker stopped");
    }
}

async fn run_session(
    listener: UnixListener,
    id: u32,
    accept_timeout: Duration,
    services: Arc<PrivilegedServices>,
    sessions: Arc<Mutex<SessionRegistry>>,
) {
    let stream = match tokio::time::timeout(accept_timeout, listener.accept()).await {
        Ok(Ok((stream, _))) => stream,
        Ok(Err(e)) => {
            log::error!("Session {} failed to accept: {}", id, e);
            return;
        }
        Err(_) => {
            log::info!("Session {} unclaimed after {:?}, closing", id, accept_timeout);
            return;
        }
    };
    // One client per session
    drop(listener);
    record(&sessions, SessionEvent::Accepted(id));
    log::info!("Session {} connected", id);

    if let Err(e) = serve_connection(stream, &services).await {
        log::warn!("Session {} ended with error: {:#}", id, e);
    }
    log::info!("Session {} closed", id);
    record(&sessions, SessionEvent::Closed(id));
}

async fn serve_connection(stream: UnixStream, services: &PrivilegedServices) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut events = services.subscribe();
    let mut events_open = true;

    loop {
        tokio::select! {
            frame = read_frame::<_, Request>(&mut lines) => {
                let request = match frame {
                    Ok(Some(request)) => request,
                    Ok(None) => return Ok(()),
                    Err(e) if e.downcast_ref::<serde_json::Error>().is_some() => {
                        log::warn!("Rejected frame: {:#}", e);
                        let reply = error_response(0, ErrorCode::InternalError, format!("{:#}", e));
                        write_frame(&mut writer, &reply).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let outcome = match services.dispatch(request.call).await {
                    Ok(value) => Outcome::Ok(value),
                    Err(e) => Outcome::Err(WireError::from(&e)),
                };
                let reply = ServerMessage::Response(Response { id: request.id, outcome });
                write_frame(&mut writer, &reply).await?;
            }
            event = events.recv(), if events_open => match event {
                Ok(event) => write_frame(&mut writer, &ServerMessage::Event(event)).await?,
                Err(RecvError::Lagged(missed)) => {
                    log::warn!("Session dropped {} events", missed);
                }
                Err(RecvError::Closed) => events_open = false,
            },
        }
    }
}
