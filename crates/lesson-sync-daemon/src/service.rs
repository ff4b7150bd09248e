//! Caller-facing sync service: one server or one client run.
//!
//! A service is single-use. `start_server` or `connect_as_client` may succeed
//! once; `stop` tears everything down and leaves the service terminal. Start
//! a fresh service to sync again.

use crate::connection::{LessonListener, SessionOptions};
use crate::server::{SessionShared, accept_loop, spawn_session};
use lesson_sync_core::{Lesson, SessionContext};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Failed to listen on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("Sync service was stopped")]
    Cancelled,

    #[error("Sync service is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Idle,
    Starting,
    Running(SocketAddr),
    Stopped,
}

/// Runs sync sessions for one role and forwards received lessons to the
/// registered listener.
pub struct LessonSyncService {
    options: SessionOptions,
    listener: LessonListener,
    state: Mutex<ServiceState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    live: Arc<AtomicUsize>,
}

impl Default for LessonSyncService {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl LessonSyncService {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            listener: LessonListener::default(),
            state: Mutex::new(ServiceState::Idle),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register the new-lessons listener, replacing any previous one.
    ///
    /// Batches that arrive before a listener is registered are dropped.
    pub fn on_new_lessons(&self, callback: impl Fn(Vec<Lesson>) + Send + Sync + 'static) {
        self.listener.set(callback);
    }

    /// Listen on `port` (0 picks a free port) and run a session for every
    /// inbound connection. Returns the bound address.
    pub async fn start_server(
        &self,
        port: u16,
        lessons: Vec<Lesson>,
        preferences: Vec<String>,
        username: &str,
    ) -> Result<SocketAddr, SyncError> {
        self.claim()?;

        let bound = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            bound = TcpListener::bind(("0.0.0.0", port)) => bound,
        };
        let listener = match bound.and_then(|l| l.local_addr().map(|addr| (l, addr))) {
            Ok(pair) => pair,
            Err(source) => {
                error!("Failed to listen on port {}: {}", port, source);
                self.release();
                return Err(SyncError::Bind { port, source });
            }
        };
        let (listener, addr) = listener;

        if !self.mark_running(addr) {
            return Err(SyncError::Cancelled);
        }
        info!("Lesson sync server listening on {}", addr);

        let shared = self.shared(username, lessons, preferences);
        self.tracker.spawn(accept_loop(
            listener,
            shared,
            self.tracker.clone(),
            self.cancel.child_token(),
        ));
        Ok(addr)
    }

    /// Connect to `host:port` and run one session over the connection.
    ///
    /// Returns once the connection is established; the session itself keeps
    /// running in the background until the peer leaves or `stop` is called.
    pub async fn connect_as_client(
        &self,
        host: &str,
        port: u16,
        lessons: Vec<Lesson>,
        preferences: Vec<String>,
        username: &str,
    ) -> Result<SocketAddr, SyncError> {
        self.claim()?;

        let target = format!("{}:{}", host, port);
        let timeout = self.options.connect_timeout;
        let connect = tokio::time::timeout(timeout, TcpStream::connect((host, port)));

        let connected = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
            connected = connect => connected,
        };
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                error!("Failed to connect to {}: {}", target, source);
                self.release();
                return Err(SyncError::Connect { addr: target, source });
            }
            Err(_) => {
                error!("Timed out connecting to {} after {:?}", target, timeout);
                self.release();
                return Err(SyncError::ConnectTimeout { addr: target, timeout });
            }
        };

        let addr = match stream.peer_addr() {
            Ok(addr) => addr,
            Err(source) => {
                self.release();
                return Err(SyncError::Connect { addr: target, source });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }

        // stop() may have run while the connect was completing
        if !self.mark_running(addr) {
            return Err(SyncError::Cancelled);
        }
        info!("Connected to {}", addr);

        let shared = self.shared(username, lessons, preferences);
        spawn_session(
            &self.tracker,
            stream,
            addr.to_string(),
            shared,
            self.cancel.child_token(),
        );
        Ok(addr)
    }

    /// Close the listener and every open session. Safe to call repeatedly
    /// and before anything was started. Does not wait for tasks to finish.
    pub fn stop(&self) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, ServiceState::Stopped)
        };
        self.cancel.cancel();
        self.tracker.close();
        if previous != ServiceState::Stopped {
            info!("Lesson sync service stopped");
        }
    }

    /// `stop`, then wait for every session task to wind down.
    pub async fn shutdown(&self) {
        self.stop();
        self.tracker.wait().await;
    }

    /// Bound listening address (server) or remote address (client).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match *self.state.lock().unwrap_or_else(|e| e.into_inner()) {
            ServiceState::Running(addr) => Some(addr),
            _ => None,
        }
    }

    /// Number of sessions currently running.
    pub fn session_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn shared(&self, username: &str, lessons: Vec<Lesson>, preferences: Vec<String>) -> SessionShared {
        SessionShared {
            context: Arc::new(SessionContext::new(username, lessons, preferences)),
            listener: self.listener.clone(),
            options: self.options,
            live: Arc::clone(&self.live),
        }
    }

    fn claim(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            ServiceState::Idle => {
                *state = ServiceState::Starting;
                Ok(())
            }
            ServiceState::Stopped => Err(SyncError::Cancelled),
            ServiceState::Starting | ServiceState::Running(_) => Err(SyncError::AlreadyRunning),
        }
    }

    /// Back to idle after a failed start, unless stopped meanwhile.
    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == ServiceState::Starting {
            *state = ServiceState::Idle;
        }
    }

    fn mark_running(&self, addr: SocketAddr) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ServiceState::Starting {
            return false;
        }
        *state = ServiceState::Running(addr);
        true
    }
}

impl Drop for LessonSyncService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
