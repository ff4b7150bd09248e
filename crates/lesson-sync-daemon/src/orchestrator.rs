//! Session orchestrator: binds "serve" / "join" intent to the discovery
//! directory and a sync service.
//!
//! Flow mirrors the app's sharing screen:
//! 1. `select_mode` advertises (server) or starts discovery (client)
//! 2. `choose_server` picks a discovered peer (client only)
//! 3. `confirm_start` validates and starts a fresh `LessonSyncService`
//!
//! Lessons arriving from peers are deduplicated by `(topicId, id)` against
//! everything already held, and only the new ones are published as
//! `SyncEvent::LessonsUpdated`.

use crate::config::SyncConfig;
use crate::connection::SessionOptions;
use crate::service::{LessonSyncService, SyncError};
use lesson_sync_core::{
    DiscoveryDirectory, DiscoveryError, DiscoveryProvider, EventBus, Lesson, LessonMetadata,
    ServerInfo, Subscription, SyncEvent,
};
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Server,
    Client,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("No sync mode selected")]
    NoModeSelected,

    #[error("Please select a server to join")]
    NoServerSelected,

    #[error("Operation requires {expected:?} mode")]
    WrongMode { expected: Mode },

    #[error("Sync already started; stop before changing mode")]
    AlreadyStarted,

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// What the sharing screen renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncView {
    pub mode: Option<Mode>,
    pub started: bool,
    pub servers: Vec<ServerInfo>,
    pub selected: Option<ServerInfo>,
    /// Local lessons plus everything merged in from peers
    pub lessons: Vec<Lesson>,
    /// Lessons merged in since start
    pub new_lessons_count: usize,
}

struct State {
    mode: Option<Mode>,
    started: bool,
    servers: Vec<ServerInfo>,
    selected: Option<ServerInfo>,
    lessons: Vec<Lesson>,
    known: HashSet<LessonMetadata>,
    new_lessons_count: usize,
    service: Option<Arc<LessonSyncService>>,
}

impl State {
    /// Keep lessons whose key is new, recording them as held.
    fn merge(&mut self, incoming: Vec<Lesson>) -> Vec<Lesson> {
        let fresh: Vec<Lesson> = incoming
            .into_iter()
            .filter(|lesson| self.known.insert(lesson.metadata()))
            .collect();
        self.lessons.extend(fresh.iter().cloned());
        self.new_lessons_count += fresh.len();
        fresh
    }
}

fn publish(events: &EventBus, event: SyncEvent) {
    let kind = event.kind();
    let delivered = events.emit(event);
    debug!("Published {} to {} listener(s)", kind, delivered);
}

/// Drives discovery and sync for one local peer.
pub struct SessionOrchestrator<P: DiscoveryProvider> {
    config: SyncConfig,
    options: SessionOptions,
    directory: DiscoveryDirectory<P>,
    events: EventBus,
    state: Arc<Mutex<State>>,
}

impl<P: DiscoveryProvider> SessionOrchestrator<P> {
    pub fn new(config: SyncConfig, provider: P) -> Self {
        Self::with_options(config, provider, SessionOptions::default())
    }

    pub fn with_options(config: SyncConfig, provider: P, options: SessionOptions) -> Self {
        // First occurrence of a key wins, matching the session index
        let mut known = HashSet::new();
        let lessons: Vec<Lesson> = config
            .lessons
            .iter()
            .filter(|lesson| known.insert(lesson.metadata()))
            .cloned()
            .collect();

        Self {
            options,
            directory: DiscoveryDirectory::new(provider),
            events: EventBus::new(),
            state: Arc::new(Mutex::new(State {
                mode: None,
                started: false,
                servers: Vec::new(),
                selected: None,
                lessons,
                known,
                new_lessons_count: 0,
                service: None,
            })),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn directory(&self) -> &DiscoveryDirectory<P> {
        &self.directory
    }

    /// Observe lessons, peer list changes and failures from now on.
    pub fn subscribe(&self, callback: impl Fn(&SyncEvent) + Send + Sync + 'static) -> Subscription {
        self.events.subscribe(callback)
    }

    /// Choose to host or to join.
    ///
    /// Server mode advertises right away; client mode starts discovery.
    /// Switching mode before `confirm_start` tears down the previous choice.
    /// If the discovery layer fails the mode stays selected and the error is
    /// returned; syncing by address still works.
    pub fn select_mode(&self, mode: Mode) -> Result<(), OrchestratorError> {
        {
            let mut state = self.lock();
            if state.started {
                return Err(OrchestratorError::AlreadyStarted);
            }
            if state.mode == Some(mode) {
                return Ok(());
            }
            state.mode = Some(mode);
            state.selected = None;
            state.servers.clear();
        }

        info!("Selected {:?} mode", mode);
        match mode {
            Mode::Server => {
                self.directory.stop();
                self.directory.advertise(&self.config.username, self.config.port)?;
            }
            Mode::Client => {
                self.directory.stop_advertising();
                let state = Arc::clone(&self.state);
                let events = self.events.clone();
                self.directory.discover(move |servers| {
                    state.lock().unwrap_or_else(|e| e.into_inner()).servers = servers.clone();
                    publish(&events, SyncEvent::PeersChanged { servers });
                })?;
            }
        }
        Ok(())
    }

    /// Record the peer to join. Client mode only.
    pub fn choose_server(&self, server: ServerInfo) -> Result<(), OrchestratorError> {
        let mut state = self.lock();
        if state.started {
            return Err(OrchestratorError::AlreadyStarted);
        }
        if state.mode != Some(Mode::Client) {
            return Err(OrchestratorError::WrongMode {
                expected: Mode::Client,
            });
        }
        info!("Selected server {} at {}:{}", server.name, server.host, server.port);
        state.selected = Some(server);
        Ok(())
    }

    /// Validate the selection and start syncing.
    ///
    /// Preconditions are checked before any network action. Returns the
    /// listening address (server) or the peer's address (client).
    pub async fn confirm_start(&self) -> Result<SocketAddr, OrchestratorError> {
        let (mode, target, lessons, service) = {
            let mut state = self.lock();
            let mode = state.mode.ok_or(OrchestratorError::NoModeSelected)?;
            if state.started {
                return Err(OrchestratorError::AlreadyStarted);
            }
            let target = match mode {
                Mode::Client => Some(
                    state
                        .selected
                        .clone()
                        .ok_or(OrchestratorError::NoServerSelected)?,
                ),
                Mode::Server => None,
            };

            let service = Arc::new(LessonSyncService::new(self.options));
            state.started = true;
            state.service = Some(Arc::clone(&service));
            // Serve everything held so far, including lessons merged in earlier runs
            (mode, target, state.lessons.clone(), service)
        };

        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        service.on_new_lessons(move |lessons| {
            let received = lessons.len();
            let fresh = state.lock().unwrap_or_else(|e| e.into_inner()).merge(lessons);
            if fresh.is_empty() {
                debug!("Received {} lesson(s), none new", received);
                return;
            }
            info!("Merged {} new lesson(s)", fresh.len());
            publish(&events, SyncEvent::LessonsUpdated { lessons: fresh });
        });

        let config = &self.config;
        let started = match &target {
            Some(server) => {
                service
                    .connect_as_client(
                        &server.host,
                        server.port,
                        lessons,
                        config.preferences.clone(),
                        &config.username,
                    )
                    .await
            }
            None => {
                service
                    .start_server(
                        config.port,
                        lessons,
                        config.preferences.clone(),
                        &config.username,
                    )
                    .await
            }
        };

        let addr = match started {
            Ok(addr) => addr,
            Err(e) => {
                // stop() swaps the service out, so a mismatch means the user cancelled
                let still_current = {
                    let mut state = self.lock();
                    let current = state
                        .service
                        .as_ref()
                        .is_some_and(|current| Arc::ptr_eq(current, &service));
                    if current {
                        state.service = None;
                        state.started = false;
                    }
                    current
                };
                service.stop();
                if still_current {
                    warn!("Failed to start {:?} sync: {}", mode, e);
                    publish(
                        &self.events,
                        SyncEvent::SessionFailed {
                            reason: e.to_string(),
                        },
                    );
                } else {
                    debug!("{:?} sync stopped while starting: {}", mode, e);
                }
                return Err(e.into());
            }
        };

        // Port 0 binds somewhere else than what was announced
        if mode == Mode::Server && addr.port() != config.port {
            if let Err(e) = self.directory.advertise(&config.username, addr.port()) {
                warn!("Failed to re-advertise on port {}: {}", addr.port(), e);
            }
        }
        Ok(addr)
    }

    /// Stop syncing, advertising and discovery. Safe to call repeatedly and
    /// while `confirm_start` is still connecting. Merged lessons are kept.
    pub fn stop(&self) {
        let service = {
            let mut state = self.lock();
            state.mode = None;
            state.started = false;
            state.selected = None;
            state.servers.clear();
            state.service.take()
        };
        if let Some(service) = service {
            service.stop();
        }
        self.directory.stop_advertising();
        self.directory.stop();
    }

    /// Number of sessions running right now.
    pub fn session_count(&self) -> usize {
        self.lock()
            .service
            .as_ref()
            .map_or(0, |service| service.session_count())
    }

    pub fn lessons(&self) -> Vec<Lesson> {
        self.lock().lessons.clone()
    }

    pub fn view(&self) -> SyncView {
        let state = self.lock();
        SyncView {
            mode: state.mode,
            started: state.started,
            servers: state.servers.clone(),
            selected: state.selected.clone(),
            lessons: state.lessons.clone(),
            new_lessons_count: state.new_lessons_count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<P: DiscoveryProvider> Drop for SessionOrchestrator<P> {
    fn drop(&mut self) {
        if let Some(service) = self.lock().service.take() {
            service.stop();
        }
    }
}
