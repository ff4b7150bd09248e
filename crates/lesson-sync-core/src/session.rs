//! Per-connection protocol engine.
//!
//! `SyncSession` holds everything one connection needs to run the lesson
//! exchange, but performs no I/O itself. The host feeds it raw bytes and
//! carries out the returned [`SessionAction`]s, in order: writing messages
//! to the socket and delivering received lessons to whoever is listening.
//!
//! Lifecycle: `Init` → `start()` emits the handshake burst and moves to
//! `Active` → `stop()` moves to `Stopped` and discards the working set.

use crate::lesson::{Lesson, LessonMetadata};
use crate::protocol::{DecodeError, LineBuffer, SyncMessage};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Source recorded on received lessons when the peer never sent a username.
pub const UNKNOWN_SOURCE: &str = "Unknown";

/// Local side of a session: who we are, what we hold, what we want.
///
/// Shared by every session a server accepts; each session derives its own
/// private working set from it.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub username: String,
    pub lessons: Vec<Lesson>,
    /// Topic ids we pull lessons for
    pub preferences: Vec<String>,
}

impl SessionContext {
    pub fn new(username: impl Into<String>, lessons: Vec<Lesson>, preferences: Vec<String>) -> Self {
        Self {
            username: username.into(),
            lessons,
            preferences,
        }
    }
}

/// Something the host must do on behalf of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionAction {
    /// Write this message to the peer
    Send(SyncMessage),
    /// Hand this batch of received lessons to the new-lessons listener
    Deliver(Vec<Lesson>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Active,
    Stopped,
}

/// Protocol state for one connection with exactly one peer.
#[derive(Debug)]
pub struct SyncSession {
    local_username: String,
    preferences: Vec<String>,
    /// Local lessons in caller order, first copy of each key only
    metadata: Vec<LessonMetadata>,
    index: HashMap<LessonMetadata, Lesson>,
    /// Keys the peer has advertised so far
    remote_known: HashSet<LessonMetadata>,
    remote_username: Option<String>,
    remote_preferences: Vec<String>,
    lines: LineBuffer,
    state: SessionState,
}

impl SyncSession {
    pub fn new(context: &SessionContext) -> Self {
        let mut metadata = Vec::with_capacity(context.lessons.len());
        let mut index = HashMap::with_capacity(context.lessons.len());
        for lesson in &context.lessons {
            let key = lesson.metadata();
            if index.contains_key(&key) {
                debug!(
                    "Ignoring duplicate local lesson {}/{} ({:?})",
                    key.topic_id, key.id, lesson.title
                );
                continue;
            }
            metadata.push(key.clone());
            index.insert(key, lesson.clone());
        }

        Self {
            local_username: context.username.clone(),
            preferences: context.preferences.clone(),
            metadata,
            index,
            remote_known: HashSet::new(),
            remote_username: None,
            remote_preferences: Vec::new(),
            lines: LineBuffer::new(),
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn local_username(&self) -> &str {
        &self.local_username
    }

    /// The peer's display name, once its `USERNAME` has arrived.
    pub fn remote_username(&self) -> Option<&str> {
        self.remote_username.as_deref()
    }

    /// Topic ids the peer announced. Informational only.
    pub fn remote_preferences(&self) -> &[String] {
        &self.remote_preferences
    }

    pub fn has_lesson(&self, key: &LessonMetadata) -> bool {
        self.index.contains_key(key)
    }

    pub fn is_remote_known(&self, key: &LessonMetadata) -> bool {
        self.remote_known.contains(key)
    }

    /// Begin the session: returns the handshake burst (`USERNAME`,
    /// `METADATA`, `PREFERENCES`) and becomes `Active`.
    ///
    /// Returns nothing if the session was already started or stopped.
    pub fn start(&mut self) -> Vec<SyncMessage> {
        if self.state != SessionState::Init {
            return Vec::new();
        }
        self.state = SessionState::Active;
        vec![
            SyncMessage::Username(self.local_username.clone()),
            SyncMessage::Metadata(self.metadata.clone()),
            SyncMessage::Preferences(self.preferences.clone()),
        ]
    }

    /// Feed raw bytes from the socket.
    ///
    /// Complete lines are decoded and handled in arrival order. A line that
    /// fails to decode is logged and skipped; the session carries on.
    pub fn receive(&mut self, chunk: &[u8]) -> Vec<SessionAction> {
        if self.state != SessionState::Active {
            return Vec::new();
        }

        let mut actions = Vec::new();
        for line in self.lines.push(chunk) {
            match SyncMessage::decode(&line) {
                Ok(message) => actions.extend(self.handle_message(message)),
                Err(DecodeError::UnknownType(kind)) => {
                    debug!("Ignoring message with unknown type {:?}", kind);
                }
                Err(e) => {
                    warn!("Skipping malformed line ({} bytes): {}", line.len(), e);
                }
            }
        }
        actions
    }

    /// Apply one decoded message.
    pub fn handle_message(&mut self, message: SyncMessage) -> Vec<SessionAction> {
        if self.state != SessionState::Active {
            return Vec::new();
        }

        match message {
            SyncMessage::Username(name) => {
                debug!("Peer identifies as {:?}", name);
                self.remote_username = Some(name);
                Vec::new()
            }
            SyncMessage::Metadata(entries) => self.on_metadata(entries),
            SyncMessage::LessonRequest(key) => self.on_lesson_request(key),
            SyncMessage::LessonData(lessons) => self.on_lesson_data(lessons),
            SyncMessage::Preferences(topics) => {
                debug!("Peer prefers topics {:?}", topics);
                self.remote_preferences = topics;
                Vec::new()
            }
        }
    }

    fn on_metadata(&mut self, entries: Vec<LessonMetadata>) -> Vec<SessionAction> {
        let mut requests = Vec::new();
        for key in entries {
            let wanted = self.preferences.contains(&key.topic_id)
                && !self.index.contains_key(&key)
                && !self.remote_known.contains(&key);
            // Recorded whether or not it was wanted, so a repeat never re-requests
            self.remote_known.insert(key.clone());
            if wanted {
                requests.push(key);
            }
        }

        if !requests.is_empty() {
            debug!("Requesting {} lesson(s) from peer", requests.len());
        }
        requests
            .into_iter()
            .map(|key| SessionAction::Send(SyncMessage::LessonRequest(key)))
            .collect()
    }

    fn on_lesson_request(&mut self, key: LessonMetadata) -> Vec<SessionAction> {
        match self.index.get(&key) {
            Some(lesson) => {
                debug!("Serving lesson {}/{}", key.topic_id, key.id);
                let reply = lesson.stamped(&self.local_username);
                vec![SessionAction::Send(SyncMessage::LessonData(vec![reply]))]
            }
            None => {
                debug!("Peer requested unknown lesson {}/{}", key.topic_id, key.id);
                Vec::new()
            }
        }
    }

    fn on_lesson_data(&mut self, lessons: Vec<Lesson>) -> Vec<SessionAction> {
        // An empty USERNAME identifies nobody
        let source = self
            .remote_username
            .as_deref()
            .filter(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_SOURCE);
        let received: Vec<Lesson> = lessons.iter().map(|lesson| lesson.stamped(source)).collect();
        info!("Received {} lesson(s) from {}", received.len(), source);
        vec![SessionAction::Deliver(received)]
    }

    /// End the session and discard the working set. Safe to call repeatedly.
    pub fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        self.state = SessionState::Stopped;
        self.index.clear();
        self.metadata.clear();
        self.remote_known.clear();
        self.lines.clear();
    }
}
