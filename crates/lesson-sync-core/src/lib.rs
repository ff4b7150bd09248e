//! lesson-sync-core: Shared Rust library for peer-to-peer lesson exchange.
//!
//! This crate provides the I/O-free pieces of lesson sync:
//! - The lesson data model and its `(topicId, id)` identity key
//! - The newline-delimited JSON wire protocol
//! - The per-connection session engine (handshake, metadata, requests)
//! - The discovery directory and the `DiscoveryProvider` abstraction
//! - An event bus for observer registration

pub mod discovery;
pub mod events;
pub mod lesson;
pub mod protocol;
pub mod session;

pub use discovery::{
    DiscoveryDirectory, DiscoveryError, DiscoveryProvider, InMemoryDiscovery, ServerInfo,
    ServiceEvent,
};
pub use events::{EventBus, Subscription, SyncEvent};
pub use lesson::{Lesson, LessonMetadata};
pub use protocol::{DecodeError, LineBuffer, SyncMessage};
pub use session::{SessionAction, SessionContext, SessionState, SyncSession, UNKNOWN_SOURCE};
