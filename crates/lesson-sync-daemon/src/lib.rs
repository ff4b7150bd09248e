//! lesson-sync-daemon library: networking, discovery and orchestration.
//!
//! The binary is a thin CLI over these modules; integration tests use them
//! directly.

pub mod config;
pub mod connection;
pub mod mdns;
pub mod orchestrator;
mod server;
pub mod service;

// Re-export key types for convenience
pub use config::{ConfigError, DEFAULT_PORT, SyncConfig};
pub use connection::{SessionEnd, SessionOptions};
pub use mdns::MdnsDiscovery;
pub use orchestrator::{Mode, OrchestratorError, SessionOrchestrator, SyncView};
pub use service::{LessonSyncService, SyncError};
