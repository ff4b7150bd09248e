//! Discovery directory: who on the local network can we sync with.
//!
//! The actual announcement and browsing is delegated to a
//! [`DiscoveryProvider`] (mDNS in the daemon, [`InMemoryDiscovery`] for
//! tests). The directory filters provider events down to lesson-sync
//! services and owns the resulting peer set.
//!
//! Service naming: type `lessonsync`, protocol `tcp`, domain `local`,
//! instance name `lessonsync_<displayName>`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Service type tag for lesson sync.
pub const SERVICE_TYPE: &str = "lessonsync";
/// Transport protocol of the advertised service.
pub const SERVICE_PROTOCOL: &str = "tcp";
/// Discovery domain.
pub const SERVICE_DOMAIN: &str = "local";
/// Prefix tagging instance names as ours.
pub const INSTANCE_PREFIX: &str = "lessonsync_";

/// Instance name advertised for `display_name`.
pub fn instance_name(display_name: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, display_name)
}

/// Recover the display name from an instance name, if it is one of ours.
pub fn display_name(instance: &str) -> Option<&str> {
    instance.strip_prefix(INSTANCE_PREFIX)
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Discovery provider error: {0}")]
    Provider(String),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// One discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub host: String,
    /// Display name with the service prefix stripped
    pub name: String,
    pub port: u16,
}

/// Raw event reported by a provider while browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// A service instance was resolved to a host and port
    Resolved { name: String, host: String, port: u16 },
    /// A service instance went away
    Removed { name: String },
}

/// Receives provider events while browsing.
pub type EventSink = Arc<dyn Fn(ServiceEvent) + Send + Sync>;

/// Receives the full peer list every time it changes.
pub type PeersCallback = Arc<dyn Fn(Vec<ServerInfo>) + Send + Sync>;

/// Capability to announce and find services on the local network.
///
/// Calls must not block on network confirmation.
pub trait DiscoveryProvider: Send + Sync {
    /// Announce `instance` on `port`.
    fn publish(&self, instance: &str, port: u16) -> Result<()>;

    /// Withdraw a previous announcement.
    fn unpublish(&self, instance: &str) -> Result<()>;

    /// Start browsing for lesson-sync services, reporting to `sink`.
    fn browse(&self, sink: EventSink) -> Result<()>;

    /// Stop browsing. The sink may still see events already in flight.
    fn stop_browse(&self) -> Result<()>;
}

#[derive(Default)]
struct PeerSet {
    /// Bumped by every discover/stop so stale sinks can be recognised
    generation: u64,
    active: bool,
    /// Keyed by raw instance name
    servers: BTreeMap<String, ServerInfo>,
    on_change: Option<PeersCallback>,
}

impl PeerSet {
    fn snapshot(&self) -> Vec<ServerInfo> {
        self.servers.values().cloned().collect()
    }
}

struct Shared {
    peers: Mutex<PeerSet>,
    /// Serialises notification so callers observe snapshots in mutation order
    notify: Mutex<()>,
}

impl Shared {
    fn apply(&self, generation: u64, event: ServiceEvent) {
        let _notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());

        let (snapshot, callback) = {
            let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
            if !peers.active || peers.generation != generation {
                return;
            }

            let changed = match event {
                ServiceEvent::Resolved { name, host, port } => {
                    let Some(display) = display_name(&name) else {
                        debug!("Ignoring unrelated service {:?}", name);
                        return;
                    };
                    let info = ServerInfo {
                        host,
                        name: display.to_string(),
                        port,
                    };
                    let changed = peers.servers.get(&name) != Some(&info);
                    if changed {
                        info!("Discovered {} at {}:{}", info.name, info.host, info.port);
                        peers.servers.insert(name, info);
                    }
                    changed
                }
                ServiceEvent::Removed { name } => match peers.servers.remove(&name) {
                    Some(info) => {
                        info!("Lost {} at {}:{}", info.name, info.host, info.port);
                        true
                    }
                    None => false,
                },
            };

            if !changed {
                return;
            }
            (peers.snapshot(), peers.on_change.clone())
        };

        if let Some(callback) = callback {
            callback(snapshot);
        }
    }
}

/// Tracks peers advertising lesson sync and our own announcement.
pub struct DiscoveryDirectory<P: DiscoveryProvider> {
    provider: P,
    /// Instance name and port we currently advertise
    advertised: Mutex<Option<(String, u16)>>,
    shared: Arc<Shared>,
}

impl<P: DiscoveryProvider> DiscoveryDirectory<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            advertised: Mutex::new(None),
            shared: Arc::new(Shared {
                peers: Mutex::new(PeerSet::default()),
                notify: Mutex::new(()),
            }),
        }
    }

    /// Advertise ourselves as `display_name` on `port`.
    ///
    /// Repeating the same announcement is a no-op; a different one replaces
    /// the current announcement.
    pub fn advertise(&self, display_name: &str, port: u16) -> Result<()> {
        let instance = instance_name(display_name);
        let mut advertised = self.advertised.lock().unwrap_or_else(|e| e.into_inner());

        if let Some((current, current_port)) = advertised.take() {
            if current == instance && current_port == port {
                *advertised = Some((current, current_port));
                return Ok(());
            }
            if let Err(e) = self.provider.unpublish(&current) {
                warn!("Failed to withdraw {}: {}", current, e);
            }
        }

        self.provider.publish(&instance, port)?;
        info!("Advertising {} on port {}", instance, port);
        *advertised = Some((instance, port));
        Ok(())
    }

    /// Withdraw our announcement. No-op if not advertising.
    pub fn stop_advertising(&self) {
        let taken = self
            .advertised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((instance, _)) = taken {
            match self.provider.unpublish(&instance) {
                Ok(()) => info!("Stopped advertising {}", instance),
                Err(e) => warn!("Failed to withdraw {}: {}", instance, e),
            }
        }
    }

    pub fn is_advertising(&self) -> bool {
        self.advertised
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Start watching for peers. `on_change` receives the full peer list on
    /// every addition or removal.
    ///
    /// Peers from any previous discovery are forgotten.
    pub fn discover(&self, on_change: impl Fn(Vec<ServerInfo>) + Send + Sync + 'static) -> Result<()> {
        let generation = {
            let mut peers = self.shared.peers.lock().unwrap_or_else(|e| e.into_inner());
            let was_active = peers.active;
            peers.generation += 1;
            peers.active = true;
            peers.servers.clear();
            peers.on_change = Some(Arc::new(on_change));
            if was_active {
                debug!("Restarting discovery");
            }
            peers.generation
        };

        // Restarting: drop the old browse before opening a new one
        if let Err(e) = self.provider.stop_browse() {
            debug!("stop_browse before discover failed: {}", e);
        }

        let shared = Arc::clone(&self.shared);
        let sink: EventSink = Arc::new(move |event| shared.apply(generation, event));
        if let Err(e) = self.provider.browse(sink) {
            warn!("Discovery failed to start: {}", e);
            self.deactivate();
            return Err(e);
        }
        info!("Discovering {} services", SERVICE_TYPE);
        Ok(())
    }

    /// Stop watching and forget all peers. No further callbacks fire.
    pub fn stop(&self) {
        let was_active = self.deactivate();
        if let Err(e) = self.provider.stop_browse() {
            warn!("Failed to stop discovery: {}", e);
        }
        if was_active {
            info!("Stopped discovery");
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.shared
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .active
    }

    /// Current peer list.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.shared
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot()
    }

    fn deactivate(&self) -> bool {
        let mut peers = self.shared.peers.lock().unwrap_or_else(|e| e.into_inner());
        let was_active = peers.active;
        peers.generation += 1;
        peers.active = false;
        peers.servers.clear();
        peers.on_change = None;
        was_active
    }
}

impl<P: DiscoveryProvider> Drop for DiscoveryDirectory<P> {
    fn drop(&mut self) {
        self.stop_advertising();
        self.stop();
    }
}

// ============================================================================
// In-process provider
// ============================================================================

#[derive(Default)]
struct Network {
    /// instance -> (host, port, publisher handle id)
    published: BTreeMap<String, (String, u16, u64)>,
    /// (browser handle id, sink)
    browsers: Vec<(u64, EventSink)>,
    next_id: u64,
}

/// Discovery provider backed by a shared in-process "network".
///
/// Handles created with [`InMemoryDiscovery::join`] see each other's
/// announcements, which makes multi-peer scenarios testable without mDNS.
#[derive(Clone)]
pub struct InMemoryDiscovery {
    network: Arc<Mutex<Network>>,
    host: String,
    id: u64,
}

impl Default for InMemoryDiscovery {
    fn default() -> Self {
        Self::new("127.0.0.1")
    }
}

impl InMemoryDiscovery {
    /// Create a new network with a first member at `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            network: Arc::new(Mutex::new(Network {
                next_id: 1,
                ..Network::default()
            })),
            host: host.into(),
            id: 0,
        }
    }

    /// Another member of the same network, at `host`.
    pub fn join(&self, host: impl Into<String>) -> Self {
        let id = {
            let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
            let id = network.next_id;
            network.next_id += 1;
            id
        };
        Self {
            network: Arc::clone(&self.network),
            host: host.into(),
            id,
        }
    }

    fn sinks(network: &Network) -> Vec<EventSink> {
        network.browsers.iter().map(|(_, sink)| Arc::clone(sink)).collect()
    }
}

impl DiscoveryProvider for InMemoryDiscovery {
    fn publish(&self, instance: &str, port: u16) -> Result<()> {
        let sinks = {
            let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, _, owner)) = network.published.get(instance) {
                if *owner != self.id {
                    return Err(DiscoveryError::Provider(format!(
                        "{} is already published by another member",
                        instance
                    )));
                }
            }
            network
                .published
                .insert(instance.to_string(), (self.host.clone(), port, self.id));
            Self::sinks(&network)
        };

        // Sinks run outside the lock so callbacks may call back into the network
        let event = ServiceEvent::Resolved {
            name: instance.to_string(),
            host: self.host.clone(),
            port,
        };
        for sink in sinks {
            sink(event.clone());
        }
        Ok(())
    }

    fn unpublish(&self, instance: &str) -> Result<()> {
        let sinks = {
            let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
            match network.published.get(instance) {
                Some((_, _, owner)) if *owner == self.id => {
                    network.published.remove(instance);
                    Self::sinks(&network)
                }
                _ => return Ok(()),
            }
        };

        let event = ServiceEvent::Removed {
            name: instance.to_string(),
        };
        for sink in sinks {
            sink(event.clone());
        }
        Ok(())
    }

    fn browse(&self, sink: EventSink) -> Result<()> {
        let existing: Vec<ServiceEvent> = {
            let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
            network.browsers.push((self.id, Arc::clone(&sink)));
            network
                .published
                .iter()
                .map(|(name, (host, port, _))| ServiceEvent::Resolved {
                    name: name.clone(),
                    host: host.clone(),
                    port: *port,
                })
                .collect()
        };

        for event in existing {
            sink(event);
        }
        Ok(())
    }

    fn stop_browse(&self) -> Result<()> {
        let mut network = self.network.lock().unwrap_or_else(|e| e.into_inner());
        network.browsers.retain(|(id, _)| *id != self.id);
        Ok(())
    }
}
