//! mDNS / DNS-SD discovery provider backed by `mdns-sd`.
//!
//! Services are registered as `<instance>._lessonsync._tcp.local.`. Browse
//! events are read on a dedicated thread (the mdns-sd receiver is a
//! blocking channel) and forwarded to the directory's sink.

use lesson_sync_core::discovery::{
    DiscoveryError, DiscoveryProvider, EventSink, Result, SERVICE_DOMAIN, SERVICE_PROTOCOL,
    SERVICE_TYPE, ServiceEvent,
};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, info, warn};

/// Fully qualified service type, e.g. `_lessonsync._tcp.local.`
pub fn service_domain() -> String {
    format!("_{}._{}.{}.", SERVICE_TYPE, SERVICE_PROTOCOL, SERVICE_DOMAIN)
}

/// Instance part of an mDNS full name.
fn instance_of(fullname: &str, ty_domain: &str) -> Option<String> {
    fullname
        .strip_suffix(ty_domain)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|instance| !instance.is_empty())
        .map(str::to_string)
}

/// Address peers should dial: lowest IPv4 if any, else any address, else
/// the advertised hostname.
fn pick_host(info: &ServiceInfo) -> String {
    let mut v4: Vec<_> = info.get_addresses_v4().into_iter().copied().collect();
    v4.sort();
    if let Some(addr) = v4.first() {
        return addr.to_string();
    }

    let mut any: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    any.sort();
    match any.first() {
        Some(addr) => addr.to_string(),
        None => info.get_hostname().trim_end_matches('.').to_string(),
    }
}

fn provider_error(e: mdns_sd::Error) -> DiscoveryError {
    DiscoveryError::Provider(e.to_string())
}

/// Announces and browses lesson-sync services over multicast DNS.
pub struct MdnsDiscovery {
    daemon: ServiceDaemon,
    ty_domain: String,
}

impl MdnsDiscovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(provider_error)?;
        Ok(Self {
            daemon,
            ty_domain: service_domain(),
        })
    }

    fn fullname(&self, instance: &str) -> String {
        format!("{}.{}", instance, self.ty_domain)
    }
}

impl DiscoveryProvider for MdnsDiscovery {
    fn publish(&self, instance: &str, port: u16) -> Result<()> {
        let host_name = format!("{}.local.", instance);
        let info = ServiceInfo::new(
            &self.ty_domain,
            instance,
            &host_name,
            "",
            port,
            HashMap::<String, String>::new(),
        )
        .map_err(provider_error)?
        .enable_addr_auto();

        self.daemon.register(info).map_err(provider_error)?;
        debug!("Registered {} on port {}", self.fullname(instance), port);
        Ok(())
    }

    fn unpublish(&self, instance: &str) -> Result<()> {
        // Returns a status receiver; we don't wait for the goodbye packets
        self.daemon
            .unregister(&self.fullname(instance))
            .map_err(provider_error)?;
        Ok(())
    }

    fn browse(&self, sink: EventSink) -> Result<()> {
        let receiver = self.daemon.browse(&self.ty_domain).map_err(provider_error)?;
        let ty_domain = self.ty_domain.clone();

        std::thread::Builder::new()
            .name("mdns-browse".into())
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        mdns_sd::ServiceEvent::ServiceResolved(info) => {
                            let Some(name) = instance_of(info.get_fullname(), &ty_domain) else {
                                continue;
                            };
                            sink(ServiceEvent::Resolved {
                                name,
                                host: pick_host(&info),
                                port: info.get_port(),
                            });
                        }
                        mdns_sd::ServiceEvent::ServiceRemoved(_, fullname) => {
                            if let Some(name) = instance_of(&fullname, &ty_domain) {
                                sink(ServiceEvent::Removed { name });
                            }
                        }
                        mdns_sd::ServiceEvent::SearchStopped(_) => break,
                        other => debug!("mDNS: {:?}", other),
                    }
                }
                debug!("mDNS browse thread exiting");
            })
            .map_err(|e| DiscoveryError::Provider(e.to_string()))?;

        info!("Browsing {}", self.ty_domain);
        Ok(())
    }

    fn stop_browse(&self) -> Result<()> {
        match self.daemon.stop_browse(&self.ty_domain) {
            Ok(()) => Ok(()),
            // Not browsing: nothing to stop
            Err(e) => {
                debug!("stop_browse: {}", e);
                Ok(())
            }
        }
    }
}

impl Drop for MdnsDiscovery {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            warn!("Failed to shut down mDNS daemon: {}", e);
        }
    }
}
