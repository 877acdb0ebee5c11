//! Service discovery bridge for `_apple-midi._udp`.
//!
//! Wraps an mDNS responder with the two surfaces the session engine needs:
//! announcing our own listening port pair and learning about other sessions
//! on the network.

use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::signal::{Signal, Subscription};

const SERVICE_TYPE: &str = "_apple-midi._udp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns responder error: {0}")]
    Mdns(#[from] mdns_sd::Error),
    #[error("could not determine local ip: {0}")]
    LocalIp(#[from] local_ip_address::Error),
    #[error("could not determine hostname: {0}")]
    Hostname(#[from] std::io::Error),
}

/// A session somebody else announced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub name: String,
    pub address: String,
    pub port: u16,
}

struct Announcement {
    name: String,
    port: u16,
}

pub struct DiscoveryBridge {
    daemon: ServiceDaemon,
    announcements: Mutex<Vec<Announcement>>,
    discover_event: Signal<DiscoveredService>,
    remove_event: Signal<String>,
    cancel: CancellationToken,
}

impl DiscoveryBridge {
    pub fn new() -> Result<Self, DiscoveryError> {
        Ok(DiscoveryBridge {
            daemon: ServiceDaemon::new()?,
            announcements: Mutex::new(Vec::new()),
            discover_event: Signal::new(),
            remove_event: Signal::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn on_discover<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DiscoveredService) + Send + Sync + 'static,
    {
        self.discover_event.connect(callback)
    }

    pub fn on_remove<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.remove_event.connect(callback)
    }

    /// Publishes one RTP-MIDI session on the local network.
    pub fn announce_rtpmidi(&self, name: &str, port: u16) -> Result<(), DiscoveryError> {
        self.register(name, port)?;
        self.announcements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Announcement {
                name: name.to_string(),
                port,
            });
        Ok(())
    }

    fn register(&self, name: &str, port: u16) -> Result<(), DiscoveryError> {
        let ip = local_ip_address::local_ip()?.to_string();
        let raw_hostname = hostname::get()?.to_string_lossy().to_string();
        let host = format!("{raw_hostname}.local.");
        let service = ServiceInfo::new(SERVICE_TYPE, name, &host, ip, port, None)?;
        self.daemon.register(service)?;
        info!("Announced '{}' on port {}", name, port);
        Ok(())
    }

    pub fn unannounce_rtpmidi(&self, name: &str, port: u16) -> Result<(), DiscoveryError> {
        let fullname = format!("{name}.{SERVICE_TYPE}");
        self.daemon.unregister(&fullname)?;
        self.announcements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|announcement| !(announcement.name == name && announcement.port == port));
        info!("Unannounced '{}' on port {}", name, port);
        Ok(())
    }

    /// Re-registers every announcement, for when the responder lost state
    /// (e.g. after a network change).
    pub fn announce_all(&self) {
        let announcements: Vec<(String, u16)> = self
            .announcements
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|announcement| (announcement.name.clone(), announcement.port))
            .collect();
        for (name, port) in announcements {
            if let Err(e) = self.register(&name, port) {
                warn!("Could not re-announce '{}': {}", name, e);
            }
        }
    }

    /// Starts browsing for other sessions; results arrive through
    /// [`DiscoveryBridge::on_discover`] and [`DiscoveryBridge::on_remove`].
    pub fn browse(&self) -> Result<(), DiscoveryError> {
        let receiver = self.daemon.browse(SERVICE_TYPE)?;
        let discover_event = self.discover_event.clone();
        let remove_event = self.remove_event.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = receiver.recv_async() => {
                        match event {
                            Ok(ServiceEvent::ServiceResolved(service)) => {
                                let Some(address) = service
                                    .get_addresses()
                                    .iter()
                                    .next()
                                    .map(|ip| ip.to_string())
                                else {
                                    continue;
                                };
                                let discovered = DiscoveredService {
                                    name: instance_name(service.get_fullname()),
                                    address,
                                    port: service.get_port(),
                                };
                                info!(
                                    "Discovered '{}' at {}:{}",
                                    discovered.name, discovered.address, discovered.port
                                );
                                discover_event.emit(&discovered);
                            }
                            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                                let name = instance_name(&fullname);
                                info!("Session '{}' went away", name);
                                remove_event.emit(&name);
                            }
                            Ok(other) => debug!("mdns event: {:?}", other),
                            Err(e) => {
                                debug!("mdns browse channel closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

impl Drop for DiscoveryBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = self.daemon.shutdown();
    }
}

fn instance_name(fullname: &str) -> String {
    fullname
        .strip_suffix(SERVICE_TYPE)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}
