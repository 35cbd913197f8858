// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// mDNS service discovery for IPP and IPPS printers on the local network.
//
// Browses `_ipp._tcp.local.` (plain IPP, port 631) and `_ipps._tcp.local.`
// (TLS-secured IPP) using the `mdns-sd` crate. Resolved services feed the
// registry's implicit-class recomputation through the `DiscoveryRefresh`
// trait boundary (`registry.rs`) — the registry never touches `mdns-sd`
// directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tracing::{debug, info, warn};

use presswerk_core::error::{Result, SchedulerError};

use crate::registry::{DiscoveredHost, DiscoveryRefresh};

const IPP_SERVICE: &str = "_ipp._tcp.local.";
const IPPS_SERVICE: &str = "_ipps._tcp.local.";

/// Printer discovery engine using mDNS-SD.
///
/// Wraps an `mdns-sd` `ServiceDaemon` that continuously browses for IPP and
/// IPPS services. Discovered hosts are accumulated in a thread-safe map
/// keyed by their full service name so that duplicate events are
/// deduplicated automatically.
pub struct PrinterDiscovery {
    daemon: ServiceDaemon,
    hosts: Arc<Mutex<HashMap<String, DiscoveredHost>>>,
    browsing: bool,
}

impl PrinterDiscovery {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| SchedulerError::BadRequest(format!("failed to start mDNS daemon: {e}")))?;
        Ok(Self {
            daemon,
            hosts: Arc::new(Mutex::new(HashMap::new())),
            browsing: false,
        })
    }

    /// Start browsing for IPP and IPPS printers. Returns immediately;
    /// discovered hosts accumulate in the background.
    pub fn start(&mut self) -> Result<()> {
        if self.browsing {
            debug!("printer discovery already running");
            return Ok(());
        }

        let ipp_receiver = self
            .daemon
            .browse(IPP_SERVICE)
            .map_err(|e| SchedulerError::BadRequest(format!("browse {IPP_SERVICE}: {e}")))?;
        let ipps_receiver = self
            .daemon
            .browse(IPPS_SERVICE)
            .map_err(|e| SchedulerError::BadRequest(format!("browse {IPPS_SERVICE}: {e}")))?;

        Self::spawn_listener(IPP_SERVICE, false, ipp_receiver, Arc::clone(&self.hosts));
        Self::spawn_listener(IPPS_SERVICE, true, ipps_receiver, Arc::clone(&self.hosts));

        self.browsing = true;
        info!("mDNS printer discovery started");
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if !self.browsing {
            return Ok(());
        }
        self.daemon
            .stop_browse(IPP_SERVICE)
            .map_err(|e| SchedulerError::BadRequest(format!("stop browse {IPP_SERVICE}: {e}")))?;
        self.daemon
            .stop_browse(IPPS_SERVICE)
            .map_err(|e| SchedulerError::BadRequest(format!("stop browse {IPPS_SERVICE}: {e}")))?;
        self.browsing = false;
        info!("mDNS printer discovery stopped");
        Ok(())
    }

    pub fn shutdown(self) -> Result<()> {
        let _status_rx = self
            .daemon
            .shutdown()
            .map_err(|e| SchedulerError::BadRequest(format!("daemon shutdown: {e}")))?;
        info!("mDNS daemon shut down");
        Ok(())
    }

    pub fn is_browsing(&self) -> bool {
        self.browsing
    }

    fn spawn_listener(
        service_type: &'static str,
        tls: bool,
        receiver: mdns_sd::Receiver<ServiceEvent>,
        hosts: Arc<Mutex<HashMap<String, DiscoveredHost>>>,
    ) {
        std::thread::Builder::new()
            .name(format!("mdns-{service_type}"))
            .spawn(move || {
                while let Ok(event) = receiver.recv() {
                    match event {
                        ServiceEvent::SearchStarted(stype) => {
                            debug!(service_type = %stype, "mDNS search started");
                        }
                        ServiceEvent::ServiceFound(stype, fullname) => {
                            debug!(service_type = %stype, name = %fullname, "service found");
                        }
                        ServiceEvent::ServiceResolved(info) => {
                            let fullname = info.get_fullname().to_owned();
                            match service_info_to_host(&info, tls) {
                                Ok(host) => {
                                    info!(name = %host.name, uri = %host.device_uri, "printer resolved");
                                    hosts
                                        .lock()
                                        .expect("discovered-host map lock poisoned")
                                        .insert(fullname, host);
                                }
                                Err(e) => {
                                    warn!(fullname = %fullname, error = %e, "failed to convert resolved service");
                                }
                            }
                        }
                        ServiceEvent::ServiceRemoved(stype, fullname) => {
                            info!(service_type = %stype, name = %fullname, "printer removed");
                            hosts
                                .lock()
                                .expect("discovered-host map lock poisoned")
                                .remove(&fullname);
                        }
                        ServiceEvent::SearchStopped(stype) => {
                            debug!(service_type = %stype, "mDNS search stopped");
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn mDNS listener thread");
    }
}

impl DiscoveryRefresh for PrinterDiscovery {
    fn discovered_hosts(&self) -> Vec<DiscoveredHost> {
        self.hosts
            .lock()
            .expect("discovered-host map lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}

fn service_info_to_host(info: &ServiceInfo, tls: bool) -> Result<DiscoveredHost> {
    let fullname = info.get_fullname().to_owned();
    let port = info.get_port();

    let ip = info
        .get_addresses()
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| info.get_addresses().iter().next())
        .copied()
        .ok_or_else(|| SchedulerError::BadRequest(format!("no address for service {fullname}")))?;

    let resource_path = info.get_property_val_str("rp").unwrap_or("ipp/print");
    let scheme = if tls { "ipps" } else { "ipp" };
    let device_uri = format!("{scheme}://{ip}:{port}/{resource_path}");

    // The printer-facing name is the instance part of the mDNS full name
    // (before the first '.'), matching how implicit classes are named after
    // the shared printer name across hosts.
    let name = fullname.split('.').next().unwrap_or(&fullname).to_string();

    Ok(DiscoveredHost { name, device_uri })
}

#[cfg(test)]
mod tests {
    #[test]
    fn txt_bool_logic_parses_true_variants() {
        let parse = |v: &str| v.eq_ignore_ascii_case("t") || v.eq_ignore_ascii_case("true");
        assert!(parse("T"));
        assert!(parse("true"));
        assert!(!parse("F"));
        assert!(!parse(""));
    }
}
