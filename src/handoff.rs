// Wi-Fi handoff
//
// Joins the access point the device raises in firmware-update mode. Profile
// add, disconnect, enable and reconnect are issued in that order; each is
// best-effort. Retrying belongs to the transfer engine.

use crate::config::HandoffConfig;
use crate::error::HandoffError;
use crate::wifi::{NetworkEvent, NetworkState, WifiNetworks};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Recognises the usable join of the target network.
///
/// Some platforms report each join of the device AP more than once; only
/// every `events_per_join`-th matching "connected" report counts.
#[derive(Debug, Clone)]
pub struct JoinDetector {
    prefix: String,
    events_per_join: u32,
    seen: u32,
}

impl JoinDetector {
    pub fn new(ssid: &str, events_per_join: u32) -> Self {
        Self {
            prefix: ssid.to_string(),
            events_per_join: events_per_join.max(1),
            seen: 0,
        }
    }

    /// Prefix match, ignoring the quotes some platforms wrap SSIDs in.
    pub fn matches(&self, ssid: &str) -> bool {
        ssid.trim_matches('"').starts_with(&self.prefix)
    }

    /// Feed one event; true when it marks a usable join.
    pub fn observe(&mut self, event: &NetworkEvent) -> bool {
        if event.state != NetworkState::Connected {
            return false;
        }
        match event.ssid.as_deref() {
            Some(ssid) if self.matches(ssid) => {
                self.seen += 1;
                self.seen % self.events_per_join == 0
            }
            _ => false,
        }
    }
}

/// Best-effort steps that failed while switching networks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinReport {
    pub failed_steps: Vec<String>,
}

pub struct HandoffController {
    networks: Arc<dyn WifiNetworks>,
    config: HandoffConfig,
}

impl HandoffController {
    pub fn new(networks: Arc<dyn WifiNetworks>, config: HandoffConfig) -> Self {
        Self { networks, config }
    }

    pub fn ssid(&self) -> &str {
        &self.config.ssid
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn detector(&self) -> JoinDetector {
        JoinDetector::new(&self.config.ssid, self.config.connect_events_per_join)
    }

    /// Point the host at the device AP using the password read over BLE.
    pub async fn join(&self, password: &str) -> Result<JoinReport, HandoffError> {
        if password.is_empty() {
            return Err(HandoffError::MissingPassword);
        }
        let ssid = self.config.ssid.as_str();
        tlog!("[handoff] Joining {ssid}");

        let mut report = JoinReport::default();
        let steps = [
            ("add network", self.networks.add_or_update_network(ssid, password).await),
            ("disconnect", self.networks.disconnect().await),
            ("enable network", self.networks.enable_network(ssid).await),
            ("reconnect", self.networks.reconnect(ssid).await),
        ];
        for (step, result) in steps {
            if let Err(e) = result {
                tlog!("[handoff] {step} failed: {e}");
                report.failed_steps.push(step.to_string());
            }
        }
        Ok(report)
    }

    /// Wait for the usable join of the target network.
    pub async fn wait_for_join(
        &self,
        events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> Result<(), HandoffError> {
        let mut detector = self.detector();
        let wait = async {
            while let Some(event) = events.recv().await {
                tlog!("[handoff] Network {:?} {:?}", event.state, event.ssid);
                if detector.observe(&event) {
                    return Ok(());
                }
            }
            Err(HandoffError::MonitorClosed)
        };
        match tokio::time::timeout(self.config.join_timeout(), wait).await {
            Ok(result) => {
                if result.is_ok() {
                    tlog!("[handoff] Joined {}", self.config.ssid);
                }
                result
            }
            Err(_) => Err(HandoffError::JoinTimeout {
                ssid: self.config.ssid.clone(),
            }),
        }
    }
}
