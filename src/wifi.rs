// Host Wi-Fi boundary
//
// Adds the device's access point as a network profile, switches to it and
// reports connectivity changes. The Linux implementation drives NetworkManager
// through `nmcli`; the monitor polls the active SSID and turns changes into
// `NetworkEvent`s.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkState {
    Connected,
    Disconnected,
    Disconnecting,
}

/// Connectivity change tagged with the network it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkEvent {
    pub ssid: Option<String>,
    pub state: NetworkState,
}

impl NetworkEvent {
    pub fn connected(ssid: impl Into<String>) -> Self {
        Self {
            ssid: Some(ssid.into()),
            state: NetworkState::Connected,
        }
    }

    pub fn disconnected(ssid: impl Into<String>) -> Self {
        Self {
            ssid: Some(ssid.into()),
            state: NetworkState::Disconnected,
        }
    }
}

#[async_trait]
pub trait WifiNetworks: Send + Sync {
    /// Create or replace the WPA-PSK profile for `ssid`.
    async fn add_or_update_network(&self, ssid: &str, psk: &str) -> Result<(), String>;

    /// Drop the current Wi-Fi association.
    async fn disconnect(&self) -> Result<(), String>;

    /// Allow the profile for `ssid` to be selected.
    async fn enable_network(&self, ssid: &str) -> Result<(), String>;

    /// Associate with `ssid`.
    async fn reconnect(&self, ssid: &str) -> Result<(), String>;

    async fn active_ssid(&self) -> Result<Option<String>, String>;
}

// ============================================================================
// nmcli
// ============================================================================

async fn run_nmcli(args: &[&str]) -> Result<String, String> {
    let output = tokio::process::Command::new("nmcli")
        .args(args)
        .output()
        .await
        .map_err(|e| format!("Failed to run nmcli: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!("nmcli {} failed: {}", args.join(" "), stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `nmcli -t -f active,ssid dev wifi` output.
pub fn parse_active_ssid(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .filter_map(|line| line.strip_prefix("yes:"))
        .find(|ssid| !ssid.is_empty())
        .map(|ssid| ssid.replace("\\:", ":"))
}

/// Parse `nmcli -t -f device,type device` output for the first Wi-Fi interface.
fn parse_wifi_device(stdout: &str) -> Option<String> {
    stdout.lines().find_map(|line| {
        let (device, kind) = line.rsplit_once(':')?;
        (kind == "wifi").then(|| device.to_string())
    })
}

/// NetworkManager-backed implementation.
#[derive(Debug, Default, Clone)]
pub struct NmcliNetworks;

#[async_trait]
impl WifiNetworks for NmcliNetworks {
    async fn add_or_update_network(&self, ssid: &str, psk: &str) -> Result<(), String> {
        // Replacing keeps a stale password from an earlier flash out of the way.
        if run_nmcli(&["connection", "delete", "id", ssid]).await.is_ok() {
            tlog!("[wifi] Removed existing profile {ssid}");
        }
        run_nmcli(&[
            "connection",
            "add",
            "type",
            "wifi",
            "con-name",
            ssid,
            "ssid",
            ssid,
            "wifi-sec.key-mgmt",
            "wpa-psk",
            "wifi-sec.psk",
            psk,
        ])
        .await?;
        tlog!("[wifi] Added profile {ssid}");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), String> {
        let devices = run_nmcli(&["-t", "-f", "device,type", "device"]).await?;
        let device = parse_wifi_device(&devices).ok_or("No Wi-Fi interface found")?;
        run_nmcli(&["device", "disconnect", &device]).await?;
        Ok(())
    }

    async fn enable_network(&self, ssid: &str) -> Result<(), String> {
        run_nmcli(&["connection", "modify", "id", ssid, "connection.autoconnect", "yes"]).await?;
        Ok(())
    }

    async fn reconnect(&self, ssid: &str) -> Result<(), String> {
        run_nmcli(&["connection", "up", "id", ssid]).await?;
        Ok(())
    }

    async fn active_ssid(&self) -> Result<Option<String>, String> {
        let stdout = run_nmcli(&["-t", "-f", "active,ssid", "dev", "wifi"]).await?;
        Ok(parse_active_ssid(&stdout))
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Events implied by the active SSID changing from `previous` to `current`.
pub fn diff_active(previous: Option<&str>, current: Option<&str>) -> Vec<NetworkEvent> {
    if previous == current {
        return Vec::new();
    }
    let mut events = Vec::new();
    if let Some(old) = previous {
        events.push(NetworkEvent::disconnected(old));
    }
    if let Some(new) = current {
        events.push(NetworkEvent::connected(new));
    }
    events
}

/// Poll the active SSID and report every change. Stops when the receiver is dropped.
pub fn spawn_network_monitor(
    networks: Arc<dyn WifiNetworks>,
    poll_interval: Duration,
) -> (mpsc::UnboundedReceiver<NetworkEvent>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        let mut previous: Option<String> = None;
        let mut first = true;
        loop {
            match networks.active_ssid().await {
                Ok(current) => {
                    // The first poll establishes the baseline.
                    if !first {
                        for event in diff_active(previous.as_deref(), current.as_deref()) {
                            tlog!("[wifi] {:?} {:?}", event.state, event.ssid);
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    first = false;
                    previous = current;
                }
                Err(e) => tlog!("[wifi] Failed to read active network: {e}"),
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(poll_interval).await;
        }
    });
    (rx, task)
}
