// btleplug-backed GATT link and device scan
//
// Connects to a Sonic Sabotage peripheral through the shared adapter in
// `ble_common`, forwards notifications into the session's event channel and
// runs a watchdog that reports link loss.

use crate::ble_common;
use crate::error::{LinkError, GATT_INSUFFICIENT_AUTHENTICATION};
use crate::gatt::{
    CharProps, DeviceHandle, DiscoveredCharacteristic, GattLink, LinkEvent, StampedEvent,
};
use crate::registry::SABOTAGE_SERVICE_UUID;
use async_trait::async_trait;
use btleplug::api::{
    Central, CharPropFlags, Characteristic, Peripheral as _, PeripheralProperties, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const IO_TIMEOUT: Duration = Duration::from_secs(5);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);
const RESCAN_DURATION: Duration = Duration::from_secs(3);
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Helpers
// ============================================================================

fn props_from_flags(flags: CharPropFlags) -> CharProps {
    CharProps {
        read: flags.contains(CharPropFlags::READ),
        write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
    }
}

fn map_btle_error(operation: &'static str, err: btleplug::Error) -> LinkError {
    match err {
        btleplug::Error::NotConnected => LinkError::NotConnected,
        btleplug::Error::TimedOut(_) => LinkError::Timeout { operation },
        btleplug::Error::NoSuchCharacteristic => {
            LinkError::Other(format!("{operation}: no such characteristic"))
        }
        other => {
            let message = other.to_string();
            let lower = message.to_ascii_lowercase();
            // BlueZ and CoreBluetooth only surface the ATT status as text.
            if lower.contains("authentication") || lower.contains("not paired") {
                LinkError::Gatt {
                    status: GATT_INSUFFICIENT_AUTHENTICATION,
                    message,
                }
            } else {
                LinkError::Other(format!("{operation} failed: {message}"))
            }
        }
    }
}

fn advertises_sabotage(props: &PeripheralProperties) -> bool {
    props.services.contains(&SABOTAGE_SERVICE_UUID)
        || props.service_data.contains_key(&SABOTAGE_SERVICE_UUID)
}

async fn adapter() -> Result<Adapter, LinkError> {
    ble_common::ensure_adapter().await.map_err(LinkError::Other)?;
    ble_common::get_adapter().await.map_err(LinkError::Other)
}

/// Match on the platform id or on the Bluetooth address.
async fn find_peripheral(adapter: &Adapter, address: &str) -> Result<Option<Peripheral>, LinkError> {
    let peripherals = adapter
        .peripherals()
        .await
        .map_err(|e| map_btle_error("list peripherals", e))?;
    for peripheral in peripherals {
        if peripheral.id().to_string() == address {
            return Ok(Some(peripheral));
        }
        if peripheral.address().to_string().eq_ignore_ascii_case(address) {
            return Ok(Some(peripheral));
        }
    }
    Ok(None)
}

// ============================================================================
// Scan
// ============================================================================

/// Scan for peripherals advertising the Sonic Sabotage service.
pub async fn scan(duration: Duration) -> Result<Vec<DeviceHandle>, String> {
    ble_common::ensure_adapter().await?;
    let adapter = ble_common::get_adapter().await?;

    // No service filter: some stacks only match UUIDs in the primary
    // advertisement, so filtering happens on the properties below.
    adapter
        .start_scan(ScanFilter::default())
        .await
        .map_err(|e| format!("Failed to start BLE scan: {e}"))?;
    tlog!("[ble] Scan started for {:?}", duration);

    let mut seen = HashSet::new();
    let mut found = Vec::new();
    let deadline = tokio::time::Instant::now() + duration;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        let Ok(peripherals) = adapter.peripherals().await else {
            continue;
        };
        for peripheral in peripherals {
            let id = peripheral.id().to_string();
            if seen.contains(&id) {
                continue;
            }
            let Some(props) = peripheral.properties().await.ok().flatten() else {
                continue;
            };
            if !advertises_sabotage(&props) {
                continue;
            }
            seen.insert(id.clone());
            let name = props.local_name.clone().unwrap_or_else(|| id.clone());
            tlog!("[ble] Found {} ({}), RSSI: {:?}", name, id, props.rssi);
            found.push(DeviceHandle::new(id, name, props.rssi));
        }
    }

    if let Err(e) = adapter.stop_scan().await {
        tlog!("[ble] Failed to stop scan: {e}");
    }
    found.sort_by(|a, b| b.rssi.cmp(&a.rssi));
    tlog!("[ble] Scan finished, {} device(s)", found.len());
    Ok(found)
}

// ============================================================================
// Link
// ============================================================================

pub struct BtleplugLink {
    peripheral: Option<Peripheral>,
    /// Bluetooth address of the last connected peripheral, kept for unbonding.
    bond_address: Option<String>,
    epoch: u64,
    events_tx: mpsc::UnboundedSender<StampedEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<StampedEvent>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BtleplugLink {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            peripheral: None,
            bond_address: None,
            epoch: 0,
            events_tx,
            events_rx: Some(events_rx),
            tasks: Vec::new(),
        }
    }

    fn peripheral(&self) -> Result<&Peripheral, LinkError> {
        self.peripheral.as_ref().ok_or(LinkError::NotConnected)
    }

    fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic), LinkError> {
        let peripheral = self.peripheral()?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::NoSuchCharacteristic(uuid))?;
        Ok((peripheral.clone(), characteristic))
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn_background(&mut self, peripheral: Peripheral) {
        let label = peripheral.id().to_string();
        let epoch = self.epoch;

        // Notification stream is multiplexed across all subscribed characteristics.
        let tx = self.events_tx.clone();
        let notifier = peripheral.clone();
        self.tasks.push(tokio::spawn(async move {
            match notifier.notifications().await {
                Ok(mut stream) => {
                    while let Some(notification) = stream.next().await {
                        let event = StampedEvent {
                            epoch,
                            event: LinkEvent::Notification {
                                uuid: notification.uuid,
                                value: notification.value,
                            },
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => tlog!("[ble] Notification stream unavailable: {e}"),
            }
        }));

        let tx = self.events_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(WATCHDOG_INTERVAL).await;
                if !peripheral.is_connected().await.unwrap_or(false) {
                    tlog!("[ble] Watchdog: peripheral {label} disconnected unexpectedly");
                    let _ = tx.send(StampedEvent {
                        epoch,
                        event: LinkEvent::Disconnected { link_loss: true },
                    });
                    break;
                }
            }
        }));
    }
}

impl Default for BtleplugLink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn connect(&mut self, device: &DeviceHandle) -> Result<(), LinkError> {
        self.epoch += 1;
        self.stop_tasks();
        if let Some(old) = self.peripheral.take() {
            let _ = old.disconnect().await;
            tlog!("[ble] Disconnected previous peripheral before new connect");
        }

        let adapter = adapter().await?;
        let peripheral = match find_peripheral(&adapter, &device.address).await? {
            Some(p) => p,
            None => {
                // Evicted from the adapter cache after an earlier disconnect.
                tlog!("[ble] Device {} not in cache, running quick rescan...", device.address);
                let _ = adapter.start_scan(ScanFilter::default()).await;
                tokio::time::sleep(RESCAN_DURATION).await;
                let _ = adapter.stop_scan().await;
                find_peripheral(&adapter, &device.address)
                    .await?
                    .ok_or_else(|| LinkError::DeviceNotFound(device.address.clone()))?
            }
        };

        tlog!("[ble] Connecting to {}...", device.address);
        match tokio::time::timeout(CONNECT_TIMEOUT, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(map_btle_error("connect", e)),
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(LinkError::Timeout { operation: "connect" });
            }
        }
        tlog!("[ble] Connected to {}", device.address);

        self.bond_address = Some(peripheral.address().to_string());
        self.spawn_background(peripheral.clone());
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredCharacteristic>, LinkError> {
        let peripheral = self.peripheral()?.clone();
        match tokio::time::timeout(DISCOVERY_TIMEOUT, peripheral.discover_services()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(map_btle_error("service discovery", e)),
            Err(_) => {
                return Err(LinkError::Timeout {
                    operation: "service discovery",
                })
            }
        }

        let discovered: Vec<_> = peripheral
            .services()
            .into_iter()
            .flat_map(|service| {
                let service_uuid = service.uuid;
                service
                    .characteristics
                    .into_iter()
                    .map(move |c| DiscoveredCharacteristic {
                        service: service_uuid,
                        uuid: c.uuid,
                        props: props_from_flags(c.properties),
                    })
            })
            .collect();
        tlog!("[ble] Discovered {} characteristics", discovered.len());
        Ok(discovered)
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, LinkError> {
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        match tokio::time::timeout(IO_TIMEOUT, peripheral.read(&characteristic)).await {
            Ok(result) => result.map_err(|e| map_btle_error("read", e)),
            Err(_) => Err(LinkError::Timeout { operation: "read" }),
        }
    }

    async fn write(&mut self, uuid: Uuid, value: &[u8]) -> Result<(), LinkError> {
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        let write = peripheral.write(&characteristic, value, WriteType::WithResponse);
        match tokio::time::timeout(IO_TIMEOUT, write).await {
            Ok(result) => result.map_err(|e| map_btle_error("write", e)),
            Err(_) => Err(LinkError::Timeout { operation: "write" }),
        }
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<(), LinkError> {
        let (peripheral, characteristic) = self.characteristic(uuid)?;
        match tokio::time::timeout(IO_TIMEOUT, peripheral.subscribe(&characteristic)).await {
            Ok(result) => result.map_err(|e| map_btle_error("subscribe", e)),
            Err(_) => Err(LinkError::Timeout {
                operation: "subscribe",
            }),
        }
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.stop_tasks();
        let Some(peripheral) = self.peripheral.take() else {
            return Ok(());
        };
        tlog!("[ble] Disconnecting from {:?}", peripheral.id());
        peripheral
            .disconnect()
            .await
            .map_err(|e| map_btle_error("disconnect", e))
    }

    async fn remove_bond(&mut self) -> Result<(), LinkError> {
        let address = self
            .bond_address
            .clone()
            .ok_or_else(|| LinkError::Other("no device to unbond".to_string()))?;

        #[cfg(target_os = "linux")]
        {
            let output = tokio::process::Command::new("bluetoothctl")
                .args(["remove", &address])
                .output()
                .await
                .map_err(|e| LinkError::Other(format!("Failed to run bluetoothctl: {e}")))?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(LinkError::Other(format!(
                    "bluetoothctl remove {address} failed: {}",
                    stderr.trim()
                )));
            }
            tlog!("[ble] Removed bond for {address}");
            Ok(())
        }

        #[cfg(not(target_os = "linux"))]
        {
            Err(LinkError::Other(format!(
                "removing the bond for {address} is not supported on this platform"
            )))
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<StampedEvent>> {
        self.events_rx.take()
    }
}
