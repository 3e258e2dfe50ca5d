// BLE GATT boundary
//
// The device session drives the peripheral only through `GattLink`. The
// btleplug implementation lives in `ble`; tests use `ble_mock`.

use crate::error::LinkError;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A peripheral found during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceHandle {
    /// Platform peripheral id or Bluetooth address.
    pub address: String,
    pub name: String,
    pub rssi: Option<i16>,
}

impl DeviceHandle {
    pub fn new(address: impl Into<String>, name: impl Into<String>, rssi: Option<i16>) -> Self {
        Self {
            address: address.into(),
            name: name.into(),
            rssi,
        }
    }

    pub fn is_valid(&self) -> bool {
        let address = self.address.trim();
        !address.is_empty() && !address.chars().any(char::is_whitespace)
    }
}

/// Characteristic property bits the session cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CharProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

impl CharProps {
    pub const READ: CharProps = CharProps {
        read: true,
        write: false,
        notify: false,
    };
    pub const READ_WRITE_NOTIFY: CharProps = CharProps {
        read: true,
        write: true,
        notify: true,
    };
}

/// One characteristic reported by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiscoveredCharacteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub props: CharProps,
}

/// Unsolicited events delivered by the link, one at a time, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Notification { uuid: Uuid, value: Vec<u8> },
    /// `link_loss` is false when the disconnect was requested locally.
    Disconnected { link_loss: bool },
    Error { status: u8, message: String },
}

/// A `LinkEvent` stamped with the connection attempt it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedEvent {
    pub epoch: u64,
    pub event: LinkEvent,
}

#[async_trait]
pub trait GattLink: Send {
    async fn connect(&mut self, device: &DeviceHandle) -> Result<(), LinkError>;

    async fn discover(&mut self) -> Result<Vec<DiscoveredCharacteristic>, LinkError>;

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, LinkError>;

    async fn write(&mut self, uuid: Uuid, value: &[u8]) -> Result<(), LinkError>;

    async fn subscribe(&mut self, uuid: Uuid) -> Result<(), LinkError>;

    async fn disconnect(&mut self) -> Result<(), LinkError>;

    /// Forget the stored bond for the connected (or last connected) device.
    async fn remove_bond(&mut self) -> Result<(), LinkError>;

    /// Connection counter, bumped at the start of every `connect`. Events
    /// queued under an older value belong to a link that no longer exists.
    fn epoch(&self) -> u64;

    /// Hand over the event receiver. Returns `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<StampedEvent>>;
}
