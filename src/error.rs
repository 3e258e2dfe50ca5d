// Typed errors for every stage of the device session and firmware pipeline.
//
// Connection-level failures become session state transitions; these types
// carry the detail to whichever caller issued the request.

use crate::registry::{CharacteristicRole, Setting};
use crate::session::SessionState;
use thiserror::Error;

/// GATT status reported when the peer requires an authenticated (bonded) link.
pub const GATT_INSUFFICIENT_AUTHENTICATION: u8 = 0x05;

/// Failure reported by the BLE GATT boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),

    #[error("not connected")]
    NotConnected,

    #[error("link lost")]
    Disconnected,

    #[error("{operation} timed out")]
    Timeout { operation: &'static str },

    #[error("characteristic {0} not present on device")]
    NoSuchCharacteristic(uuid::Uuid),

    #[error("GATT status 0x{status:02x}: {message}")]
    Gatt { status: u8, message: String },

    #[error("{0}")]
    Other(String),
}

impl LinkError {
    /// True when the failure means the link itself is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, LinkError::NotConnected | LinkError::Disconnected)
    }

    pub fn status(&self) -> Option<u8> {
        match self {
            LinkError::Gatt { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("invalid device handle")]
    InvalidHandle,

    #[error("session is bound to {bound}, refusing to connect to {requested}")]
    DeviceMismatch { bound: String, requested: String },

    #[error("cannot {action} while {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    #[error("session not ready ({0})")]
    NotReady(SessionState),

    #[error("device does not support {0}")]
    Unsupported(CharacteristicRole),

    #[error("device is missing required characteristics: {missing:?}")]
    DeviceUnsupported { missing: Vec<CharacteristicRole> },

    #[error("value {value} out of range for {setting}")]
    InvalidValue { setting: Setting, value: u8 },

    #[error("{0} is not a schedule setting")]
    NotSchedule(Setting),

    #[error("no local value staged for {0}")]
    NoLocalValue(Setting),

    #[error("device returned an empty value for {0}")]
    EmptyValue(CharacteristicRole),

    #[error(transparent)]
    Link(#[from] LinkError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HandoffError {
    #[error("no Wi-Fi password received from device")]
    MissingPassword,

    #[error("timed out waiting to join {ssid}")]
    JoinTimeout { ssid: String },

    #[error("network event stream closed")]
    MonitorClosed,
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("failed to read firmware file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("firmware file {0} is empty")]
    Empty(String),
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("firmware file changed since it was selected (expected {expected} bytes, found {actual})")]
    SourceChanged { expected: u64, actual: u64 },

    #[error("upload failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
}

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

#[derive(Error, Debug)]
pub enum FlashError {
    #[error("a firmware transfer is already in progress")]
    AlreadyInProgress,

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Handoff(#[from] HandoffError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write config {path}: {message}")]
    Write { path: String, message: String },
}
