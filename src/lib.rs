// Sonic Sabotage client library
//
// BLE session control for the Sonic Sabotage sensor plus the firmware
// delivery pipeline (download, Wi-Fi handoff, TCP upload). A UI or the
// bundled CLI drives everything through these modules.

#[macro_use]
mod logging;

pub mod artifact;
pub mod ble;
pub mod ble_common;
pub mod config;
pub mod download;
pub mod error;
pub mod flash;
pub mod gatt;
pub mod handoff;
pub mod registry;
pub mod session;
pub mod transfer;
pub mod wifi;

#[cfg(test)]
mod ble_mock;
#[cfg(test)]
mod net_mock;

pub use artifact::FirmwareArtifact;
pub use config::SabotageConfig;
pub use error::{
    ArtifactError, ConfigError, DownloadError, FlashError, HandoffError, LinkError,
    SessionError, TransferError,
};
pub use flash::{FlashController, FlashEvent};
pub use gatt::{DeviceHandle, GattLink};
pub use logging::{file_logging_enabled, init_file_logging, stop_file_logging};
pub use registry::{CharacteristicRole, DeviceMode, Setting};
pub use session::{DeviceSession, SessionEvent, SessionState, SharedSession};

/// Start file logging when the config names a log directory.
pub fn init_logging(config: &SabotageConfig) {
    if let Some(dir) = &config.log_dir {
        if let Err(e) = init_file_logging(dir) {
            tlog!("[logging] {e}");
        }
    }
}
