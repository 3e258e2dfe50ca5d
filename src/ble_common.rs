// Shared BLE adapter management
//
// Provides a singleton BLE manager + adapter used by device scanning and by
// every btleplug-backed GATT link.

use btleplug::api::Manager as _;
use btleplug::platform::{Adapter, Manager};
use once_cell::sync::Lazy;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ============================================================================
// Shared adapter state
// ============================================================================

pub struct BleAdapterState {
    manager: Option<Manager>,
    pub adapter: Option<Adapter>,
}

pub static BLE_ADAPTER: Lazy<Arc<Mutex<BleAdapterState>>> = Lazy::new(|| {
    Arc::new(Mutex::new(BleAdapterState {
        manager: None,
        adapter: None,
    }))
});

/// Initialise the BLE manager and adapter if not already done.
pub async fn ensure_adapter() -> Result<(), String> {
    let mut state = BLE_ADAPTER.lock().await;
    if state.adapter.is_some() {
        return Ok(());
    }
    let manager =
        Manager::new().await.map_err(|e| format!("BLE manager init failed: {e}"))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| format!("Failed to list BLE adapters: {e}"))?;
    let adapter = adapters.into_iter().next().ok_or("No BLE adapter found")?;
    state.adapter = Some(adapter);
    state.manager = Some(manager);
    Ok(())
}

/// Get a clone of the shared BLE adapter.
pub async fn get_adapter() -> Result<Adapter, String> {
    let state = BLE_ADAPTER.lock().await;
    state
        .adapter
        .clone()
        .ok_or_else(|| "BLE adapter not initialised".to_string())
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Bluetooth SIG base UUID (`0000xxxx-0000-1000-8000-00805f9b34fb`).
const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into its full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}
