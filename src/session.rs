// Device session
//
// Owns one BLE connection: connect, service discovery, characteristic
// read/write/notify dispatch and the observable session state. All mutable
// connection state lives here; link events are fed in one at a time through
// `handle_link_event`, either directly or by the pump started in
// `into_shared`.

use crate::error::{LinkError, SessionError, GATT_INSUFFICIENT_AUTHENTICATION};
use crate::gatt::{DeviceHandle, GattLink, LinkEvent, StampedEvent};
use crate::registry::{
    CharacteristicRegistry, CharacteristicRole, DeviceMode, Resolution, Setting,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Settings read right after the session becomes ready, in order.
const INITIAL_READS: [Setting; 6] = [
    Setting::Buzzer,
    Setting::Mode,
    Setting::RssiMin,
    Setting::SolarMin,
    Setting::FixedInterval,
    Setting::RandomInterval,
];

/// Characteristics subscribed to after the initial reads.
const SUBSCRIPTIONS: [CharacteristicRole; 3] = [
    CharacteristicRole::Buzzer,
    CharacteristicRole::RssiValue,
    CharacteristicRole::SolarValue,
];

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "kebab-case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
    Disconnecting,
    /// Terminal: the device lacks required characteristics.
    Unsupported,
    Error(String),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::ServiceDiscovery => f.write_str("service-discovery"),
            SessionState::Ready => f.write_str("ready"),
            SessionState::Disconnecting => f.write_str("disconnecting"),
            SessionState::Unsupported => f.write_str("unsupported"),
            SessionState::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// Local (edited, unsent) and confirmed (read or acknowledged) copies of one setting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SettingSlot {
    pub local: Option<u8>,
    pub confirmed: Option<u8>,
}

impl SettingSlot {
    pub fn is_dirty(&self) -> bool {
        self.local.is_some() && self.local != self.confirmed
    }
}

#[derive(Debug, Clone, Default)]
pub struct SettingValues {
    slots: HashMap<Setting, SettingSlot>,
}

impl SettingValues {
    pub fn get(&self, setting: Setting) -> SettingSlot {
        self.slots.get(&setting).copied().unwrap_or_default()
    }

    pub fn local(&self, setting: Setting) -> Option<u8> {
        self.get(setting).local
    }

    pub fn confirmed(&self, setting: Setting) -> Option<u8> {
        self.get(setting).confirmed
    }

    fn slot_mut(&mut self, setting: Setting) -> &mut SettingSlot {
        self.slots.entry(setting).or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensor {
    Rssi,
    Solar,
}

/// Everything the session reports besides state changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    ValueRead { setting: Setting, value: u8 },
    WriteConfirmed { setting: Setting, value: u8 },
    WifiPassword { password: String },
    ButtonChanged { pressed: bool },
    SensorReading { sensor: Sensor, value: u8 },
    Unsupported { missing: Vec<CharacteristicRole> },
    Error { status: Option<u8>, message: String },
}

pub type SharedSession = Arc<Mutex<DeviceSession>>;

// ============================================================================
// Session
// ============================================================================

pub struct DeviceSession {
    link: Box<dyn GattLink>,
    device: Option<DeviceHandle>,
    registry: Option<CharacteristicRegistry>,
    settings: SettingValues,
    wifi_password: Option<String>,
    state_tx: watch::Sender<SessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl DeviceSession {
    pub fn new(link: Box<dyn GattLink>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            link,
            device: None,
            registry: None,
            settings: SettingValues::default(),
            wifi_password: None,
            state_tx,
            events_tx,
        }
    }

    /// Wrap the session for sharing and start feeding it the link's events.
    pub fn into_shared(mut self) -> SharedSession {
        let events = self.link.take_events();
        let shared = Arc::new(Mutex::new(self));
        if let Some(rx) = events {
            spawn_event_pump(Arc::downgrade(&shared), rx);
        }
        shared
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn settings(&self) -> &SettingValues {
        &self.settings
    }

    pub fn wifi_password(&self) -> Option<&str> {
        self.wifi_password.as_deref()
    }

    pub fn supports(&self, role: CharacteristicRole) -> bool {
        self.registry.as_ref().is_some_and(|r| r.contains(role))
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    /// Connect, discover and resolve characteristics, then run the initial
    /// read batch and notification subscriptions.
    pub async fn connect(&mut self, device: DeviceHandle) -> Result<(), SessionError> {
        if !device.is_valid() {
            return Err(SessionError::InvalidHandle);
        }
        if let Some(bound) = &self.device {
            if bound.address != device.address {
                return Err(SessionError::DeviceMismatch {
                    bound: bound.address.clone(),
                    requested: device.address,
                });
            }
        }
        let state = self.state();
        if !matches!(state, SessionState::Disconnected | SessionState::Error(_)) {
            return Err(SessionError::InvalidTransition {
                state,
                action: "connect",
            });
        }

        tlog!("[session] Connecting to {} ({})", device.name, device.address);
        self.set_state(SessionState::Connecting);
        if let Err(e) = self.link.connect(&device).await {
            return Err(self.fail(e).await);
        }
        self.device = Some(device);

        self.set_state(SessionState::ServiceDiscovery);
        let discovered = match self.link.discover().await {
            Ok(discovered) => discovered,
            Err(e) => {
                let _ = self.link.disconnect().await;
                return Err(self.fail(e).await);
            }
        };

        match CharacteristicRegistry::resolve(&discovered) {
            Resolution::Unsupported { missing } => {
                tlog!("[session] Device unsupported, missing {:?}", missing);
                self.set_state(SessionState::Unsupported);
                self.emit(SessionEvent::Unsupported {
                    missing: missing.clone(),
                });
                if let Err(e) = self.link.disconnect().await {
                    tlog!("[session] Disconnect after unsupported device failed: {e}");
                }
                return Err(SessionError::DeviceUnsupported { missing });
            }
            Resolution::Supported(registry) => {
                self.registry = Some(registry);
                self.set_state(SessionState::Ready);
            }
        }

        self.initial_sync().await
    }

    /// Tear the link down. A no-op when already disconnected.
    pub async fn disconnect(&mut self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Disconnected | SessionState::Unsupported => return Ok(()),
            SessionState::Disconnecting => {
                return Err(SessionError::InvalidTransition {
                    state: SessionState::Disconnecting,
                    action: "disconnect",
                })
            }
            _ => {}
        }
        tlog!("[session] Disconnecting");
        self.set_state(SessionState::Disconnecting);
        if let Err(e) = self.link.disconnect().await {
            tlog!("[session] Disconnect reported an error: {e}");
        }
        self.on_disconnected();
        Ok(())
    }

    /// Apply an event queued by the link unless it belongs to an earlier
    /// connection than the current one.
    pub async fn handle_stamped_event(&mut self, stamped: StampedEvent) {
        let current = self.link.epoch();
        if stamped.epoch != current {
            tlog!(
                "[session] Dropping {:?} from connection {} (now {current})",
                stamped.event,
                stamped.epoch
            );
            return;
        }
        self.handle_link_event(stamped.event).await;
    }

    /// Apply one event from the link. Events must be delivered in arrival order.
    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Notification { uuid, value } => self.on_notification(uuid, &value),
            LinkEvent::Disconnected { link_loss } => {
                if matches!(
                    self.state(),
                    SessionState::Disconnected | SessionState::Unsupported
                ) {
                    return;
                }
                if link_loss {
                    tlog!("[session] Link lost");
                }
                self.on_disconnected();
            }
            LinkEvent::Error { status, message } => {
                tlog!("[session] GATT error 0x{status:02x}: {message}");
                self.emit(SessionEvent::Error {
                    status: Some(status),
                    message,
                });
                if status == GATT_INSUFFICIENT_AUTHENTICATION && self.is_live() {
                    self.unbond_and_disconnect().await;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------------

    /// Stage a value locally without sending it. Allowed in any state.
    pub fn set_local(&mut self, setting: Setting, value: u8) -> Result<(), SessionError> {
        if !setting.accepts(value) {
            return Err(SessionError::InvalidValue { setting, value });
        }
        self.settings.slot_mut(setting).local = Some(value);
        Ok(())
    }

    /// Send the staged local value; promote it to confirmed once the write
    /// is acknowledged.
    pub async fn send_setting(&mut self, setting: Setting) -> Result<u8, SessionError> {
        let uuid = self.characteristic(setting.role())?;
        let value = self
            .settings
            .local(setting)
            .ok_or(SessionError::NoLocalValue(setting))?;

        if let Err(e) = self.link.write(uuid, &[value]).await {
            return Err(self.link_failed(e).await);
        }
        self.settings.slot_mut(setting).confirmed = Some(value);
        tlog!("[session] {setting} = {value} confirmed");
        self.emit(SessionEvent::WriteConfirmed { setting, value });
        Ok(value)
    }

    pub async fn write_setting(&mut self, setting: Setting, value: u8) -> Result<u8, SessionError> {
        if !setting.accepts(value) {
            return Err(SessionError::InvalidValue { setting, value });
        }
        self.characteristic(setting.role())?;
        self.set_local(setting, value)?;
        self.send_setting(setting).await
    }

    /// Change an interval or threshold the way the device expects: mode goes
    /// to loop for a non-zero value (idle for zero) and is sent first.
    pub async fn apply_schedule(&mut self, setting: Setting, value: u8) -> Result<(), SessionError> {
        if !setting.is_schedule() {
            return Err(SessionError::NotSchedule(setting));
        }
        if !setting.accepts(value) {
            return Err(SessionError::InvalidValue { setting, value });
        }
        self.characteristic(CharacteristicRole::Mode)?;
        self.characteristic(setting.role())?;

        let mode = if value == 0 {
            DeviceMode::Idle
        } else {
            DeviceMode::Loop
        };
        self.set_local(Setting::Mode, mode as u8)?;
        self.set_local(setting, value)?;
        self.send_setting(Setting::Mode).await?;
        self.send_setting(setting).await?;
        Ok(())
    }

    /// Read a setting from the device. The result becomes the confirmed
    /// value and seeds the local value if nothing has been staged yet.
    pub async fn read_setting(&mut self, setting: Setting) -> Result<u8, SessionError> {
        let role = setting.role();
        let uuid = self.characteristic(role)?;
        let bytes = match self.link.read(uuid).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.link_failed(e).await),
        };
        let value = *bytes.first().ok_or(SessionError::EmptyValue(role))?;
        self.store_confirmed(setting, value);
        Ok(value)
    }

    pub async fn read_wifi_password(&mut self) -> Result<String, SessionError> {
        let uuid = self.characteristic(CharacteristicRole::WifiPassword)?;
        let bytes = match self.link.read(uuid).await {
            Ok(bytes) => bytes,
            Err(e) => return Err(self.link_failed(e).await),
        };
        let password = decode_password(&bytes);
        tlog!("[session] Wi-Fi password received ({} chars)", password.len());
        self.wifi_password = Some(password.clone());
        self.emit(SessionEvent::WifiPassword {
            password: password.clone(),
        });
        Ok(password)
    }

    /// Switch the device into firmware-update mode. The device raises its
    /// access point and stays there until it receives an image or is reset.
    pub async fn enter_update_mode(&mut self) -> Result<(), SessionError> {
        self.write_setting(Setting::Mode, DeviceMode::FirmwareUpdate as u8)
            .await
            .map(|_| ())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn set_state(&self, state: SessionState) {
        let previous = self.state_tx.send_replace(state.clone());
        if previous != state {
            tlog!("[session] {previous} -> {state}");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }

    fn is_live(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Connecting | SessionState::ServiceDiscovery | SessionState::Ready
        )
    }

    fn characteristic(&self, role: CharacteristicRole) -> Result<Uuid, SessionError> {
        let state = self.state();
        if state != SessionState::Ready {
            return Err(SessionError::NotReady(state));
        }
        let registry = self
            .registry
            .as_ref()
            .ok_or(SessionError::NotReady(state))?;
        registry
            .get(role)
            .map(|c| c.uuid)
            .ok_or(SessionError::Unsupported(role))
    }

    fn store_confirmed(&mut self, setting: Setting, value: u8) {
        let slot = self.settings.slot_mut(setting);
        slot.confirmed = Some(value);
        if slot.local.is_none() {
            slot.local = Some(value);
        }
        self.emit(SessionEvent::ValueRead { setting, value });
    }

    async fn initial_sync(&mut self) -> Result<(), SessionError> {
        for setting in INITIAL_READS {
            match self.read_setting(setting).await {
                Ok(_) => {}
                Err(SessionError::Link(e)) if e.is_disconnect() => return Err(SessionError::Link(e)),
                Err(e) => tlog!("[session] Initial read of {setting} failed: {e}"),
            }
            if self.state() != SessionState::Ready {
                return Err(SessionError::NotReady(self.state()));
            }
        }

        if self.supports(CharacteristicRole::WifiPassword) {
            match self.read_wifi_password().await {
                Ok(_) => {}
                Err(SessionError::Link(e)) if e.is_disconnect() => return Err(SessionError::Link(e)),
                Err(e) => tlog!("[session] Initial password read failed: {e}"),
            }
            if self.state() != SessionState::Ready {
                return Err(SessionError::NotReady(self.state()));
            }
        }

        for role in SUBSCRIPTIONS {
            let notify = self
                .registry
                .as_ref()
                .and_then(|r| r.get(role))
                .map(|c| (c.uuid, c.props.notify));
            let uuid = match notify {
                Some((uuid, true)) => uuid,
                Some((_, false)) => {
                    tlog!("[session] {role} does not support NOTIFY");
                    continue;
                }
                None => continue,
            };
            if let Err(e) = self.link.subscribe(uuid).await {
                let err = self.link_failed(e).await;
                if self.state() != SessionState::Ready {
                    return Err(err);
                }
                tlog!("[session] Subscribe to {role} failed: {err}");
            }
        }
        Ok(())
    }

    fn on_notification(&mut self, uuid: Uuid, value: &[u8]) {
        if self.state() != SessionState::Ready {
            return;
        }
        let Some(role) = CharacteristicRole::from_uuid(&uuid) else {
            tlog!("[session] Notification from unknown characteristic {uuid}");
            return;
        };
        let Some(&byte) = value.first() else {
            return;
        };
        match role {
            CharacteristicRole::Buzzer => {
                self.emit(SessionEvent::ButtonChanged { pressed: byte != 0 });
            }
            CharacteristicRole::RssiValue => self.emit(SessionEvent::SensorReading {
                sensor: Sensor::Rssi,
                value: byte,
            }),
            CharacteristicRole::SolarValue => self.emit(SessionEvent::SensorReading {
                sensor: Sensor::Solar,
                value: byte,
            }),
            other => {
                if let Some(setting) = Setting::from_role(other) {
                    self.store_confirmed(setting, byte);
                }
            }
        }
    }

    /// Report a failed request. Auth failures unbond; lost links disconnect;
    /// anything else leaves the session as it was.
    async fn link_failed(&mut self, err: LinkError) -> SessionError {
        tlog!("[session] Request failed: {err}");
        self.emit(SessionEvent::Error {
            status: err.status(),
            message: err.to_string(),
        });
        if err.status() == Some(GATT_INSUFFICIENT_AUTHENTICATION) {
            self.unbond_and_disconnect().await;
        } else if err.is_disconnect() {
            self.on_disconnected();
        }
        SessionError::Link(err)
    }

    /// Failure while establishing the connection.
    async fn fail(&mut self, err: LinkError) -> SessionError {
        if err.status() == Some(GATT_INSUFFICIENT_AUTHENTICATION) {
            return self.link_failed(err).await;
        }
        tlog!("[session] Connection failed: {err}");
        self.registry = None;
        self.set_state(SessionState::Error(err.to_string()));
        self.emit(SessionEvent::Error {
            status: err.status(),
            message: err.to_string(),
        });
        SessionError::Link(err)
    }

    async fn unbond_and_disconnect(&mut self) {
        tlog!("[session] Authentication required, removing bond");
        if let Err(e) = self.link.remove_bond().await {
            tlog!("[session] Unbond failed: {e}");
        }
        if let Err(e) = self.link.disconnect().await {
            tlog!("[session] Disconnect after unbond failed: {e}");
        }
        self.on_disconnected();
    }

    fn on_disconnected(&mut self) {
        self.registry = None;
        if self.state() != SessionState::Unsupported {
            self.set_state(SessionState::Disconnected);
        }
    }
}

/// Password characteristic: printable ASCII, possibly NUL padded.
fn decode_password(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .trim()
        .to_string()
}

/// Feed link events into the session one at a time until either side goes away.
fn spawn_event_pump(
    session: Weak<Mutex<DeviceSession>>,
    mut rx: mpsc::UnboundedReceiver<StampedEvent>,
) {
    tokio::spawn(async move {
        while let Some(stamped) = rx.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.lock().await.handle_stamped_event(stamped).await;
        }
        tlog!("[session] Link event pump stopped");
    });
}
