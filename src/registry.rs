// Characteristic registry
//
// Maps the device's logical settings and readings onto the GATT
// characteristics exposed under the Sonic Sabotage service (0x00FF).
// Resolution runs once per service discovery; lookups afterwards are by role.

use crate::ble_common::uuid_from_u16;
use crate::gatt::DiscoveredCharacteristic;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// GATT UUIDs
// ============================================================================

pub const SABOTAGE_SERVICE_UUID: Uuid = uuid_from_u16(0x00FF);
const CHAR_BUZZER_UUID: Uuid = uuid_from_u16(0xFF01);
const CHAR_MODE_UUID: Uuid = uuid_from_u16(0xFF02);
const CHAR_FIXED_INTERVAL_UUID: Uuid = uuid_from_u16(0xFF03);
const CHAR_RANDOM_INTERVAL_UUID: Uuid = uuid_from_u16(0xFF04);
const CHAR_RSSI_VALUE_UUID: Uuid = uuid_from_u16(0xFF05);
const CHAR_RSSI_MIN_UUID: Uuid = uuid_from_u16(0xFF06);
const CHAR_WIFI_PASSWORD_UUID: Uuid = uuid_from_u16(0xFF07);
const CHAR_SOLAR_VALUE_UUID: Uuid = uuid_from_u16(0xFF08);
const CHAR_SOLAR_MIN_UUID: Uuid = uuid_from_u16(0xFF09);

/// Upper bound for interval and threshold settings.
pub const SCHEDULE_MAX: u8 = 100;

// ============================================================================
// Roles
// ============================================================================

/// Every characteristic the client knows how to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CharacteristicRole {
    Buzzer,
    Mode,
    FixedInterval,
    RandomInterval,
    RssiValue,
    RssiMin,
    WifiPassword,
    SolarValue,
    SolarMin,
}

impl CharacteristicRole {
    pub const ALL: [CharacteristicRole; 9] = [
        CharacteristicRole::Buzzer,
        CharacteristicRole::Mode,
        CharacteristicRole::FixedInterval,
        CharacteristicRole::RandomInterval,
        CharacteristicRole::RssiValue,
        CharacteristicRole::RssiMin,
        CharacteristicRole::WifiPassword,
        CharacteristicRole::SolarValue,
        CharacteristicRole::SolarMin,
    ];

    pub const fn uuid(self) -> Uuid {
        match self {
            CharacteristicRole::Buzzer => CHAR_BUZZER_UUID,
            CharacteristicRole::Mode => CHAR_MODE_UUID,
            CharacteristicRole::FixedInterval => CHAR_FIXED_INTERVAL_UUID,
            CharacteristicRole::RandomInterval => CHAR_RANDOM_INTERVAL_UUID,
            CharacteristicRole::RssiValue => CHAR_RSSI_VALUE_UUID,
            CharacteristicRole::RssiMin => CHAR_RSSI_MIN_UUID,
            CharacteristicRole::WifiPassword => CHAR_WIFI_PASSWORD_UUID,
            CharacteristicRole::SolarValue => CHAR_SOLAR_VALUE_UUID,
            CharacteristicRole::SolarMin => CHAR_SOLAR_MIN_UUID,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|role| role.uuid() == *uuid)
    }

    /// Roles a device must expose (writable) to be usable at all.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            CharacteristicRole::Buzzer
                | CharacteristicRole::Mode
                | CharacteristicRole::FixedInterval
                | CharacteristicRole::RandomInterval
                | CharacteristicRole::RssiMin
                | CharacteristicRole::SolarMin
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            CharacteristicRole::Buzzer => "buzzer",
            CharacteristicRole::Mode => "mode",
            CharacteristicRole::FixedInterval => "fixed-interval",
            CharacteristicRole::RandomInterval => "random-interval",
            CharacteristicRole::RssiValue => "rssi-value",
            CharacteristicRole::RssiMin => "rssi-min",
            CharacteristicRole::WifiPassword => "wifi-password",
            CharacteristicRole::SolarValue => "solar-value",
            CharacteristicRole::SolarMin => "solar-min",
        }
    }
}

impl fmt::Display for CharacteristicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device operating mode (mode characteristic, 0xFF02).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceMode {
    /// Manual beeps only.
    Idle = 0,
    /// Device raises its AP and waits for a firmware image. No way back short of a reset.
    FirmwareUpdate = 1,
    /// Schedule/threshold loop with sensor notifications.
    Loop = 2,
}

impl TryFrom<u8> for DeviceMode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DeviceMode::Idle),
            1 => Ok(DeviceMode::FirmwareUpdate),
            2 => Ok(DeviceMode::Loop),
            other => Err(other),
        }
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Single-byte configuration parameters the client can write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Setting {
    Buzzer,
    Mode,
    FixedInterval,
    RandomInterval,
    RssiMin,
    SolarMin,
}

impl Setting {
    pub const ALL: [Setting; 6] = [
        Setting::Buzzer,
        Setting::Mode,
        Setting::FixedInterval,
        Setting::RandomInterval,
        Setting::RssiMin,
        Setting::SolarMin,
    ];

    pub const fn role(self) -> CharacteristicRole {
        match self {
            Setting::Buzzer => CharacteristicRole::Buzzer,
            Setting::Mode => CharacteristicRole::Mode,
            Setting::FixedInterval => CharacteristicRole::FixedInterval,
            Setting::RandomInterval => CharacteristicRole::RandomInterval,
            Setting::RssiMin => CharacteristicRole::RssiMin,
            Setting::SolarMin => CharacteristicRole::SolarMin,
        }
    }

    pub fn from_role(role: CharacteristicRole) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.role() == role)
    }

    pub const fn max_value(self) -> u8 {
        match self {
            Setting::Buzzer => 1,
            Setting::Mode => DeviceMode::Loop as u8,
            Setting::FixedInterval
            | Setting::RandomInterval
            | Setting::RssiMin
            | Setting::SolarMin => SCHEDULE_MAX,
        }
    }

    pub const fn accepts(self, value: u8) -> bool {
        value <= self.max_value()
    }

    /// Interval and threshold settings drive the device's loop mode.
    pub const fn is_schedule(self) -> bool {
        matches!(
            self,
            Setting::FixedInterval | Setting::RandomInterval | Setting::RssiMin | Setting::SolarMin
        )
    }
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.role().name())
    }
}

impl FromStr for Setting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|setting| setting.role().name() == wanted)
            .ok_or_else(|| format!("unknown setting '{s}'"))
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Outcome of resolving a discovery result against the known roles.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Supported(CharacteristicRegistry),
    Unsupported { missing: Vec<CharacteristicRole> },
}

/// Characteristic references resolved for one connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacteristicRegistry {
    resolved: HashMap<CharacteristicRole, DiscoveredCharacteristic>,
}

impl CharacteristicRegistry {
    /// Resolve every role under the Sonic Sabotage service.
    ///
    /// A required role that is absent, or present without WRITE, makes the
    /// device unsupported. Optional roles are simply left unresolved.
    pub fn resolve(discovered: &[DiscoveredCharacteristic]) -> Resolution {
        let resolved: HashMap<_, _> = discovered
            .iter()
            .filter(|c| c.service == SABOTAGE_SERVICE_UUID)
            .filter_map(|c| CharacteristicRole::from_uuid(&c.uuid).map(|role| (role, c.clone())))
            .collect();

        let missing: Vec<_> = CharacteristicRole::ALL
            .into_iter()
            .filter(|role| role.is_required())
            .filter(|role| !resolved.get(role).is_some_and(|c| c.props.write))
            .collect();

        if missing.is_empty() {
            tlog!("[registry] Resolved {} characteristics", resolved.len());
            Resolution::Supported(CharacteristicRegistry { resolved })
        } else {
            tlog!("[registry] Missing required characteristics: {:?}", missing);
            Resolution::Unsupported { missing }
        }
    }

    pub fn get(&self, role: CharacteristicRole) -> Option<&DiscoveredCharacteristic> {
        self.resolved.get(&role)
    }

    pub fn contains(&self, role: CharacteristicRole) -> bool {
        self.resolved.contains_key(&role)
    }

    pub fn len(&self) -> usize {
        self.resolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty()
    }
}
