//! GATT-level value types: characteristic targets, the discovered service
//! database, write types, bond state, PHY and connection-priority options.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fingerprint of a characteristic or descriptor target.
///
/// When multiple characteristics on a device share a UUID, the optional
/// service UUID disambiguates; when it is `None` the first match in
/// discovery order wins. A descriptor target additionally names the
/// descriptor UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharTarget {
    /// Service the characteristic lives in, if pinned.
    pub service_uuid: Option<Uuid>,
    /// The characteristic UUID.
    pub char_uuid: Uuid,
    /// Descriptor UUID, for descriptor operations.
    pub descriptor_uuid: Option<Uuid>,
}

impl CharTarget {
    /// Target a characteristic by UUID alone.
    pub fn characteristic(char_uuid: Uuid) -> Self {
        CharTarget {
            service_uuid: None,
            char_uuid,
            descriptor_uuid: None,
        }
    }

    /// Target a characteristic within a specific service.
    pub fn in_service(service_uuid: Uuid, char_uuid: Uuid) -> Self {
        CharTarget {
            service_uuid: Some(service_uuid),
            char_uuid,
            descriptor_uuid: None,
        }
    }

    /// Target a descriptor of this characteristic.
    #[must_use]
    pub fn descriptor(mut self, descriptor_uuid: Uuid) -> Self {
        self.descriptor_uuid = Some(descriptor_uuid);
        self
    }

    /// The same target without its descriptor component.
    #[must_use]
    pub fn without_descriptor(mut self) -> Self {
        self.descriptor_uuid = None;
        self
    }
}

impl fmt::Display for CharTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.service_uuid, self.descriptor_uuid) {
            (Some(s), Some(d)) => write!(f, "{s}/{}/{d}", self.char_uuid),
            (Some(s), None) => write!(f, "{s}/{}", self.char_uuid),
            (None, Some(d)) => write!(f, "*/{}/{d}", self.char_uuid),
            (None, None) => write!(f, "{}", self.char_uuid),
        }
    }
}

/// How a characteristic write is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GattWriteType {
    /// Write request; the remote acknowledges.
    #[default]
    WithResponse,
    /// Write command; fire and forget.
    WithoutResponse,
    /// Signed write command.
    Signed,
}

/// Bond (persistent pairing) state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondState {
    #[default]
    None,
    Bonding,
    Bonded,
}

/// Notification subscription state of one characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyState {
    #[default]
    Disabled,
    Enabling,
    Enabled,
    Disabling,
}

/// Connection priority hints understood by the native stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPriority {
    LowPower,
    #[default]
    Balanced,
    High,
}

/// One PHY coding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhyOption {
    #[default]
    Le1M,
    Le2M,
    LeCoded,
}

/// The PHY pair in use (or requested) for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhyOptions {
    pub tx: PhyOption,
    pub rx: PhyOption,
}

impl PhyOptions {
    /// Same coding in both directions.
    pub fn symmetric(phy: PhyOption) -> Self {
        PhyOptions { tx: phy, rx: phy }
    }
}

/// A native GATT status code.
///
/// `0` is success. `133` is the notorious catch-all failure some stacks
/// return for transient radio conditions; the retry heuristic treats it as
/// retryable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    pub const INSUFFICIENT_AUTHENTICATION: GattStatus = GattStatus(5);
    pub const WRITE_NOT_PERMITTED: GattStatus = GattStatus(3);
    /// The spurious catch-all error.
    pub const ERROR_133: GattStatus = GattStatus(133);
    pub const FAILURE: GattStatus = GattStatus(257);

    pub fn is_success(self) -> bool {
        self == GattStatus::SUCCESS
    }

    /// Whether the one-shot internal retry heuristic applies.
    pub fn is_retryable(self) -> bool {
        self == GattStatus::ERROR_133
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gatt status {}", self.0)
    }
}

/// Property bits of a discovered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CharProps(pub u8);

impl CharProps {
    pub const BROADCAST: u8 = 0x01;
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
    pub const SIGNED_WRITE: u8 = 0x40;

    pub fn new(bits: u8) -> Self {
        CharProps(bits)
    }

    pub fn can_read(self) -> bool {
        self.0 & Self::READ != 0
    }

    pub fn can_write(self) -> bool {
        self.0 & (Self::WRITE | Self::WRITE_WITHOUT_RESPONSE | Self::SIGNED_WRITE) != 0
    }

    /// Whether the given write type is supported.
    pub fn supports_write_type(self, write_type: GattWriteType) -> bool {
        match write_type {
            GattWriteType::WithResponse => self.0 & Self::WRITE != 0,
            GattWriteType::WithoutResponse => self.0 & Self::WRITE_WITHOUT_RESPONSE != 0,
            GattWriteType::Signed => self.0 & Self::SIGNED_WRITE != 0,
        }
    }

    pub fn can_notify(self) -> bool {
        self.0 & (Self::NOTIFY | Self::INDICATE) != 0
    }

    pub fn can_indicate(self) -> bool {
        self.0 & Self::INDICATE != 0
    }
}

/// A discovered descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattDescriptor {
    pub uuid: Uuid,
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharProps,
    pub descriptors: Vec<GattDescriptor>,
}

/// A discovered service: an owned snapshot of the remote GATT database,
/// with no handles back into the native stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Find a characteristic in this service by UUID.
    pub fn characteristic(&self, char_uuid: Uuid) -> Option<&GattCharacteristic> {
        self.characteristics.iter().find(|c| c.uuid == char_uuid)
    }
}

/// Resolve a [`CharTarget`] against a discovered database.
///
/// Returns the owning service and the characteristic, or `None` when no
/// match exists. With no service pin, the first match in discovery order
/// wins.
pub fn resolve_target<'a>(
    services: &'a [GattService],
    target: &CharTarget,
) -> Option<(&'a GattService, &'a GattCharacteristic)> {
    services
        .iter()
        .filter(|s| target.service_uuid.map_or(true, |uuid| s.uuid == uuid))
        .find_map(|s| s.characteristic(target.char_uuid).map(|c| (s, c)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(n: u128) -> Uuid {
        Uuid::from_u128(n)
    }

    fn db() -> Vec<GattService> {
        vec![
            GattService {
                uuid: uuid(0x100),
                characteristics: vec![GattCharacteristic {
                    uuid: uuid(0x1),
                    properties: CharProps::new(CharProps::READ | CharProps::NOTIFY),
                    descriptors: vec![],
                }],
            },
            GattService {
                uuid: uuid(0x200),
                characteristics: vec![GattCharacteristic {
                    uuid: uuid(0x1),
                    properties: CharProps::new(CharProps::WRITE),
                    descriptors: vec![GattDescriptor { uuid: uuid(0x2902) }],
                }],
            },
        ]
    }

    #[test]
    fn test_resolve_unpinned_takes_first_match() {
        let services = db();
        let (s, c) = resolve_target(&services, &CharTarget::characteristic(uuid(0x1))).unwrap();
        assert_eq!(s.uuid, uuid(0x100));
        assert!(c.properties.can_read());
    }

    #[test]
    fn test_resolve_pinned_service() {
        let services = db();
        let target = CharTarget::in_service(uuid(0x200), uuid(0x1));
        let (s, c) = resolve_target(&services, &target).unwrap();
        assert_eq!(s.uuid, uuid(0x200));
        assert!(c.properties.can_write());
    }

    #[test]
    fn test_resolve_missing() {
        let services = db();
        assert!(resolve_target(&services, &CharTarget::characteristic(uuid(0xDEAD))).is_none());
        let wrong_service = CharTarget::in_service(uuid(0x300), uuid(0x1));
        assert!(resolve_target(&services, &wrong_service).is_none());
    }

    #[test]
    fn test_char_props() {
        let props = CharProps::new(CharProps::READ | CharProps::WRITE | CharProps::INDICATE);
        assert!(props.can_read());
        assert!(props.can_write());
        assert!(props.can_notify());
        assert!(props.can_indicate());
        assert!(props.supports_write_type(GattWriteType::WithResponse));
        assert!(!props.supports_write_type(GattWriteType::WithoutResponse));
    }

    #[test]
    fn test_gatt_status() {
        assert!(GattStatus::SUCCESS.is_success());
        assert!(GattStatus::ERROR_133.is_retryable());
        assert!(!GattStatus::FAILURE.is_retryable());
    }

    #[test]
    fn test_target_display() {
        let t = CharTarget::in_service(uuid(0x100), uuid(0x1)).descriptor(uuid(0x2902));
        let s = t.to_string();
        assert!(s.contains('/'));
    }
}
