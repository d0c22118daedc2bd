//! Scan-record (advertisement payload) decoding.
//!
//! Advertisement payloads are a sequence of length-prefixed AD structures:
//! `[len][type][len-1 bytes of payload]`. This module decodes the subset
//! the core cares about into an owned [`ScanRecord`]. It is a pure decoder
//! with no dependency on the rest of the scheduler.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use gattkeeper_types::ParseError;

// AD structure types, per the assigned-numbers registry.
const AD_FLAGS: u8 = 0x01;
const AD_SERVICES_16_PARTIAL: u8 = 0x02;
const AD_SERVICES_16: u8 = 0x03;
const AD_SERVICES_32_PARTIAL: u8 = 0x04;
const AD_SERVICES_32: u8 = 0x05;
const AD_SERVICES_128_PARTIAL: u8 = 0x06;
const AD_SERVICES_128: u8 = 0x07;
const AD_NAME_SHORT: u8 = 0x08;
const AD_NAME_COMPLETE: u8 = 0x09;
const AD_TX_POWER: u8 = 0x0A;
const AD_SERVICE_DATA_16: u8 = 0x16;
const AD_MANUFACTURER: u8 = 0xFF;

/// The 96 low bits shared by all short-form Bluetooth UUIDs.
const BASE_UUID_LOW: u128 = 0x0000_1000_8000_0080_5F9B_34FB;

/// Expand a 16- or 32-bit short UUID to its 128-bit form.
fn expand_short_uuid(short: u32) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BASE_UUID_LOW)
}

/// A decoded advertisement payload.
///
/// `raw` keeps the undecoded bytes so applications can run their own
/// vendor-specific parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRecord {
    /// The raw payload this record was decoded from.
    pub raw: Vec<u8>,
    /// Advertising flags byte, if present.
    pub flags: Option<u8>,
    /// Advertised TX power in dBm, if present.
    pub tx_power: Option<i8>,
    /// Complete or shortened local name.
    pub local_name: Option<String>,
    /// Advertised service UUIDs, short forms expanded.
    pub services: Vec<Uuid>,
    /// Manufacturer (company) identifier, if present.
    pub manufacturer_id: Option<u16>,
    /// Manufacturer payload, excluding the company identifier.
    pub manufacturer_data: Option<Vec<u8>>,
    /// Service data entries, keyed by the advertised service UUID.
    pub service_data: Vec<(Uuid, Vec<u8>)>,
}

impl ScanRecord {
    /// Build a record from already-parsed fields, for backends that do not
    /// expose raw advertisement bytes.
    pub fn from_parts(
        local_name: Option<String>,
        services: Vec<Uuid>,
        manufacturer: Option<(u16, Vec<u8>)>,
        tx_power: Option<i8>,
    ) -> Self {
        let (manufacturer_id, manufacturer_data) = match manufacturer {
            Some((id, data)) => (Some(id), Some(data)),
            None => (None, None),
        };
        ScanRecord {
            raw: Vec::new(),
            flags: None,
            tx_power,
            local_name,
            services,
            manufacturer_id,
            manufacturer_data,
            service_data: Vec::new(),
        }
    }

    /// Whether the record advertises the given service.
    pub fn advertises_service(&self, uuid: Uuid) -> bool {
        self.services.contains(&uuid)
    }
}

/// Decode a raw advertisement payload.
///
/// Unknown AD types are skipped. A zero length byte ends the payload (the
/// remainder is padding). A length byte running past the end of the buffer
/// is an error.
pub fn parse_scan_record(raw: &[u8]) -> Result<ScanRecord, ParseError> {
    let mut record = ScanRecord {
        raw: raw.to_vec(),
        ..Default::default()
    };

    let mut offset = 0usize;
    while offset < raw.len() {
        let len = raw[offset] as usize;
        if len == 0 {
            break;
        }
        if offset + 1 + len > raw.len() {
            return Err(ParseError::TruncatedAdStructure { offset });
        }
        let ad_type = raw[offset + 1];
        let payload = &raw[offset + 2..offset + 1 + len];
        decode_structure(&mut record, ad_type, payload)?;
        offset += len + 1;
    }

    Ok(record)
}

fn decode_structure(record: &mut ScanRecord, ad_type: u8, payload: &[u8]) -> Result<(), ParseError> {
    match ad_type {
        AD_FLAGS => {
            if let Some(&b) = payload.first() {
                record.flags = Some(b);
            }
        }
        AD_SERVICES_16 | AD_SERVICES_16_PARTIAL => {
            if payload.len() % 2 != 0 {
                return Err(ParseError::InvalidLength {
                    what: "16-bit service list",
                    len: payload.len(),
                });
            }
            let mut buf = payload;
            while buf.remaining() >= 2 {
                record.services.push(expand_short_uuid(buf.get_u16_le() as u32));
            }
        }
        AD_SERVICES_32 | AD_SERVICES_32_PARTIAL => {
            if payload.len() % 4 != 0 {
                return Err(ParseError::InvalidLength {
                    what: "32-bit service list",
                    len: payload.len(),
                });
            }
            let mut buf = payload;
            while buf.remaining() >= 4 {
                record.services.push(expand_short_uuid(buf.get_u32_le()));
            }
        }
        AD_SERVICES_128 | AD_SERVICES_128_PARTIAL => {
            if payload.len() % 16 != 0 {
                return Err(ParseError::InvalidLength {
                    what: "128-bit service list",
                    len: payload.len(),
                });
            }
            for chunk in payload.chunks_exact(16) {
                // 128-bit UUIDs are carried little-endian on the wire.
                let mut bytes = [0u8; 16];
                for (i, b) in chunk.iter().enumerate() {
                    bytes[15 - i] = *b;
                }
                record.services.push(Uuid::from_bytes(bytes));
            }
        }
        AD_NAME_COMPLETE | AD_NAME_SHORT => {
            // A complete name wins over a shortened one.
            if record.local_name.is_none() || ad_type == AD_NAME_COMPLETE {
                record.local_name = Some(String::from_utf8_lossy(payload).into_owned());
            }
        }
        AD_TX_POWER => {
            if let Some(&b) = payload.first() {
                record.tx_power = Some(b as i8);
            }
        }
        AD_SERVICE_DATA_16 => {
            if payload.len() >= 2 {
                let mut buf = payload;
                let uuid = expand_short_uuid(buf.get_u16_le() as u32);
                record.service_data.push((uuid, buf.to_vec()));
            }
        }
        AD_MANUFACTURER => {
            if payload.len() >= 2 {
                let mut buf = payload;
                record.manufacturer_id = Some(buf.get_u16_le());
                record.manufacturer_data = Some(buf.to_vec());
            }
        }
        _ => {}
    }
    Ok(())
}

/// Estimate distance in meters from RSSI using the log-distance path loss
/// model with exponent 2 (free space).
///
/// `tx_power` is the advertised power at 1 m; callers fall back to
/// `default_tx_power` from the configuration when the scan record carries
/// none.
pub fn estimate_distance(rssi: i16, tx_power: i16) -> f64 {
    10f64.powf(f64::from(tx_power - rssi) / 20.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags_name_services() {
        // flags=0x06, 16-bit services [0xFF00], complete name "tk"
        let raw = [
            0x02, AD_FLAGS, 0x06, //
            0x03, AD_SERVICES_16, 0x00, 0xFF, //
            0x03, AD_NAME_COMPLETE, b't', b'k',
        ];
        let record = parse_scan_record(&raw).unwrap();
        assert_eq!(record.flags, Some(0x06));
        assert_eq!(record.local_name.as_deref(), Some("tk"));
        assert_eq!(record.services, vec![expand_short_uuid(0xFF00)]);
        assert!(record.advertises_service(expand_short_uuid(0xFF00)));
    }

    #[test]
    fn test_parse_manufacturer_data() {
        let raw = [0x05, AD_MANUFACTURER, 0x4C, 0x00, 0xAA, 0xBB];
        let record = parse_scan_record(&raw).unwrap();
        assert_eq!(record.manufacturer_id, Some(0x004C));
        assert_eq!(record.manufacturer_data.as_deref(), Some(&[0xAA, 0xBB][..]));
    }

    #[test]
    fn test_parse_tx_power() {
        let raw = [0x02, AD_TX_POWER, 0xF4]; // -12 dBm
        let record = parse_scan_record(&raw).unwrap();
        assert_eq!(record.tx_power, Some(-12));
    }

    #[test]
    fn test_complete_name_beats_short() {
        let raw = [
            0x03, AD_NAME_SHORT, b'a', b'b', //
            0x03, AD_NAME_COMPLETE, b'c', b'd',
        ];
        let record = parse_scan_record(&raw).unwrap();
        assert_eq!(record.local_name.as_deref(), Some("cd"));
    }

    #[test]
    fn test_zero_length_terminates() {
        let raw = [0x02, AD_FLAGS, 0x05, 0x00, 0xDE, 0xAD];
        let record = parse_scan_record(&raw).unwrap();
        assert_eq!(record.flags, Some(0x05));
        assert!(record.local_name.is_none());
    }

    #[test]
    fn test_truncated_structure_rejected() {
        let raw = [0x0A, AD_NAME_COMPLETE, b'x'];
        assert!(parse_scan_record(&raw).is_err());
    }

    #[test]
    fn test_odd_16bit_service_list_rejected() {
        let raw = [0x04, AD_SERVICES_16, 0x00, 0xFF, 0x12];
        assert!(parse_scan_record(&raw).is_err());
    }

    #[test]
    fn test_128_bit_service() {
        let uuid = Uuid::from_u128(0x0102030405060708090A0B0C0D0E0F10);
        let mut raw = vec![0x11, AD_SERVICES_128];
        let mut le = uuid.into_bytes();
        le.reverse();
        raw.extend_from_slice(&le);
        let record = parse_scan_record(&raw).unwrap();
        assert_eq!(record.services, vec![uuid]);
    }

    #[test]
    fn test_short_uuid_expansion() {
        let uuid = expand_short_uuid(0x180F);
        assert_eq!(
            uuid.to_string(),
            "0000180f-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_distance_estimate_monotonic() {
        // Stronger signal, shorter estimate.
        assert!(estimate_distance(-40, 4) < estimate_distance(-80, 4));
        // At rssi == tx_power the estimate is 1m.
        assert!((estimate_distance(4, 4) - 1.0).abs() < f64::EPSILON);
    }
}
