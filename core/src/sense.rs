//! Sense data and sense key decoding

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Sense keys (SPC), the upper classification nibble of sense data
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, strum::IntoStaticStr)]
pub enum SenseKey {
    NoSense = 0x00,
    RecoveredError = 0x01,
    NotReady = 0x02,
    MediumError = 0x03,
    HardwareError = 0x04,
    IllegalRequest = 0x05,
    UnitAttention = 0x06,
    DataProtect = 0x07,
    BlankCheck = 0x08,
    VendorSpecific = 0x09,
    CopyAborted = 0x0A,
    AbortedCommand = 0x0B,
    Equal = 0x0C,
    VolumeOverflow = 0x0D,
    Miscompare = 0x0E,
    Completed = 0x0F,
}

// Additional sense codes acted upon by the classifier
pub const ASC_LUN_NOT_READY: u8 = 0x04;
pub const ASC_ILLEGAL_COMMAND: u8 = 0x20;
pub const ASC_ILLEGAL_BLOCK: u8 = 0x21;
pub const ASC_INVALID_CDB: u8 = 0x24;
pub const ASC_WRITE_PROTECT: u8 = 0x27;
pub const ASC_MEDIUM_CHANGED: u8 = 0x28;
pub const ASC_RESET: u8 = 0x29;
pub const ASC_PARAMETERS_CHANGED: u8 = 0x2A;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;

// Qualifiers for ASC_LUN_NOT_READY
pub const ASCQ_BECOMING_READY: u8 = 0x01;
pub const ASCQ_INIT_COMMAND_REQUIRED: u8 = 0x02;
pub const ASCQ_MANUAL_INTERVENTION_REQUIRED: u8 = 0x03;

/// Sense information reduced to the fields the engine acts on.
///
/// Transports that deliver raw autosense bytes can go through
/// [`SenseData::from_fixed`]; transports with structured completions fill
/// the fields directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    /// Raw sense key (lower nibble meaningful)
    pub key: u8,
    /// Additional sense code
    pub asc: u8,
    /// Additional sense code qualifier
    pub ascq: u8,
}

impl SenseData {
    pub fn new(key: SenseKey, asc: u8, ascq: u8) -> Self {
        Self {
            key: key as u8,
            asc,
            ascq,
        }
    }

    /// Extracts key/ASC/ASCQ from a fixed-format sense buffer
    /// (response codes 70h/71h). Descriptor format is not handled.
    pub fn from_fixed(data: &[u8]) -> Option<Self> {
        let response = data.first()? & 0x7F;
        if response != 0x70 && response != 0x71 {
            return None;
        }
        Some(Self {
            key: data.get(2)? & 0x0F,
            asc: data.get(12).copied().unwrap_or(0),
            ascq: data.get(13).copied().unwrap_or(0),
        })
    }

    /// Decoded sense key, if the raw value is a known one
    pub fn sense_key(&self) -> Option<SenseKey> {
        SenseKey::from_u8(self.key & 0x0F)
    }

    /// Key name for log lines
    pub fn key_name(&self) -> &'static str {
        self.sense_key().map_or("Unknown", <&'static str>::from)
    }
}

impl std::fmt::Display for SenseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:02x}h/{:02x}h", self.key_name(), self.asc, self.ascq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_format_parse() {
        let mut buf = [0u8; 18];
        buf[0] = 0x70;
        buf[2] = 0x06;
        buf[12] = 0x28;
        buf[13] = 0x00;
        assert_eq!(
            SenseData::from_fixed(&buf),
            Some(SenseData::new(SenseKey::UnitAttention, 0x28, 0x00))
        );
    }

    #[test]
    fn fixed_format_deferred_and_valid_bit() {
        let mut buf = [0u8; 18];
        buf[0] = 0xF1;
        buf[2] = 0x03;
        let sense = SenseData::from_fixed(&buf).unwrap();
        assert_eq!(sense.sense_key(), Some(SenseKey::MediumError));
    }

    #[test]
    fn fixed_format_rejects_other_response_codes() {
        let buf = [0x72u8, 0, 0x05, 0, 0, 0, 0, 0];
        assert_eq!(SenseData::from_fixed(&buf), None);
    }

    #[test]
    fn fixed_format_short_buffer_has_no_asc() {
        let buf = [0x70u8, 0, 0x02, 0, 0, 0, 0, 0];
        let sense = SenseData::from_fixed(&buf).unwrap();
        assert_eq!(sense.sense_key(), Some(SenseKey::NotReady));
        assert_eq!(sense.asc, 0);
        assert_eq!(sense.ascq, 0);
    }

    #[test]
    fn key_decoding_masks_reserved_bits() {
        let sense = SenseData {
            key: 0xF6,
            asc: 0,
            ascq: 0,
        };
        assert_eq!(sense.sense_key(), Some(SenseKey::UnitAttention));
        assert_eq!(sense.key_name(), "UnitAttention");
    }

    #[test]
    fn renders_for_log_lines() {
        assert_eq!(
            SenseData::new(SenseKey::IllegalRequest, ASC_INVALID_CDB, 0x00).to_string(),
            "IllegalRequest 24h/00h"
        );
        assert_eq!(
            SenseData::new(SenseKey::NotReady, ASC_LUN_NOT_READY, ASCQ_BECOMING_READY).to_string(),
            "NotReady 04h/01h"
        );
    }
}
