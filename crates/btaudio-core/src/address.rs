//! Bluetooth device address handling.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A BR/EDR MAC address in canonical upper-case colon form.
///
/// This is the stable identity of a device everywhere in the daemon:
/// store records, runtime map keys, event payloads, and sink names all
/// key off it.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 6]);

impl Address {
    /// Parse from any common textual form (`aa:bb:...`, upper or lower case).
    pub fn parse(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 || part.len() != 2 {
                return Err(Error::invalid_address(s));
            }
            octets[count] =
                u8::from_str_radix(part, 16).map_err(|_| Error::invalid_address(s))?;
            count += 1;
        }
        if count != 6 {
            return Err(Error::invalid_address(s));
        }
        Ok(Self(octets))
    }

    /// The raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The underscore form used in PulseAudio object names,
    /// e.g. `AA_BB_CC_DD_EE_FF`.
    pub fn underscored(&self) -> String {
        self.to_string().replace(':', "_")
    }

    /// Extract the address from a PulseAudio Bluetooth sink name such as
    /// `bluez_sink.AA_BB_CC_DD_EE_FF.a2dp_sink`. The match is
    /// case-insensitive on the MAC portion.
    pub fn from_sink_name(sink_name: &str) -> Option<Self> {
        let mac = sink_name.split('.').nth(1)?;
        Self::parse(&mac.replace('_', ":")).ok()
    }

    /// Whether a PulseAudio sink name belongs to this device.
    pub fn matches_sink_name(&self, sink_name: &str) -> bool {
        sink_name
            .to_ascii_uppercase()
            .contains(&self.underscored())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

// Debug prints the canonical form — addresses show up in logs constantly.
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_uppercase() {
        let addr = Address::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn rejects_malformed() {
        assert!(Address::parse("").is_err());
        assert!(Address::parse("AA:BB:CC:DD:EE").is_err());
        assert!(Address::parse("AA:BB:CC:DD:EE:FF:00").is_err());
        assert!(Address::parse("GG:BB:CC:DD:EE:FF").is_err());
        assert!(Address::parse("AABBCCDDEEFF").is_err());
    }

    #[test]
    fn underscored_form() {
        let addr = Address::parse("AA:BB:CC:DD:EE:01").unwrap();
        assert_eq!(addr.underscored(), "AA_BB_CC_DD_EE_01");
    }

    #[test]
    fn from_sink_name_roundtrip() {
        let addr = Address::from_sink_name("bluez_sink.AA_BB_CC_DD_EE_01.a2dp_sink").unwrap();
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:01");
        assert!(addr.matches_sink_name("bluez_sink.aa_bb_cc_dd_ee_01.a2dp_sink"));
        assert!(!addr.matches_sink_name("bluez_sink.AA_BB_CC_DD_EE_02.a2dp_sink"));
    }

    #[test]
    fn from_sink_name_rejects_non_bluez() {
        assert!(Address::from_sink_name("alsa_output.pci-0000").is_none());
    }

    #[test]
    fn serde_uses_canonical_string() {
        let addr = Address::parse("aa:bb:cc:dd:ee:01").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"AA:BB:CC:DD:EE:01\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
