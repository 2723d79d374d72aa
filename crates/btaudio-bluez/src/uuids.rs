//! Bluetooth service class UUIDs used for discovery filtering and
//! profile activation.

use uuid::Uuid;

pub const A2DP_SOURCE: Uuid = Uuid::from_u128(0x0000110a_0000_1000_8000_00805f9b34fb);
pub const A2DP_SINK: Uuid = Uuid::from_u128(0x0000110b_0000_1000_8000_00805f9b34fb);
pub const AVRCP_TARGET: Uuid = Uuid::from_u128(0x0000110c_0000_1000_8000_00805f9b34fb);
pub const AVRCP_CONTROLLER: Uuid = Uuid::from_u128(0x0000110e_0000_1000_8000_00805f9b34fb);
pub const HSP: Uuid = Uuid::from_u128(0x00001108_0000_1000_8000_00805f9b34fb);
pub const HFP: Uuid = Uuid::from_u128(0x0000111e_0000_1000_8000_00805f9b34fb);

/// The discovery filter set: audio sinks and their control profiles.
pub fn discovery_uuids() -> Vec<Uuid> {
    vec![A2DP_SINK, AVRCP_TARGET, AVRCP_CONTROLLER, HFP, HSP]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuids_are_base_uuid_derived() {
        assert_eq!(
            A2DP_SINK.to_string(),
            "0000110b-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(HFP.to_string(), "0000111e-0000-1000-8000-00805f9b34fb");
    }
}
