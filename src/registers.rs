use std::collections::BTreeMap;

use serde::Serialize;

/// Scaling function applied to a raw 16-bit register value.
pub type Scale = fn(u16) -> f64;

fn div100(raw: u16) -> f64 {
    f64::from(raw) / 100.0
}

fn unscaled(raw: u16) -> f64 {
    f64::from(raw)
}

/// One entry of the fixed register table: bus address, tag name and
/// scaling function. Addresses need not be contiguous; tags are unique.
#[derive(Clone, Copy)]
pub struct RegisterDef {
    pub address: u16,
    pub tag: &'static str,
    pub scale: Scale,
}

/// The controller's register map, sorted by address. Fixed at build time.
pub const REGISTER_MAP: &[RegisterDef] = &[
    RegisterDef { address: 0, tag: "inletMoisture", scale: div100 },
    RegisterDef { address: 1, tag: "outletMoistureAverage", scale: div100 },
    RegisterDef { address: 4, tag: "inletProductTemperature", scale: div100 },
    RegisterDef { address: 5, tag: "outletProductTemperatureAverage", scale: div100 },
    RegisterDef { address: 8, tag: "airPlenumTemperature", scale: div100 },
    RegisterDef { address: 9, tag: "dischargeRateIn", scale: div100 },
    RegisterDef { address: 10, tag: "dmRateOutput", scale: div100 },
    RegisterDef { address: 11, tag: "notReadyReason", scale: unscaled },
    RegisterDef { address: 12, tag: "aliveBit", scale: unscaled },
    RegisterDef { address: 13, tag: "controlMode", scale: unscaled },
    RegisterDef { address: 14, tag: "localRemoteMode", scale: unscaled },
    RegisterDef { address: 15, tag: "systemMode", scale: unscaled },
    RegisterDef { address: 17, tag: "targetMoisture", scale: div100 },
    RegisterDef { address: 18, tag: "currentProductNumber", scale: unscaled },
    RegisterDef { address: 19, tag: "controllerState", scale: unscaled },
    RegisterDef { address: 20, tag: "modelPredictedMoisture", scale: div100 },
    RegisterDef { address: 21, tag: "autoFirstLoad", scale: unscaled },
    RegisterDef { address: 22, tag: "modelSuggestedRate", scale: div100 },
    RegisterDef { address: 23, tag: "inletAndOutletMoistureAlarmStates", scale: unscaled },
    RegisterDef { address: 24, tag: "inletAndOutletTemperatureAlarmStates", scale: unscaled },
    RegisterDef { address: 25, tag: "dischargeAlarmStates", scale: unscaled },
    RegisterDef { address: 100, tag: "operatorDischargeSetpointWriteOnly", scale: unscaled },
    RegisterDef { address: 101, tag: "controlModeRequestWriteOnly", scale: unscaled },
    RegisterDef { address: 102, tag: "remoteModeRequestWriteOnly", scale: unscaled },
    RegisterDef { address: 103, tag: "targetMoistureWriteOnly", scale: unscaled },
    RegisterDef { address: 104, tag: "newProductNumberWriteOnly", scale: unscaled },
    RegisterDef { address: 105, tag: "remoteDryerShutdownWriteOnly", scale: unscaled },
    RegisterDef { address: 149, tag: "systemSerialNumberWriteOnly", scale: unscaled },
    RegisterDef { address: 199, tag: "heartbeatRegisterWriteOnly", scale: unscaled },
];

/// Tag of the register holding the device serial number.
pub const SERIAL_NUMBER_TAG: &str = "systemSerialNumberWriteOnly";

/// Tags of the three alarm-bitfield registers.
pub const MOISTURE_ALARM_TAG: &str = "inletAndOutletMoistureAlarmStates";
pub const TEMPERATURE_ALARM_TAG: &str = "inletAndOutletTemperatureAlarmStates";
pub const DISCHARGE_ALARM_TAG: &str = "dischargeAlarmStates";

/// A maximal run of strictly consecutive register addresses, read with a
/// single bus operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub start: u16,
    pub count: u16,
}

/// Computes the minimal set of contiguous blocks covering the register
/// map. One bus read is issued per block each cycle.
pub fn read_blocks(map: &[RegisterDef]) -> Vec<Block> {
    let mut blocks: Vec<Block> = Vec::new();

    for def in map {
        match blocks.last_mut() {
            Some(block) if block.start + block.count == def.address => {
                block.count += 1;
            }
            _ => blocks.push(Block { start: def.address, count: 1 }),
        }
    }

    blocks
}

/// Looks up a register definition by address.
pub fn find_by_address(address: u16) -> Option<&'static RegisterDef> {
    REGISTER_MAP.iter().find(|def| def.address == address)
}

/// Looks up a register definition by tag.
pub fn find_by_tag(tag: &str) -> Option<&'static RegisterDef> {
    REGISTER_MAP.iter().find(|def| def.tag == tag)
}

/// One complete scaled reading of every configured register, produced
/// atomically per read cycle. A failed cycle leaves the previous snapshot
/// in place; consumers never see a partially refreshed one.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    values: BTreeMap<&'static str, f64>,
    pub taken_at: u64,
}

impl Snapshot {
    pub fn new(taken_at: u64) -> Self {
        Self { values: BTreeMap::new(), taken_at }
    }

    pub fn insert(&mut self, tag: &'static str, value: f64) {
        self.values.insert(tag, value);
    }

    pub fn get(&self, tag: &str) -> Option<f64> {
        self.values.get(tag).copied()
    }

    /// Raw word view of an unscaled register (alarm bitfields, mode
    /// flags, serial number).
    pub fn word(&self, tag: &str) -> Option<u16> {
        self.get(tag).map(|value| value as u16)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        self.values.iter().map(|(tag, value)| (*tag, *value))
    }

    /// Tag→value map for persistence and SENSOR_DATA_RESPONSE payloads.
    pub fn to_map(&self) -> BTreeMap<String, f64> {
        self.values
            .iter()
            .map(|(tag, value)| ((*tag).to_string(), *value))
            .collect()
    }

    /// Serial number as reported by the controller, if the register has
    /// been read and holds a nonzero value.
    pub fn serial_number(&self) -> Option<String> {
        match self.word(SERIAL_NUMBER_TAG) {
            Some(0) | None => None,
            Some(raw) => Some(raw.to_string()),
        }
    }
}

/// Folds one block's worth of raw words into a snapshot, mapping each
/// word back to its descriptor by offset and applying its scale.
pub fn apply_block(snapshot: &mut Snapshot, block: Block, words: &[u16]) {
    for offset in 0..block.count {
        let address = block.start + offset;
        if let Some(def) = find_by_address(address) {
            let raw = words[offset as usize];
            snapshot.insert(def.tag, (def.scale)(raw));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_unique() {
        for (i, a) in REGISTER_MAP.iter().enumerate() {
            for b in &REGISTER_MAP[i + 1..] {
                assert_ne!(a.tag, b.tag, "duplicate tag {}", a.tag);
            }
        }
    }

    #[test]
    fn test_map_sorted_by_address() {
        for pair in REGISTER_MAP.windows(2) {
            assert!(pair[0].address < pair[1].address);
        }
    }

    #[test]
    fn test_block_construction_is_minimal() {
        let blocks = read_blocks(REGISTER_MAP);
        assert_eq!(
            blocks,
            vec![
                Block { start: 0, count: 2 },
                Block { start: 4, count: 2 },
                Block { start: 8, count: 8 },
                Block { start: 17, count: 9 },
                Block { start: 100, count: 6 },
                Block { start: 149, count: 1 },
                Block { start: 199, count: 1 },
            ]
        );

        // Every configured register is covered exactly once.
        let covered: usize = blocks.iter().map(|b| {
            (b.start..b.start + b.count)
                .filter(|addr| find_by_address(*addr).is_some())
                .count()
        }).sum();
        assert_eq!(covered, REGISTER_MAP.len());
    }

    #[test]
    fn test_scaling_applied_per_tag() {
        let mut snapshot = Snapshot::new(0);
        apply_block(&mut snapshot, Block { start: 0, count: 2 }, &[1234, 5678]);
        apply_block(&mut snapshot, Block { start: 8, count: 8 }, &[2150, 880, 910, 3, 1, 2, 0, 1]);

        assert_eq!(snapshot.get("inletMoisture"), Some(12.34));
        assert_eq!(snapshot.get("outletMoistureAverage"), Some(56.78));
        assert_eq!(snapshot.get("airPlenumTemperature"), Some(21.50));
        assert_eq!(snapshot.word("notReadyReason"), Some(3));
        assert_eq!(snapshot.word("aliveBit"), Some(1));
    }

    #[test]
    fn test_serial_number_fallback_on_zero() {
        let mut snapshot = Snapshot::new(0);
        snapshot.insert(SERIAL_NUMBER_TAG, 0.0);
        assert_eq!(snapshot.serial_number(), None);

        snapshot.insert(SERIAL_NUMBER_TAG, 7341.0);
        assert_eq!(snapshot.serial_number(), Some("7341".to_string()));
    }
}
