use std::collections::BTreeMap;

use heapless::Vec as BoundedVec;
use tracing::{debug, info};

use crate::registers::{
    Snapshot, DISCHARGE_ALARM_TAG, MOISTURE_ALARM_TAG, TEMPERATURE_ALARM_TAG,
};

use super::{AlarmId, AlarmRegistry, AlarmStage};

/// At most four stage bits exist per alarm in any status register.
pub type StageVec = BoundedVec<AlarmStage, 4>;

/// Decoded stage bits for every alarm with at least one bit set.
pub type ActiveStages = BTreeMap<AlarmId, StageVec>;

fn push_if_set(stages: &mut StageVec, raw: u16, bit: u8, stage: AlarmStage) {
    if (raw >> bit) & 1 == 1 {
        // Capacity equals the number of probed bits, so this cannot fail.
        let _ = stages.push(stage);
    }
}

/// Decodes a moisture or temperature alarm register: bits 7-4 carry the
/// outlet-side stage code, bits 3-0 the inlet-side stage code.
pub fn decode_paired_register(raw: u16) -> (StageVec, StageVec) {
    let mut outlet = StageVec::new();
    push_if_set(&mut outlet, raw, 7, AlarmStage::Chi);
    push_if_set(&mut outlet, raw, 6, AlarmStage::Clo);
    push_if_set(&mut outlet, raw, 5, AlarmStage::Whi);
    push_if_set(&mut outlet, raw, 4, AlarmStage::Wlo);

    let mut inlet = StageVec::new();
    push_if_set(&mut inlet, raw, 3, AlarmStage::Chi);
    push_if_set(&mut inlet, raw, 2, AlarmStage::Clo);
    push_if_set(&mut inlet, raw, 1, AlarmStage::Whi);
    push_if_set(&mut inlet, raw, 0, AlarmStage::Wlo);

    (outlet, inlet)
}

/// Decodes the combined discharge/burner register: bits 8-5 carry the
/// burner stage code (including the dryer-off condition), bits 4-1 the
/// discharge-rate stage code.
pub fn decode_discharge_register(raw: u16) -> (StageVec, StageVec) {
    let mut burner = StageVec::new();
    push_if_set(&mut burner, raw, 8, AlarmStage::Chi);
    push_if_set(&mut burner, raw, 7, AlarmStage::Clo);
    push_if_set(&mut burner, raw, 6, AlarmStage::Wlo);
    push_if_set(&mut burner, raw, 5, AlarmStage::DryerOff);

    let mut discharge = StageVec::new();
    push_if_set(&mut discharge, raw, 4, AlarmStage::Chi);
    push_if_set(&mut discharge, raw, 3, AlarmStage::Clo);
    push_if_set(&mut discharge, raw, 2, AlarmStage::Whi);
    push_if_set(&mut discharge, raw, 1, AlarmStage::Wlo);

    (burner, discharge)
}

/// Extracts the currently signalled stages for every alarm out of the
/// latest register snapshot.
pub fn active_stages(snapshot: &Snapshot) -> ActiveStages {
    let mut stages = ActiveStages::new();
    let mut record = |id: AlarmId, decoded: StageVec| {
        if !decoded.is_empty() {
            stages.insert(id, decoded);
        }
    };

    if let Some(raw) = snapshot.word(MOISTURE_ALARM_TAG) {
        let (outlet, inlet) = decode_paired_register(raw);
        record(AlarmId::OutletMoisture, outlet);
        record(AlarmId::InletMoisture, inlet);
    }

    if let Some(raw) = snapshot.word(TEMPERATURE_ALARM_TAG) {
        let (outlet, inlet) = decode_paired_register(raw);
        record(AlarmId::OutletTemperature, outlet);
        record(AlarmId::InletTemperature, inlet);
    }

    if let Some(raw) = snapshot.word(DISCHARGE_ALARM_TAG) {
        let (burner, discharge) = decode_discharge_register(raw);
        record(AlarmId::BurnerTemperature, burner);
        record(AlarmId::DischargeRate, discharge);
    }

    stages
}

/// One decode cycle: folds the snapshot's alarm bits into the registry.
///
/// A decoded stage only activates an alarm once more than the alarm's
/// debounce interval has elapsed since it last activated, suppressing
/// transient bus noise. An alarm with no decoded stage deactivates
/// immediately. `last_checked` advances every cycle regardless.
pub fn run_decode(registry: &mut AlarmRegistry, snapshot: &Snapshot, now: u64) {
    let signalled = active_stages(snapshot);

    for (id, entity) in registry.iter_mut() {
        entity.last_checked = now;

        match signalled.get(&id) {
            Some(stages) => {
                for stage in stages {
                    if now.saturating_sub(entity.last_active) > entity.debounce_ms {
                        entity.active = true;
                        entity.last_active = now;
                        entity.stage = Some(*stage);
                        info!(
                            alarm = id.as_str(),
                            stage = ?stage,
                            "alarm activated"
                        );
                    }
                }
            }
            None => {
                if entity.active {
                    entity.active = false;
                    entity.last_deactivated = now;
                    info!(alarm = id.as_str(), "alarm deactivated");
                } else {
                    debug!(alarm = id.as_str(), "alarm idle");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarms::AlarmPolicy;
    use crate::registers::Snapshot;

    fn snapshot_with(tag: &'static str, raw: u16) -> Snapshot {
        let mut snapshot = Snapshot::new(0);
        snapshot.insert(tag, f64::from(raw));
        snapshot
    }

    #[test]
    fn test_outlet_critical_high_bit() {
        let (outlet, inlet) = decode_paired_register(0b1000_0000);
        assert_eq!(outlet.as_slice(), &[AlarmStage::Chi]);
        assert!(inlet.is_empty());
    }

    #[test]
    fn test_inlet_warning_low_bit() {
        let (outlet, inlet) = decode_paired_register(0b0000_0001);
        assert!(outlet.is_empty());
        assert_eq!(inlet.as_slice(), &[AlarmStage::Wlo]);
    }

    #[test]
    fn test_both_sides_decoded_independently() {
        let (outlet, inlet) = decode_paired_register(0b0101_1010);
        assert_eq!(outlet.as_slice(), &[AlarmStage::Clo, AlarmStage::Wlo]);
        assert_eq!(inlet.as_slice(), &[AlarmStage::Chi, AlarmStage::Whi]);
    }

    #[test]
    fn test_burner_dryer_off_bit() {
        let (burner, discharge) = decode_discharge_register(0b0_0010_0000);
        assert_eq!(burner.as_slice(), &[AlarmStage::DryerOff]);
        assert!(discharge.is_empty());
    }

    #[test]
    fn test_discharge_bits_shifted_by_one() {
        let (burner, discharge) = decode_discharge_register(0b0_0001_0010);
        assert!(burner.is_empty());
        assert_eq!(discharge.as_slice(), &[AlarmStage::Chi, AlarmStage::Wlo]);
    }

    #[test]
    fn test_zero_register_yields_no_stages() {
        let snapshot = snapshot_with(MOISTURE_ALARM_TAG, 0);
        assert!(active_stages(&snapshot).is_empty());
    }

    #[test]
    fn test_moisture_register_maps_to_moisture_alarms() {
        let snapshot = snapshot_with(MOISTURE_ALARM_TAG, 0b1000_0000);
        let stages = active_stages(&snapshot);
        assert_eq!(stages.len(), 1);
        assert_eq!(
            stages[&AlarmId::OutletMoisture].as_slice(),
            &[AlarmStage::Chi]
        );
    }

    #[test]
    fn test_decode_respects_debounce() {
        let policy = AlarmPolicy::default();
        let mut registry = AlarmRegistry::new(&policy);
        let snapshot = snapshot_with(TEMPERATURE_ALARM_TAG, 0b0000_1000);

        // First sighting at t=6s is past the (epoch) debounce window.
        run_decode(&mut registry, &snapshot, 6_000);
        let entity = registry.get(AlarmId::InletTemperature);
        assert!(entity.active);
        assert_eq!(entity.stage, Some(AlarmStage::Chi));
        assert_eq!(entity.last_active, 6_000);

        // Within the debounce window nothing refreshes.
        run_decode(&mut registry, &snapshot, 9_000);
        assert_eq!(registry.get(AlarmId::InletTemperature).last_active, 6_000);

        // Past the window the activation timestamp advances.
        run_decode(&mut registry, &snapshot, 12_000);
        assert_eq!(registry.get(AlarmId::InletTemperature).last_active, 12_000);
    }

    #[test]
    fn test_decode_deactivates_on_clear_register() {
        let policy = AlarmPolicy::default();
        let mut registry = AlarmRegistry::new(&policy);

        run_decode(&mut registry, &snapshot_with(DISCHARGE_ALARM_TAG, 0b1_0000_0000), 6_000);
        assert!(registry.get(AlarmId::BurnerTemperature).active);

        run_decode(&mut registry, &snapshot_with(DISCHARGE_ALARM_TAG, 0), 9_000);
        let entity = registry.get(AlarmId::BurnerTemperature);
        assert!(!entity.active);
        assert_eq!(entity.last_deactivated, 9_000);
        assert_eq!(entity.last_checked, 9_000);
    }
}
