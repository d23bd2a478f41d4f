use dryerlink::alarms::{
    apply_ack, run_decode, run_delivery, AckOutcome, AlarmId, AlarmPolicy, AlarmRegistry,
    AlarmStage, DeliveryState,
};
use dryerlink::registers::{Snapshot, MOISTURE_ALARM_TAG};

fn moisture_snapshot(raw: u16) -> Snapshot {
    let mut snapshot = Snapshot::new(0);
    snapshot.insert(MOISTURE_ALARM_TAG, f64::from(raw));
    snapshot
}

#[test]
fn test_outlet_chi_bit_activates_only_outlet_moisture() {
    let policy = AlarmPolicy::default();
    let mut registry = AlarmRegistry::new(&policy);

    run_decode(&mut registry, &moisture_snapshot(0b1000_0000), 10_000);

    let outlet = registry.get(AlarmId::OutletMoisture);
    assert!(outlet.active);
    assert_eq!(outlet.stage, Some(AlarmStage::Chi));
    assert!(!registry.get(AlarmId::InletMoisture).active);
    for id in [
        AlarmId::InletTemperature,
        AlarmId::OutletTemperature,
        AlarmId::BurnerTemperature,
        AlarmId::DischargeRate,
    ] {
        assert!(!registry.get(id).active);
    }
}

#[test]
fn test_activation_through_autoack_lifecycle() {
    let policy = AlarmPolicy::default();
    let mut registry = AlarmRegistry::new(&policy);
    let snapshot = moisture_snapshot(0b1000_0000);

    // Activation past the debounce window.
    run_decode(&mut registry, &snapshot, 10_000);
    assert_eq!(
        registry.get(AlarmId::OutletMoisture).delivery_state(),
        DeliveryState::ActivePending
    );

    // Three unanswered sends, spaced past the resend interval.
    let mut now = 10_500;
    let mut sent = 0;
    while sent < 3 {
        let due = run_delivery(&mut registry, now, &policy);
        sent += due.len();
        for trigger in &due {
            assert_eq!(trigger.alarm, AlarmId::OutletMoisture);
            assert_eq!(trigger.stage, Some(AlarmStage::Chi));
        }
        now += policy.resend_interval_ms + 500;
    }

    // The next eligible cycle auto-resolves the activation.
    assert!(run_delivery(&mut registry, now, &policy).is_empty());
    let entity = registry.get(AlarmId::OutletMoisture);
    assert!(entity.auto_ack);
    assert_eq!(entity.sent_retries, 0);
    assert_eq!(entity.delivery_state(), DeliveryState::ActiveAutoAcked);

    // No resend until the alarm deactivates and reactivates.
    now += policy.resend_interval_ms + 500;
    assert!(run_delivery(&mut registry, now, &policy).is_empty());

    run_decode(&mut registry, &moisture_snapshot(0), now);
    run_delivery(&mut registry, now + 100, &policy);

    let reactivate_at = now + policy.debounce_ms + 1_000;
    run_decode(&mut registry, &snapshot, reactivate_at);
    let due = run_delivery(&mut registry, reactivate_at + 100, &policy);
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].timestamp, reactivate_at);
}

#[test]
fn test_ack_matches_current_activation_only() {
    let policy = AlarmPolicy::default();
    let mut registry = AlarmRegistry::new(&policy);
    let snapshot = moisture_snapshot(0b0000_1000);

    run_decode(&mut registry, &snapshot, 10_000);
    let due = run_delivery(&mut registry, 10_100, &policy);
    assert_eq!(due.len(), 1);
    let trigger = due[0];
    assert_eq!(trigger.alarm, AlarmId::InletMoisture);

    // An acknowledgment carrying an old activation time changes nothing.
    assert_eq!(
        apply_ack(&mut registry, AlarmId::InletMoisture, trigger.timestamp - 1),
        AckOutcome::StaleTimestamp
    );
    assert!(!registry.get(AlarmId::InletMoisture).server_ack);

    // The echo of the trigger's own timestamp lands.
    assert_eq!(
        apply_ack(&mut registry, AlarmId::InletMoisture, trigger.timestamp),
        AckOutcome::Applied
    );
    assert_eq!(
        registry.get(AlarmId::InletMoisture).delivery_state(),
        DeliveryState::ActiveAcked
    );
    assert!(run_delivery(&mut registry, 20_000, &policy).is_empty());
}

#[test]
fn test_decode_and_delivery_cadences_stay_independent() {
    let policy = AlarmPolicy::default();
    let mut registry = AlarmRegistry::new(&policy);
    let snapshot = moisture_snapshot(0b1000_0000);

    run_decode(&mut registry, &snapshot, 10_000);
    assert_eq!(run_delivery(&mut registry, 10_100, &policy).len(), 1);

    // Repeated decode ticks must not disturb delivery bookkeeping.
    run_decode(&mut registry, &snapshot, 13_000);
    run_decode(&mut registry, &snapshot, 16_000);
    let entity = registry.get(AlarmId::OutletMoisture);
    assert_eq!(entity.sent_retries, 1);
    assert!(!entity.server_ack);
    assert!(!entity.auto_ack);
}
