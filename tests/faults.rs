mod common;

use bms_core::afe::Switch;
use bms_core::faults::FaultState;
use bms_core::{AlertFlags, BmsState, ErrorFlags, FaultKind};
use common::{bms, run_seconds, MockAfe};
use embassy_futures::block_on;

#[test]
fn persistent_short_circuit_is_retried_once_a_minute() {
    let mut afe = MockAfe::new();
    afe.trip(ErrorFlags::SHORT_CIRCUIT);
    afe.sticky = ErrorFlags::SHORT_CIRCUIT;
    let mut bms = bms(afe);

    let mut clear_times = Vec::new();
    for s in 1..=200 {
        let before = bms.afe().clears.len();
        block_on(bms.tick(s * 1000));
        if bms.afe().clears.len() > before {
            clear_times.push(s);
        }
        assert!(bms.status().error_flags.contains(ErrorFlags::SHORT_CIRCUIT));
    }

    assert_eq!(clear_times, [61, 122, 183]);
    assert!(bms
        .afe()
        .clears
        .iter()
        .all(|c| *c == (ErrorFlags::SHORT_CIRCUIT, AlertFlags::empty())));

    // charging is still possible
    assert_eq!(bms.status().state, BmsState::Chg);
}

#[test]
fn failed_clear_is_retried_in_next_window() {
    let mut afe = MockAfe::new();
    afe.trip(ErrorFlags::SHORT_CIRCUIT);
    let mut bms = bms(afe);

    run_seconds(&mut bms, 1, 60);
    assert!(bms.afe().clears.is_empty());

    bms.afe_mut().fail_writes = true;
    block_on(bms.tick(61_000));
    bms.afe_mut().fail_writes = false;

    // never assumed cleared after an I/O error
    assert_eq!(bms.fault_state(FaultKind::ShortCircuit), FaultState::Confirmed);
    assert!(bms.afe().clears.is_empty());

    run_seconds(&mut bms, 62, 120);
    assert!(bms.afe().clears.is_empty());
    assert!(bms.status().error_flags.contains(ErrorFlags::SHORT_CIRCUIT));

    block_on(bms.tick(121_000));
    assert_eq!(
        bms.afe().clears,
        [(ErrorFlags::SHORT_CIRCUIT, AlertFlags::empty())]
    );

    block_on(bms.tick(122_000));
    assert_eq!(bms.fault_state(FaultKind::ShortCircuit), FaultState::Clear);
    assert!(bms.status().error_flags.is_empty());
}

#[test]
fn undervoltage_waits_for_reset_voltage() {
    let mut afe = MockAfe::new();
    afe.cells = [2.9; 8];
    afe.trip(ErrorFlags::CELL_UNDERVOLTAGE);
    let mut bms = bms(afe);

    run_seconds(&mut bms, 1, 5);
    assert_eq!(bms.fault_state(FaultKind::CellUndervoltage), FaultState::Confirmed);
    assert!(bms.status().empty);

    // above the limit, but not yet above the reset voltage
    bms.afe_mut().cells = [3.2; 8];
    run_seconds(&mut bms, 6, 10);
    assert!(bms.afe().clears.is_empty());
    assert!(bms.status().error_flags.contains(ErrorFlags::CELL_UNDERVOLTAGE));

    bms.afe_mut().cells = [3.6; 8];
    block_on(bms.tick(11_000));
    assert_eq!(
        bms.afe().clears,
        [(ErrorFlags::CELL_UNDERVOLTAGE, AlertFlags::empty())]
    );
    assert_eq!(bms.fault_state(FaultKind::CellUndervoltage), FaultState::Clearing);

    block_on(bms.tick(12_000));
    assert_eq!(bms.fault_state(FaultKind::CellUndervoltage), FaultState::Clear);
    assert!(!bms.status().empty);
    assert!(bms.status().dis_allowed());
}

#[test]
fn software_temperature_fault_with_hysteresis() {
    let mut afe = MockAfe::new();
    afe.temps = vec![50.0, 30.0];
    let mut bms = bms(afe);

    // seen once, not yet visible
    block_on(bms.tick(1000));
    assert_eq!(bms.fault_state(FaultKind::ChgOvertemp), FaultState::Suspected);
    assert!(bms.status().error_flags.is_empty());

    block_on(bms.tick(2000));
    let both = ErrorFlags::CHG_OVERTEMP | ErrorFlags::DIS_OVERTEMP;
    assert!(bms.status().error_flags.contains(both));
    assert!(!bms.status().chg_allowed());
    assert!(!bms.status().dis_allowed());

    // below the limit but inside the hysteresis band
    bms.afe_mut().temps = vec![42.0, 30.0];
    run_seconds(&mut bms, 3, 5);
    assert!(bms.status().error_flags.contains(both));

    bms.afe_mut().temps = vec![39.0, 30.0];
    run_seconds(&mut bms, 6, 7);
    assert!(bms.status().error_flags.is_empty());
    assert_eq!(bms.fault_state(FaultKind::ChgOvertemp), FaultState::Clear);

    // nothing to clear in the chip for software faults
    assert!(bms.afe().clears.is_empty());
}

#[test]
fn short_overcurrent_spike_is_ignored() {
    let mut bms = bms(MockAfe::new());

    // charge over-current is debounced in software
    bms.afe_mut().current_ma = 15_000;
    block_on(bms.tick(1000));
    assert_eq!(bms.fault_state(FaultKind::ChgOvercurrent), FaultState::Suspected);

    bms.afe_mut().current_ma = 1_000;
    block_on(bms.tick(2000));
    assert_eq!(bms.fault_state(FaultKind::ChgOvercurrent), FaultState::Clear);
    assert!(bms.status().error_flags.is_empty());

    bms.afe_mut().current_ma = 15_000;
    run_seconds(&mut bms, 3, 4);
    assert!(bms.status().error_flags.contains(ErrorFlags::CHG_OVERCURRENT));
}

#[test]
fn not_ready_alert_restores_switches() {
    let mut bms = bms(MockAfe::new());
    run_seconds(&mut bms, 1, 2);
    assert_eq!(bms.status().state, BmsState::Normal);

    // the chip drops both FETs
    let afe = bms.afe_mut();
    afe.alerts = AlertFlags::DEVICE_NOT_READY;
    afe.chg_fet = false;
    afe.dis_fet = false;

    run_seconds(&mut bms, 3, 5);
    assert_eq!(bms.status().alerts, AlertFlags::DEVICE_NOT_READY);
    // FETs opened by the chip are not a switch failure
    assert!(bms.status().error_flags.is_empty());
    assert!(bms.afe().clears.is_empty());

    // retried 3 s after it was first seen
    block_on(bms.tick(6000));
    assert_eq!(
        bms.afe().clears,
        [(ErrorFlags::empty(), AlertFlags::DEVICE_NOT_READY)]
    );
    assert_eq!(
        bms.afe().switches[2..],
        [(Switch::Discharge, true), (Switch::Charge, true)]
    );

    run_seconds(&mut bms, 7, 8);
    assert!(bms.status().alerts.is_empty());
    assert!(bms.status().error_flags.is_empty());
    assert_eq!(bms.status().state, BmsState::Normal);
}

#[test]
fn stale_values_and_unresponsive_afe() {
    let mut bms = bms(MockAfe::new());
    run_seconds(&mut bms, 1, 2);

    bms.afe_mut().cells = [3.9; 8];
    bms.afe_mut().fail_reads = true;

    for s in 3..=6 {
        block_on(bms.tick(s * 1000));
        assert!(!bms.status().afe_unresponsive);
    }
    block_on(bms.tick(7000));
    assert!(bms.status().afe_unresponsive);

    // last good reading is kept
    assert!(common::close(bms.status().cell_voltage_max, 3.7));
    assert_eq!(bms.status().state, BmsState::Normal);

    bms.afe_mut().fail_reads = false;
    block_on(bms.tick(8000));
    assert!(!bms.status().afe_unresponsive);
    assert!(common::close(bms.status().cell_voltage_max, 3.9));
}

#[test]
fn error_timestamp_follows_faults() {
    let mut afe = MockAfe::new();
    afe.trip(ErrorFlags::OPEN_WIRE);
    let mut bms = bms(afe);

    run_seconds(&mut bms, 1, 11);
    assert_eq!(bms.status().no_error_since_ms, 11_000);

    run_seconds(&mut bms, 12, 20);
    assert_eq!(bms.status().no_error_since_ms, 11_000);
}
