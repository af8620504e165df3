mod common;

use bms_core::soc::SocReset;
use bms_core::BmsState;
use common::{bms, close, run_seconds, MockAfe};
use embassy_futures::block_on;

fn ramp() -> MockAfe {
    let mut afe = MockAfe::new();
    afe.cells = [3.0, 3.1, 3.2, 3.3, 3.4, 3.5, 3.6, 3.7];
    afe
}

#[test]
fn cell_statistics_after_tick() {
    let mut bms = bms(ramp());
    block_on(bms.tick(1000));

    let status = bms.status();
    assert_eq!(status.connected_cells, 8);
    assert!(close(status.cell_voltage_min, 3.0));
    assert!(close(status.cell_voltage_max, 3.7));
    assert!(close(status.cell_voltage_avg, 3.35));
    assert!(close(status.pack_voltage, 26.8));
    assert_eq!(status.num_thermistors, 2);
    assert_eq!(status.ic_temp, 30.0);
}

#[test]
fn balancing_waits_for_idle_pack() {
    let mut bms = bms(ramp());
    bms.config_mut().bal_idle_delay_s = 10;
    bms.config_mut().bal_cell_voltage_min = 3.3;

    run_seconds(&mut bms, 1, 9);
    assert!(bms.afe().balancing.is_empty());
    assert_eq!(bms.status().balancing_status, 0);

    block_on(bms.tick(10_000));
    assert_eq!(bms.status().balancing_status, 0b1011_0100);
    assert_eq!(bms.afe().balancing, [(0, 0b1_0100), (1, 0b101)]);

    // unchanged bitmap, nothing written
    run_seconds(&mut bms, 11, 15);
    assert_eq!(bms.afe().balancing.len(), 2);

    // load restarts the idle timer and switches balancing off
    bms.afe_mut().current_ma = -2000;
    block_on(bms.tick(16_000));
    assert_eq!(bms.status().balancing_status, 0);
    assert_eq!(bms.afe().balancing[2..], [(0, 0), (1, 0)]);
}

#[test]
fn backwards_clock_restarts_idle_timer() {
    let mut bms = bms(ramp());
    bms.config_mut().bal_idle_delay_s = 10;
    bms.config_mut().bal_cell_voltage_min = 3.3;

    bms.afe_mut().current_ma = -2000;
    block_on(bms.tick(100_000));
    assert_eq!(bms.status().no_idle_timestamp_ms, 100_000);

    // uptime counter wrapped, the timestamp lies in the future
    block_on(bms.balance(50_000)).unwrap();
    assert_eq!(bms.status().no_idle_timestamp_ms, 50_000);
    assert_eq!(bms.status().balancing_status, 0);

    block_on(bms.balance(59_000)).unwrap();
    assert_eq!(bms.status().balancing_status, 0);
    assert!(bms.afe().balancing.is_empty());

    block_on(bms.balance(60_000)).unwrap();
    assert_eq!(bms.status().balancing_status, 0b1011_0100);
}

#[test]
fn balancing_can_be_disabled() {
    let mut bms = bms(ramp());
    bms.config_mut().bal_idle_delay_s = 0;
    bms.config_mut().bal_cell_voltage_min = 3.3;
    bms.config_mut().auto_balancing_enabled = false;

    run_seconds(&mut bms, 1, 5);
    assert!(bms.afe().balancing.is_empty());
}

#[test]
fn failed_balancing_write_switches_off() {
    let mut bms = bms(ramp());
    bms.config_mut().bal_idle_delay_s = 0;
    bms.config_mut().bal_cell_voltage_min = 3.3;
    bms.afe_mut().fail_writes = true;

    block_on(bms.tick(1000));
    assert_eq!(bms.status().balancing_status, 0);
    assert!(bms.afe().balancing.is_empty());

    bms.afe_mut().fail_writes = false;
    block_on(bms.tick(2000));
    assert_eq!(bms.status().balancing_status, 0b1011_0100);
}

#[test]
fn soc_initialized_from_cell_voltage() {
    let mut bms = bms(MockAfe::new());
    block_on(bms.init(0)).unwrap();

    // 3.7 V sits between the 10 % and 15 % points of the NMC curve
    let soc = bms.status().soc;
    assert!(soc > 10.0 && soc < 15.0, "soc = {}", soc);
}

#[test]
fn soc_follows_charge_current() {
    let mut bms = bms(MockAfe::new());
    block_on(bms.init(0)).unwrap();
    bms.soc_reset(SocReset::Percent(50.0));

    // 1C charging, 36 s are 1 %
    bms.afe_mut().current_ma = 10_000;
    run_seconds(&mut bms, 1, 37);
    assert!(close(bms.status().soc, 51.0), "soc = {}", bms.status().soc);
    assert_eq!(bms.status().state, BmsState::Normal);

    bms.soc_reset(SocReset::Percent(100.0));
    run_seconds(&mut bms, 38, 80);
    assert_eq!(bms.status().soc, 100.0);
}

#[test]
fn current_samples_are_counted_once() {
    let mut bms = bms(MockAfe::new());
    bms.soc_reset(SocReset::Percent(50.0));
    bms.afe_mut().current_ma = -10_000;

    block_on(bms.sample_current(0)).unwrap();
    for s in 1..=36 {
        block_on(bms.sample_current(s * 1000)).unwrap();
    }
    assert!(close(bms.status().soc, 49.0), "soc = {}", bms.status().soc);

    // a tick right after the last sample adds nothing
    block_on(bms.tick(36_000));
    assert!(close(bms.status().soc, 49.0));
}
