//! Fault detection and automatic recovery
//!
//! Every fault kind runs through `Clear -> Suspected -> Confirmed -> Clearing -> Clear`.
//! Faults the AFE detects itself are already debounced by the chip and confirm
//! right away, faults evaluated in software have to persist for the configured
//! delay first. Confirmed faults are retried on a fixed per-kind cadence.

use crate::afe::{Afe, RawStatus, Switch};
use crate::config::BmsConfig;
#[cfg(feature = "defmt")]
use crate::fmt::*;
use crate::status::{AlertFlags, BmsStatus, ErrorFlags, FaultKind};

/// Retry cadence of a "device not ready" alert (s)
pub const NOT_READY_RETRY_S: u64 = 3;
/// Retry cadence of an override alert (s)
pub const OVERRIDE_RETRY_S: u64 = 10;

const ALERTS: [AlertFlags; 2] = [AlertFlags::DEVICE_NOT_READY, AlertFlags::OVERRIDE_ALERT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FaultState {
    Clear,
    /// Condition seen, waiting for it to persist. Not visible in the error flags.
    Suspected,
    Confirmed,
    /// Clear attempted, waiting for the next reading to confirm it
    Clearing,
}

impl FaultState {
    /// Whether the fault shows up in the status flags
    pub fn flagged(self) -> bool {
        matches!(self, FaultState::Confirmed | FaultState::Clearing)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Recovery {
    /// Clear only once the measurement is back behind the reset threshold
    Threshold,
    /// Clear blindly and see whether the condition comes back
    Retry,
}

fn policy(kind: FaultKind) -> (u64, Recovery) {
    match kind {
        FaultKind::CellUndervoltage
        | FaultKind::CellOvervoltage
        | FaultKind::DisUndertemp
        | FaultKind::DisOvertemp
        | FaultKind::ChgUndertemp
        | FaultKind::ChgOvertemp
        | FaultKind::DisSwitchStuckOff
        | FaultKind::ChgSwitchStuckOn => (1, Recovery::Threshold),
        FaultKind::ShortCircuit | FaultKind::DisOvercurrent | FaultKind::ChgOvercurrent => {
            (60, Recovery::Retry)
        }
        FaultKind::OpenWire
        | FaultKind::CellFailure
        | FaultKind::IntOvertemp
        | FaultKind::FetOvertemp => (10, Recovery::Retry),
    }
}

/// Time a software-evaluated condition has to persist before it is confirmed (ms)
fn debounce_ms(kind: FaultKind, config: &BmsConfig) -> u64 {
    match kind {
        FaultKind::CellUndervoltage => config.cell_uv_delay_ms as u64,
        FaultKind::CellOvervoltage => config.cell_ov_delay_ms as u64,
        FaultKind::DisOvercurrent => config.dis_oc_delay_ms as u64,
        FaultKind::ChgOvercurrent => config.chg_oc_delay_ms as u64,
        _ => 0,
    }
}

/// Result of comparing the measurements against a fault's limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Check {
    /// The trip threshold is exceeded
    pub tripped: bool,
    /// The reset threshold is satisfied
    pub recovered: bool,
}

impl Check {
    fn plain(tripped: bool) -> Self {
        Self {
            tripped,
            recovered: !tripped,
        }
    }
}

/// Evaluates a fault from the measurements. Returns `None` for faults that can
/// only be detected by the chip.
pub fn software_check<const N: usize>(
    kind: FaultKind,
    config: &BmsConfig,
    status: &BmsStatus<N>,
    raw: &RawStatus,
) -> Option<Check> {
    let cells = status.connected_cells > 0;
    let temps = status.num_thermistors > 0;
    let hyst = config.t_limit_hyst;
    // the chip opens the FETs itself while an alert is pending
    let switches_owned = raw.alerts.is_empty();

    let check = match kind {
        FaultKind::CellUndervoltage => Check {
            tripped: cells && status.cell_voltage_min < config.cell_uv_limit,
            recovered: !cells || status.cell_voltage_min > config.cell_uv_reset,
        },
        FaultKind::CellOvervoltage => Check {
            tripped: cells && status.cell_voltage_max > config.cell_ov_limit,
            recovered: !cells || status.cell_voltage_max < config.cell_ov_reset,
        },
        FaultKind::DisOvercurrent => Check::plain(status.pack_current < -config.dis_oc_limit),
        FaultKind::ChgOvercurrent => Check::plain(status.pack_current > config.chg_oc_limit),
        FaultKind::DisOvertemp => Check {
            tripped: temps && status.bat_temp_max > config.dis_ot_limit,
            recovered: !temps || status.bat_temp_max < config.dis_ot_limit - hyst,
        },
        FaultKind::DisUndertemp => Check {
            tripped: temps && status.bat_temp_min < config.dis_ut_limit,
            recovered: !temps || status.bat_temp_min > config.dis_ut_limit + hyst,
        },
        FaultKind::ChgOvertemp => Check {
            tripped: temps && status.bat_temp_max > config.chg_ot_limit,
            recovered: !temps || status.bat_temp_max < config.chg_ot_limit - hyst,
        },
        FaultKind::ChgUndertemp => Check {
            tripped: temps && status.bat_temp_min < config.chg_ut_limit,
            recovered: !temps || status.bat_temp_min > config.chg_ut_limit + hyst,
        },
        FaultKind::DisSwitchStuckOff => {
            Check::plain(switches_owned && status.state.discharging() && !raw.dis_fet)
        }
        FaultKind::ChgSwitchStuckOn => {
            Check::plain(switches_owned && !status.state.charging() && raw.chg_fet)
        }
        FaultKind::ShortCircuit
        | FaultKind::OpenWire
        | FaultKind::IntOvertemp
        | FaultKind::CellFailure
        | FaultKind::FetOvertemp => return None,
    };

    Some(check)
}

#[derive(Debug, Clone, Copy)]
struct Tracker {
    state: FaultState,
    /// When the fault was (last) confirmed or first suspected
    since_ms: u64,
    /// Last retry window a recovery was attempted in
    last_window: u64,
}

impl Tracker {
    const fn new() -> Self {
        Self {
            state: FaultState::Clear,
            since_ms: 0,
            last_window: 0,
        }
    }

    fn suspect(&mut self, now_ms: u64) {
        self.state = FaultState::Suspected;
        self.since_ms = now_ms;
    }

    fn confirm(&mut self, now_ms: u64) {
        self.state = FaultState::Confirmed;
        self.since_ms = now_ms;
        self.last_window = 0;
    }

    /// True once per completed retry window since confirmation. Second 0 is never due.
    fn retry_due(&mut self, modulus_s: u64, now_ms: u64) -> bool {
        let elapsed_s = now_ms.saturating_sub(self.since_ms) / 1000;
        let window = elapsed_s / modulus_s.max(1);

        if window > self.last_window {
            self.last_window = window;
            true
        } else {
            false
        }
    }
}

/// Per-pack fault bookkeeping
pub struct FaultManager {
    faults: [Tracker; FaultKind::COUNT],
    alerts: [Tracker; ALERTS.len()],
}

impl Default for FaultManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FaultManager {
    pub const fn new() -> Self {
        Self {
            faults: [Tracker::new(); FaultKind::COUNT],
            alerts: [Tracker::new(); ALERTS.len()],
        }
    }

    pub fn state(&self, kind: FaultKind) -> FaultState {
        self.faults[kind as usize].state
    }

    /// Visible fault flags
    pub fn flags(&self) -> ErrorFlags {
        FaultKind::ALL
            .iter()
            .filter(|kind| self.state(**kind).flagged())
            .fold(ErrorFlags::empty(), |acc, kind| acc | kind.flag())
    }

    /// Visible alert flags
    pub fn alerts(&self) -> AlertFlags {
        ALERTS
            .iter()
            .zip(self.alerts.iter())
            .filter(|(_, tracker)| tracker.state.flagged())
            .fold(AlertFlags::empty(), |acc, (alert, _)| acc | *alert)
    }

    /// Runs all fault state machines against the latest measurements and chip
    /// status, then publishes the flags into `status`.
    ///
    /// Failed clear attempts are logged and retried in the next window.
    pub async fn run<A, const N: usize>(
        &mut self,
        afe: &mut A,
        config: &BmsConfig,
        status: &mut BmsStatus<N>,
        raw: &RawStatus,
        now_ms: u64,
    ) where
        A: Afe<N>,
    {
        let hardware = afe.hardware_faults();

        for kind in FaultKind::ALL {
            let in_hardware = hardware.contains(kind.flag());
            let check = software_check(kind, config, status, raw);
            let tracker = &mut self.faults[kind as usize];

            let observed = if in_hardware {
                raw.faults.contains(kind.flag())
            } else {
                match check {
                    // hysteresis: once flagged the reset threshold decides
                    Some(c) if tracker.state.flagged() => !c.recovered,
                    Some(c) => c.tripped,
                    None => continue,
                }
            };

            match tracker.state {
                FaultState::Clear => {
                    if observed && in_hardware {
                        warn!("{:?} reported by AFE", kind);
                        tracker.confirm(now_ms);
                    } else if observed {
                        tracker.suspect(now_ms);
                    }
                }
                FaultState::Suspected => {
                    if !observed {
                        tracker.state = FaultState::Clear;
                    } else if now_ms.saturating_sub(tracker.since_ms) >= debounce_ms(kind, config) {
                        warn!("{:?} detected", kind);
                        tracker.confirm(now_ms);
                    }
                }
                FaultState::Confirmed => {
                    let (modulus, recovery) = policy(kind);
                    if !tracker.retry_due(modulus, now_ms) {
                        continue;
                    }

                    if recovery == Recovery::Threshold && !check.map_or(true, |c| c.recovered) {
                        continue;
                    }

                    debug!("{:?}: attempting to clear", kind);

                    if in_hardware
                        && afe
                            .clear_status(kind.flag(), AlertFlags::empty())
                            .await
                            .is_err()
                    {
                        warn!("{:?}: clearing failed", kind);
                        continue;
                    }

                    tracker.state = FaultState::Clearing;
                }
                FaultState::Clearing => {
                    if observed {
                        debug!("{:?} still present", kind);
                        tracker.confirm(now_ms);
                    } else {
                        info!("{:?} cleared", kind);
                        tracker.state = FaultState::Clear;
                    }
                }
            }
        }

        status.error_flags = self.flags();

        self.run_alerts(afe, status, raw, now_ms).await;
        status.alerts = self.alerts();

        if !status.error_flags.is_empty() {
            status.no_error_since_ms = now_ms;
        }
    }

    async fn run_alerts<A, const N: usize>(
        &mut self,
        afe: &mut A,
        status: &BmsStatus<N>,
        raw: &RawStatus,
        now_ms: u64,
    ) where
        A: Afe<N>,
    {
        for (alert, tracker) in ALERTS.iter().zip(self.alerts.iter_mut()) {
            let observed = raw.alerts.contains(*alert);
            let modulus = if *alert == AlertFlags::DEVICE_NOT_READY {
                NOT_READY_RETRY_S
            } else {
                OVERRIDE_RETRY_S
            };

            match tracker.state {
                FaultState::Clear | FaultState::Suspected => {
                    if observed {
                        warn!("AFE alert {:?}", alert.bits());
                        tracker.confirm(now_ms);
                    }
                }
                FaultState::Confirmed => {
                    if !tracker.retry_due(modulus, now_ms) {
                        continue;
                    }

                    if afe.clear_status(ErrorFlags::empty(), *alert).await.is_err() {
                        warn!("clearing alert {:?} failed", alert.bits());
                        continue;
                    }

                    tracker.state = FaultState::Clearing;
                    restore_switches(afe, status).await;
                }
                FaultState::Clearing => {
                    if observed {
                        tracker.confirm(now_ms);
                    } else {
                        info!("alert {:?} cleared", alert.bits());
                        tracker.state = FaultState::Clear;
                    }
                }
            }
        }
    }
}

/// Switches the FETs back on that the current state calls for, they were turned
/// off by the chip when the alert fired
async fn restore_switches<A, const N: usize>(afe: &mut A, status: &BmsStatus<N>)
where
    A: Afe<N>,
{
    if status.state.discharging() && status.dis_allowed() {
        if afe.set_switch(Switch::Discharge, true).await.is_err() {
            warn!("re-enabling discharge FET failed");
        }
    }

    if status.state.charging() && status.chg_allowed() {
        if afe.set_switch(Switch::Charge, true).await.is_err() {
            warn!("re-enabling charge FET failed");
        }
    }
}
