//! Live pack status, refreshed by the control loop on every tick

use crate::fmt::*;

/// Number of thermistor slots kept in the status
pub const MAX_THERMISTORS: usize = 3;

/// Possible BMS states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BmsState {
    /// Charging and discharging disabled
    Off,
    /// Charging only
    Chg,
    /// Discharging only
    Dis,
    /// Both charging and discharging enabled
    Normal,
}

impl BmsState {
    /// Whether the charge FET is supposed to conduct in this state
    pub fn charging(self) -> bool {
        matches!(self, BmsState::Chg | BmsState::Normal)
    }

    /// Whether the discharge FET is supposed to conduct in this state
    pub fn discharging(self) -> bool {
        matches!(self, BmsState::Dis | BmsState::Normal)
    }
}

bitflags! {
    /// Fault flags, one bit per fault kind
    pub struct ErrorFlags: u32 {
        const CELL_UNDERVOLTAGE = 1 << 0;
        const CELL_OVERVOLTAGE = 1 << 1;
        const SHORT_CIRCUIT = 1 << 2;
        const DIS_OVERCURRENT = 1 << 3;
        const CHG_OVERCURRENT = 1 << 4;
        const OPEN_WIRE = 1 << 5;
        const DIS_UNDERTEMP = 1 << 6;
        const DIS_OVERTEMP = 1 << 7;
        const CHG_UNDERTEMP = 1 << 8;
        const CHG_OVERTEMP = 1 << 9;
        const INT_OVERTEMP = 1 << 10;
        const CELL_FAILURE = 1 << 11;
        const DIS_SWITCH_STUCK_OFF = 1 << 12;
        const CHG_SWITCH_STUCK_ON = 1 << 13;
        const FET_OVERTEMP = 1 << 14;
    }
}

impl ErrorFlags {
    /// Faults that forbid enabling the charge path
    pub const CHG_BLOCKING: ErrorFlags = ErrorFlags::from_bits_truncate(
        ErrorFlags::CELL_OVERVOLTAGE.bits()
            | ErrorFlags::CHG_OVERCURRENT.bits()
            | ErrorFlags::OPEN_WIRE.bits()
            | ErrorFlags::CHG_UNDERTEMP.bits()
            | ErrorFlags::CHG_OVERTEMP.bits()
            | ErrorFlags::INT_OVERTEMP.bits()
            | ErrorFlags::CELL_FAILURE.bits(),
    );

    /// Faults that forbid enabling the discharge path
    pub const DIS_BLOCKING: ErrorFlags = ErrorFlags::from_bits_truncate(
        ErrorFlags::CELL_UNDERVOLTAGE.bits()
            | ErrorFlags::SHORT_CIRCUIT.bits()
            | ErrorFlags::DIS_OVERCURRENT.bits()
            | ErrorFlags::OPEN_WIRE.bits()
            | ErrorFlags::DIS_UNDERTEMP.bits()
            | ErrorFlags::DIS_OVERTEMP.bits()
            | ErrorFlags::INT_OVERTEMP.bits()
            | ErrorFlags::CELL_FAILURE.bits(),
    );

    pub fn blocks_charging(&self) -> bool {
        self.intersects(Self::CHG_BLOCKING)
    }

    pub fn blocks_discharging(&self) -> bool {
        self.intersects(Self::DIS_BLOCKING)
    }
}

bitflags! {
    /// AFE conditions outside the fault taxonomy which still switch the FETs off
    pub struct AlertFlags: u8 {
        /// Internal chip fault or lost communication with the measurement core
        const DEVICE_NOT_READY = 1 << 0;
        /// External override of the alert line
        const OVERRIDE_ALERT = 1 << 1;
    }
}

/// Fault kinds tracked individually by the fault manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FaultKind {
    CellUndervoltage,
    CellOvervoltage,
    ShortCircuit,
    DisOvercurrent,
    ChgOvercurrent,
    OpenWire,
    DisUndertemp,
    DisOvertemp,
    ChgUndertemp,
    ChgOvertemp,
    IntOvertemp,
    CellFailure,
    DisSwitchStuckOff,
    ChgSwitchStuckOn,
    FetOvertemp,
}

impl FaultKind {
    pub const COUNT: usize = 15;

    pub const ALL: [FaultKind; FaultKind::COUNT] = [
        FaultKind::CellUndervoltage,
        FaultKind::CellOvervoltage,
        FaultKind::ShortCircuit,
        FaultKind::DisOvercurrent,
        FaultKind::ChgOvercurrent,
        FaultKind::OpenWire,
        FaultKind::DisUndertemp,
        FaultKind::DisOvertemp,
        FaultKind::ChgUndertemp,
        FaultKind::ChgOvertemp,
        FaultKind::IntOvertemp,
        FaultKind::CellFailure,
        FaultKind::DisSwitchStuckOff,
        FaultKind::ChgSwitchStuckOn,
        FaultKind::FetOvertemp,
    ];

    /// The flag representing this fault in [`ErrorFlags`]
    pub fn flag(self) -> ErrorFlags {
        ErrorFlags::from_bits_truncate(1 << self as u32)
    }
}

/// Current BMS status including measurements and error flags
#[derive(Debug, Clone)]
pub struct BmsStatus<const N: usize> {
    pub state: BmsState,
    /// Manual enable/disable setting for charging
    pub chg_enable: bool,
    /// Manual enable/disable setting for discharging
    pub dis_enable: bool,

    /// Actual number of cells connected (might be less than `N`)
    pub connected_cells: usize,
    /// Single cell voltages (V)
    pub cell_voltages: [f32; N],
    pub cell_voltage_max: f32,
    pub cell_voltage_min: f32,
    pub cell_voltage_avg: f32,
    /// Battery pack voltage (V)
    pub pack_voltage: f32,
    /// Battery pack current, charging direction has positive sign (A)
    pub pack_current: f32,

    /// Battery temperatures (°C), `num_thermistors` of them valid
    pub bat_temps: [f32; MAX_THERMISTORS],
    pub num_thermistors: usize,
    pub bat_temp_max: f32,
    pub bat_temp_min: f32,
    pub bat_temp_avg: f32,
    /// Internal AFE temperature (°C)
    pub ic_temp: f32,

    /// Charging to `cell_chg_voltage` finished
    pub full: bool,
    /// Discharged below `cell_dis_voltage`
    pub empty: bool,

    /// State of charge (%)
    pub soc: f32,
    /// Charge not yet folded into `soc` (mAs)
    pub coulomb_counter_mas: f32,

    /// On/off status of the balancing switches, bit 0 = cell 1
    pub balancing_status: u32,
    /// Last time the current exceeded the idle threshold (ms uptime)
    pub no_idle_timestamp_ms: u64,
    /// Last time any error flag was set (ms uptime)
    pub no_error_since_ms: u64,

    pub error_flags: ErrorFlags,
    pub alerts: AlertFlags,
    /// The AFE failed to respond for several consecutive ticks
    pub afe_unresponsive: bool,
}

impl<const N: usize> BmsStatus<N> {
    const CELLS_FIT: () = assert!(
        N <= crate::balancing::MAX_CELLS,
        "balancing bitmap holds at most 32 cells"
    );

    pub fn new() -> Self {
        let () = Self::CELLS_FIT;

        Self {
            state: BmsState::Off,
            chg_enable: true,
            dis_enable: true,
            connected_cells: 0,
            cell_voltages: [0.0; N],
            cell_voltage_max: 0.0,
            cell_voltage_min: 0.0,
            cell_voltage_avg: 0.0,
            pack_voltage: 0.0,
            pack_current: 0.0,
            bat_temps: [0.0; MAX_THERMISTORS],
            num_thermistors: 0,
            bat_temp_max: 0.0,
            bat_temp_min: 0.0,
            bat_temp_avg: 0.0,
            ic_temp: 0.0,
            full: false,
            empty: false,
            soc: 0.0,
            coulomb_counter_mas: 0.0,
            balancing_status: 0,
            no_idle_timestamp_ms: 0,
            no_error_since_ms: 0,
            error_flags: ErrorFlags::empty(),
            alerts: AlertFlags::empty(),
            afe_unresponsive: false,
        }
    }

    /// Charging is allowed if no charge-blocking fault is set, the pack is not full
    /// and charging was not disabled manually
    pub fn chg_allowed(&self) -> bool {
        !self.error_flags.blocks_charging() && !self.full && self.chg_enable
    }

    /// Discharging is allowed if no discharge-blocking fault is set, the pack is not
    /// empty and discharging was not disabled manually
    pub fn dis_allowed(&self) -> bool {
        !self.error_flags.blocks_discharging() && !self.empty && self.dis_enable
    }
}

impl<const N: usize> Default for BmsStatus<N> {
    fn default() -> Self {
        Self::new()
    }
}
