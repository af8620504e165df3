//! Pack configuration and chemistry presets

/// Cell chemistry, used to pick sensible default limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CellType {
    /// All voltage limits zeroed, to be filled in by the application
    Custom,
    /// LiFePO4
    Lfp,
    /// NMC/Graphite
    Nmc,
    /// NMC/Graphite high voltage
    NmcHv,
    /// Li-Titanate
    Lto,
}

/// LiFePO4 open circuit voltage at 100, 95, ... 0 % SoC
///
/// Source: <https://www.batteryspace.com/prod-specs/LFP_1.pdf>
pub static OCV_LFP: [f32; 21] = [
    3.392, 3.314, 3.309, 3.308, 3.304, 3.296, 3.283, 3.275, 3.271, 3.268, 3.265, 3.264, 3.262,
    3.252, 3.240, 3.226, 3.213, 3.190, 3.177, 3.132, 2.833,
];

/// NMC open circuit voltage at 100, 95, ... 0 % SoC
pub static OCV_NMC: [f32; 21] = [
    4.198, 4.135, 4.089, 4.056, 4.026, 3.993, 3.962, 3.924, 3.883, 3.858, 3.838, 3.819, 3.803,
    3.787, 3.764, 3.745, 3.726, 3.702, 3.684, 3.588, 2.800,
];

/// BMS configuration, one instance per pack
///
/// Protection limits are requests: after they were applied to the AFE the fields
/// hold the values the hardware actually achieved.
#[derive(Debug, Clone, PartialEq)]
pub struct BmsConfig {
    /// Effective resistance of the current measurement shunt (mOhm)
    pub shunt_res_mohm: f32,
    /// Nominal capacity of the battery pack (Ah)
    pub nominal_capacity_ah: f32,

    /// Short circuit discharge current limit (A)
    pub dis_sc_limit: f32,
    /// Short circuit discharge delay (us)
    pub dis_sc_delay_us: u32,
    /// Discharge over-current limit (A)
    pub dis_oc_limit: f32,
    /// Discharge over-current delay (ms)
    pub dis_oc_delay_ms: u32,
    /// Charge over-current limit (A)
    pub chg_oc_limit: f32,
    /// Charge over-current delay (ms)
    pub chg_oc_delay_ms: u32,

    /// Cell over-voltage limit (V)
    pub cell_ov_limit: f32,
    /// Cell voltage at which the over-voltage fault is released (V)
    pub cell_ov_reset: f32,
    /// Cell over-voltage delay (ms)
    pub cell_ov_delay_ms: u32,
    /// Cell target charge voltage, the pack counts as full above it (V)
    pub cell_chg_voltage: f32,
    /// Cell under-voltage limit (V)
    pub cell_uv_limit: f32,
    /// Cell voltage at which the under-voltage fault is released (V)
    pub cell_uv_reset: f32,
    /// Cell under-voltage delay (ms)
    pub cell_uv_delay_ms: u32,
    /// Cell discharge voltage limit, the pack counts as empty below it (V)
    pub cell_dis_voltage: f32,

    /// Discharge over-temperature limit (°C)
    pub dis_ot_limit: f32,
    /// Discharge under-temperature limit (°C)
    pub dis_ut_limit: f32,
    /// Charge over-temperature limit (°C)
    pub chg_ot_limit: f32,
    /// Charge under-temperature limit (°C)
    pub chg_ut_limit: f32,
    /// Temperature limit hysteresis (°C)
    pub t_limit_hyst: f32,

    /// Balancing is only started after the pack was idle for this long (s)
    pub bal_idle_delay_s: u32,
    /// Current below which the pack counts as idle (A)
    pub bal_idle_current: f32,
    /// Minimum cell voltage to start balancing (V)
    pub bal_cell_voltage_min: f32,
    /// Balancing stops once the cell voltage difference is below this (V)
    pub bal_cell_voltage_diff: f32,
    pub auto_balancing_enabled: bool,

    /// Open circuit voltage at equally spaced SoC points from 100 % down to 0 %
    pub ocv: Option<&'static [f32]>,
}

impl BmsConfig {
    /// Creates a configuration with default limits for the given chemistry.
    ///
    /// Current limits default to 1C for over-current and 2C for short circuit.
    pub fn new(cell_type: CellType, nominal_capacity_ah: f32) -> Self {
        let mut config = Self {
            shunt_res_mohm: 1.0,
            nominal_capacity_ah,

            dis_sc_limit: nominal_capacity_ah * 2.0,
            dis_sc_delay_us: 200,
            dis_oc_limit: nominal_capacity_ah,
            dis_oc_delay_ms: 320,
            chg_oc_limit: nominal_capacity_ah,
            chg_oc_delay_ms: 320,

            cell_ov_limit: 0.0,
            cell_ov_reset: 0.0,
            cell_ov_delay_ms: 2000,
            cell_chg_voltage: 0.0,
            cell_uv_limit: 0.0,
            cell_uv_reset: 0.0,
            cell_uv_delay_ms: 2000,
            cell_dis_voltage: 0.0,

            dis_ot_limit: 45.0,
            dis_ut_limit: -20.0,
            chg_ot_limit: 45.0,
            chg_ut_limit: 0.0,
            t_limit_hyst: 5.0,

            bal_idle_delay_s: 1800,
            bal_idle_current: 0.1,
            bal_cell_voltage_min: 0.0,
            bal_cell_voltage_diff: 0.01,
            auto_balancing_enabled: true,

            ocv: None,
        };

        // (ov_limit, chg_voltage, ov_reset, bal_min, uv_reset, dis_voltage, uv_limit)
        let voltages = match cell_type {
            CellType::Custom => None,
            CellType::Lfp => Some((3.80, 3.55, 3.40, 3.30, 3.10, 2.80, 2.50)),
            CellType::Nmc => Some((4.25, 4.20, 4.05, 3.80, 3.50, 3.20, 3.00)),
            CellType::NmcHv => Some((4.35, 4.30, 4.15, 3.80, 3.50, 3.20, 3.00)),
            CellType::Lto => Some((2.85, 2.80, 2.70, 2.50, 2.10, 2.00, 1.90)),
        };

        if let Some((ov, chg, ov_reset, bal_min, uv_reset, dis, uv)) = voltages {
            config.cell_ov_limit = ov;
            config.cell_chg_voltage = chg;
            config.cell_ov_reset = ov_reset;
            config.bal_cell_voltage_min = bal_min;
            config.cell_uv_reset = uv_reset;
            config.cell_dis_voltage = dis;
            config.cell_uv_limit = uv;
        }

        config.ocv = match cell_type {
            CellType::Lfp => Some(&OCV_LFP[..]),
            CellType::Nmc => Some(&OCV_NMC[..]),
            _ => None,
        };

        config
    }

    /// Caps the current limits at what the board hardware can carry.
    /// Short circuit follows at twice the over-current limit.
    pub fn with_max_current(mut self, max_current: f32) -> Self {
        self.dis_oc_limit = self.dis_oc_limit.min(max_current);
        self.chg_oc_limit = self.chg_oc_limit.min(max_current);
        self.dis_sc_limit = self.dis_oc_limit * 2.0;
        self
    }

    pub fn with_shunt(mut self, shunt_res_mohm: f32) -> Self {
        self.shunt_res_mohm = shunt_res_mohm;
        self
    }
}
