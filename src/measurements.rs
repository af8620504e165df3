//! Measurement snapshots reported by the AFE and their post-processing into
//! the pack status

use crate::config::BmsConfig;
use crate::status::{BmsStatus, MAX_THERMISTORS};

/// Cells below this voltage are considered not connected (V)
pub const CELL_CONNECTED_THRESHOLD: f32 = 0.5;

/// One reading of all cell channels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellVoltages<const N: usize> {
    /// Channel voltages in pack order (V)
    pub cells: [f32; N],
    pub min: f32,
    pub max: f32,
    pub avg: f32,
    /// Number of channels with a cell attached
    pub connected: usize,
    /// Total pack voltage (V)
    pub pack: f32,
}

impl<const N: usize> CellVoltages<N> {
    /// Builds the statistics from raw channel voltages. Channels below
    /// [`CELL_CONNECTED_THRESHOLD`] are ignored. Without a separate pack
    /// measurement the connected cells are summed up.
    pub fn from_cells(cells: [f32; N], pack: Option<f32>) -> Self {
        let mut min = f32::MAX;
        let mut max = f32::MIN;
        let mut sum = 0.0;
        let mut connected = 0;

        for v in cells.iter().copied().filter(|v| *v > CELL_CONNECTED_THRESHOLD) {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            connected += 1;
        }

        if connected == 0 {
            return Self {
                cells,
                min: 0.0,
                max: 0.0,
                avg: 0.0,
                connected,
                pack: pack.unwrap_or(0.0),
            };
        }

        Self {
            cells,
            min,
            max,
            avg: sum / connected as f32,
            connected,
            pack: pack.unwrap_or(sum),
        }
    }
}

/// One reading of the temperature sensors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperatures {
    /// Battery thermistors (°C), `count` of them valid
    pub sensors: [f32; MAX_THERMISTORS],
    pub count: usize,
    pub min: f32,
    pub max: f32,
    pub avg: f32,
    /// Internal chip temperature (°C)
    pub ic: f32,
}

impl Temperatures {
    /// Builds the statistics for up to [`MAX_THERMISTORS`] sensors, extra
    /// readings are dropped
    pub fn new(sensors: &[f32], ic: f32) -> Self {
        let mut out = Self {
            sensors: [0.0; MAX_THERMISTORS],
            count: 0,
            min: 0.0,
            max: 0.0,
            avg: 0.0,
            ic,
        };

        let used = &sensors[..sensors.len().min(MAX_THERMISTORS)];
        if used.is_empty() {
            return out;
        }

        out.sensors[..used.len()].copy_from_slice(used);
        out.count = used.len();
        out.min = used.iter().copied().fold(f32::MAX, f32::min);
        out.max = used.iter().copied().fold(f32::MIN, f32::max);
        out.avg = used.iter().sum::<f32>() / used.len() as f32;

        out
    }
}

/// Copies a cell reading into the status and updates the full/empty flags.
///
/// `full` latches once the highest cell reaches the target charge voltage and is
/// released again below the over-voltage reset, `empty` works the same way at the
/// bottom end.
pub fn apply_cell_voltages<const N: usize>(
    status: &mut BmsStatus<N>,
    config: &BmsConfig,
    reading: &CellVoltages<N>,
) {
    status.cell_voltages = reading.cells;
    status.cell_voltage_min = reading.min;
    status.cell_voltage_max = reading.max;
    status.cell_voltage_avg = reading.avg;
    status.connected_cells = reading.connected;
    status.pack_voltage = reading.pack;

    if reading.connected == 0 {
        return;
    }

    if reading.max >= config.cell_chg_voltage {
        status.full = true;
    } else if reading.max < config.cell_ov_reset {
        status.full = false;
    }

    if reading.min <= config.cell_dis_voltage {
        status.empty = true;
    } else if reading.min > config.cell_uv_reset {
        status.empty = false;
    }
}

/// Stores the pack current and restarts the idle timer if the pack is under load
pub fn apply_pack_current<const N: usize>(
    status: &mut BmsStatus<N>,
    config: &BmsConfig,
    current_ma: i32,
    now_ms: u64,
) {
    status.pack_current = current_ma as f32 / 1000.0;

    if libm::fabsf(status.pack_current) > config.bal_idle_current {
        status.no_idle_timestamp_ms = now_ms;
    }
}

pub fn apply_temperatures<const N: usize>(status: &mut BmsStatus<N>, reading: &Temperatures) {
    status.bat_temps = reading.sensors;
    status.num_thermistors = reading.count;
    status.bat_temp_min = reading.min;
    status.bat_temp_max = reading.max;
    status.bat_temp_avg = reading.avg;
    status.ic_temp = reading.ic;
}
