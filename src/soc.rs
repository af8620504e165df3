//! State of charge estimation by coulomb counting

use crate::config::BmsConfig;
#[cfg(feature = "defmt")]
use crate::fmt::*;
use crate::quantizer::{interpolate, interpolate_by};
use crate::status::BmsStatus;

/// Smallest SoC change folded into the estimate (%)
pub const SOC_RESOLUTION: f32 = 0.1;

/// Charge of 1 % of a 1 Ah pack (mAs)
const MAS_PER_PERCENT_AH: f32 = 3.6e4;

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocReset {
    /// Set the SoC directly (%). Values outside 0..=100 fall back to the OCV estimate.
    Percent(f32),
    /// Estimate from the average cell voltage
    FromOcv,
}

/// SoC estimate from the open circuit voltage. Without an OCV curve the
/// estimate is linear between discharge and charge voltage.
pub fn soc_from_voltage(config: &BmsConfig, cell_voltage: f32) -> f32 {
    match config.ocv {
        Some(ocv) if ocv.len() >= 2 => {
            let step = 100.0 / (ocv.len() - 1) as f32;
            interpolate_by(|i| ocv[i], |i| 100.0 - i as f32 * step, ocv.len(), cell_voltage)
        }
        _ => interpolate(
            &[config.cell_dis_voltage, config.cell_chg_voltage],
            &[0.0, 100.0],
            cell_voltage,
        ),
    }
}

pub struct SocEstimator {
    last_update_ms: Option<u64>,
}

impl Default for SocEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl SocEstimator {
    pub const fn new() -> Self {
        Self {
            last_update_ms: None,
        }
    }

    /// Integrates `current` (A) over the time since the previous call. The first
    /// call only starts the clock.
    pub fn integrate<const N: usize>(
        &mut self,
        config: &BmsConfig,
        status: &mut BmsStatus<N>,
        current: f32,
        now_ms: u64,
    ) {
        let last = match self.last_update_ms {
            Some(last) if now_ms >= last => last,
            _ => {
                self.last_update_ms = Some(now_ms);
                return;
            }
        };
        self.last_update_ms = Some(now_ms);

        if config.nominal_capacity_ah <= 0.0 {
            return;
        }

        // A * ms = mAs
        status.coulomb_counter_mas += current * (now_ms - last) as f32;

        let delta = status.coulomb_counter_mas / (config.nominal_capacity_ah * MAS_PER_PERCENT_AH);
        if libm::fabsf(delta) > SOC_RESOLUTION {
            status.soc = (status.soc + delta).clamp(0.0, 100.0);
            status.coulomb_counter_mas = 0.0;
        }
    }

    /// Resets the SoC and drops any charge not yet accounted for
    pub fn reset<const N: usize>(&mut self, config: &BmsConfig, status: &mut BmsStatus<N>, how: SocReset) {
        status.soc = match how {
            SocReset::Percent(soc) if (0.0..=100.0).contains(&soc) => soc,
            _ => soc_from_voltage(config, status.cell_voltage_avg),
        };
        status.coulomb_counter_mas = 0.0;

        info!("SoC reset to {}", status.soc);
    }
}
