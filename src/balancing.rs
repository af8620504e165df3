//! Passive cell balancing
//!
//! Cells are bled in banks of [`BANK_SIZE`] sharing one balancing register. Two
//! neighbouring cells of the same bank must never be bled at the same time.

use crate::afe::{Afe, BANK_SIZE};
use crate::config::BmsConfig;
#[cfg(feature = "defmt")]
use crate::fmt::*;
use crate::status::BmsStatus;

/// Number of cells the balancing bitmap can hold
pub const MAX_CELLS: usize = 32;

/// Picks the cells to bleed: all cells more than `diff` above `min`, highest
/// voltage first, skipping neighbours of already selected cells in the same bank.
///
/// Bit 0 of the result is the first cell. Cells beyond [`MAX_CELLS`] are never selected.
pub fn select(cells: &[f32], min: f32, diff: f32) -> u32 {
    let mut bitmap = 0;
    let cells = &cells[..cells.len().min(MAX_CELLS)];

    for (bank, voltages) in cells.chunks(BANK_SIZE).enumerate() {
        let mut candidates = [0usize; BANK_SIZE];
        let mut count = 0;

        // insertion sort, highest voltage first
        for (i, v) in voltages.iter().enumerate() {
            if *v <= min + diff {
                continue;
            }

            let mut pos = count;
            while pos > 0 && voltages[candidates[pos - 1]] < *v {
                candidates[pos] = candidates[pos - 1];
                pos -= 1;
            }
            candidates[pos] = i;
            count += 1;
        }

        let mut selected: u64 = 0;
        for &i in &candidates[..count] {
            let neighbours = (1 << (i + 1)) | if i > 0 { 1 << (i - 1) } else { 0 };
            if selected & neighbours == 0 {
                selected |= 1 << i;
            }
        }

        bitmap |= (selected << (bank * BANK_SIZE)) as u32;
    }

    bitmap
}

/// Drives the balancing switches from the pack status
pub struct Balancer {
    /// Hardware state unknown after a failed write, rewrite every bank
    dirty: bool,
}

impl Default for Balancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer {
    pub const fn new() -> Self {
        Self { dirty: false }
    }

    /// Whether balancing may run right now
    pub fn gate<const N: usize>(config: &BmsConfig, status: &BmsStatus<N>, now_ms: u64) -> bool {
        let idle_ms = now_ms.saturating_sub(status.no_idle_timestamp_ms);

        config.auto_balancing_enabled
            && status.connected_cells > 0
            && idle_ms >= config.bal_idle_delay_s as u64 * 1000
            && status.cell_voltage_max > config.bal_cell_voltage_min
            && status.cell_voltage_max - status.cell_voltage_min > config.bal_cell_voltage_diff
    }

    /// Updates the balancing switches. Banks are only written if the bitmap
    /// changed. If a write fails all banks are switched off.
    pub async fn update<A, const N: usize>(
        &mut self,
        afe: &mut A,
        config: &BmsConfig,
        status: &mut BmsStatus<N>,
        now_ms: u64,
    ) -> Result<(), A::Error>
    where
        A: Afe<N>,
    {
        if now_ms < status.no_idle_timestamp_ms {
            // clock went backwards
            status.no_idle_timestamp_ms = now_ms;
        }

        let bitmap = if Self::gate(config, status, now_ms) {
            select(
                &status.cell_voltages[..],
                status.cell_voltage_min,
                config.bal_cell_voltage_diff,
            )
        } else {
            0
        };

        if bitmap == status.balancing_status && !self.dirty {
            return Ok(());
        }

        match write_banks::<A, N>(afe, bitmap).await {
            Ok(()) => {
                if bitmap != status.balancing_status {
                    debug!("balancing bitmap {:x}", bitmap);
                }
                status.balancing_status = bitmap;
                self.dirty = false;
                Ok(())
            }
            Err(e) => {
                warn!("balancing write failed, switching off");
                self.dirty = write_banks::<A, N>(afe, 0).await.is_err();
                status.balancing_status = 0;
                Err(e)
            }
        }
    }
}

async fn write_banks<A, const N: usize>(afe: &mut A, bitmap: u32) -> Result<(), A::Error>
where
    A: Afe<N>,
{
    for bank in 0..(N + BANK_SIZE - 1) / BANK_SIZE {
        let bits = bitmap
            .checked_shr((bank * BANK_SIZE) as u32)
            .unwrap_or(0)
            & ((1 << BANK_SIZE) - 1);
        afe.set_balance_bitmap(bank, bits as u8).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CellType;

    fn no_adjacent_in_bank(bitmap: u32, cells: usize) -> bool {
        (0..cells.saturating_sub(1)).all(|i| {
            let same_bank = i / BANK_SIZE == (i + 1) / BANK_SIZE;
            !(same_bank && bitmap & (1 << i) != 0 && bitmap & (1 << (i + 1)) != 0)
        })
    }

    #[test]
    fn highest_cell_wins_adjacent_pair() {
        let cells = [3.30, 3.40, 3.35, 3.30, 3.30];
        assert_eq!(select(&cells, 3.30, 0.01), 0b00010);

        let cells = [3.30, 3.35, 3.40, 3.30, 3.30];
        assert_eq!(select(&cells, 3.30, 0.01), 0b00100);
    }

    #[test]
    fn banks_are_independent() {
        // cells 4 and 5 are neighbours but sit in different banks
        let cells = [3.0, 3.0, 3.0, 3.0, 3.5, 3.5, 3.0, 3.0];
        assert_eq!(select(&cells, 3.0, 0.01), (1 << 4) | (1 << 5));
    }

    #[test]
    fn ramp_across_two_banks() {
        let cells = [3.0, 3.1, 3.2, 3.3, 3.4, 3.5, 3.6, 3.7];
        let bitmap = select(&cells, 3.0, 0.01);

        assert_eq!(bitmap, 0b1011_0100);
        assert!(no_adjacent_in_bank(bitmap, cells.len()));
        assert_eq!(select(&cells, 3.0, 0.01), bitmap);
    }

    #[test]
    fn no_adjacent_bits_for_any_pattern() {
        let mut seed: u32 = 12345;
        for _ in 0..500 {
            let mut cells = [0.0f32; 15];
            for c in cells.iter_mut() {
                seed = seed.wrapping_mul(1103515245).wrapping_add(12345);
                *c = 3.0 + (seed >> 16) as f32 % 100.0 / 100.0;
            }
            let min = cells.iter().copied().fold(f32::MAX, f32::min);
            let bitmap = select(&cells, min, 0.01);

            assert!(no_adjacent_in_bank(bitmap, cells.len()));
            for (i, v) in cells.iter().enumerate() {
                if bitmap & (1 << i) != 0 {
                    assert!(*v > min + 0.01);
                }
            }
        }
    }

    #[test]
    fn cells_beyond_bitmap_are_ignored() {
        let mut cells = [3.0f32; 40];
        cells[37] = 3.5;
        assert_eq!(select(&cells, 3.0, 0.01), 0);

        cells[31] = 3.5;
        assert_eq!(select(&cells, 3.0, 0.01), 1 << 31);
    }

    #[test]
    fn gating() {
        let mut config = BmsConfig::new(CellType::Nmc, 10.0);
        let mut status = BmsStatus::<4>::new();
        status.connected_cells = 4;
        status.cell_voltage_min = 3.85;
        status.cell_voltage_max = 3.95;

        let idle = config.bal_idle_delay_s as u64 * 1000;
        assert!(!Balancer::gate(&config, &status, idle - 1));
        assert!(Balancer::gate(&config, &status, idle));

        status.cell_voltage_max = 3.855;
        assert!(!Balancer::gate(&config, &status, idle));

        status.cell_voltage_max = 3.95;
        status.cell_voltage_min = 3.70;
        config.bal_cell_voltage_min = 4.0;
        assert!(!Balancer::gate(&config, &status, idle));

        config.bal_cell_voltage_min = 3.8;
        config.auto_balancing_enabled = false;
        assert!(!Balancer::gate(&config, &status, idle));
    }
}
