//! Capability interface to the analog front-end chip
//!
//! The BMS core never touches registers itself. Everything chip specific (bus
//! access, register layout, the supported protection settings) sits behind
//! [`Afe`], with `N` being the number of cell channels of the chip.

pub mod bq769x0;

use crate::measurements::{CellVoltages, Temperatures};
use crate::protection::{ProtectionCodes, ProtectionEncoding, ProtectionKind};
use crate::status::{AlertFlags, ErrorFlags};

/// Cells sharing one balancing register
pub const BANK_SIZE: usize = 5;

/// Power switches controlled by the AFE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Switch {
    Charge,
    Discharge,
    Precharge,
}

/// AFE power modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Mode {
    Active,
    /// Ship mode, only a wake-up signal brings the chip back
    Off,
}

/// Fault and switch state as reported by the chip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawStatus {
    /// Faults the chip detected (only those in [`Afe::hardware_faults`] matter)
    pub faults: ErrorFlags,
    pub alerts: AlertFlags,
    /// Charge FET conducting
    pub chg_fet: bool,
    /// Discharge FET conducting
    pub dis_fet: bool,
}

impl Default for RawStatus {
    fn default() -> Self {
        Self {
            faults: ErrorFlags::empty(),
            alerts: AlertFlags::empty(),
            chg_fet: false,
            dis_fet: false,
        }
    }
}

#[allow(async_fn_in_trait)]
pub trait Afe<const N: usize> {
    type Error;

    /// Time after power-up before measurements can be trusted (ms)
    const STARTUP_DELAY_MS: u64 = 0;

    /// Faults the chip detects on its own and reports through [`Afe::read_raw_status`].
    /// All other faults are evaluated in software from the measurements.
    fn hardware_faults(&self) -> ErrorFlags;

    /// Register encoding of a protection, `None` if the chip cannot protect against it
    fn protection_encoding(&self, kind: ProtectionKind) -> Option<ProtectionEncoding>;

    async fn read_cell_voltages(&mut self) -> Result<CellVoltages<N>, Self::Error>;

    /// Pack current in mA, positive while charging
    async fn read_pack_current(&mut self) -> Result<i32, Self::Error>;

    async fn read_temperatures(&mut self) -> Result<Temperatures, Self::Error>;

    async fn read_raw_status(&mut self) -> Result<RawStatus, Self::Error>;

    /// Acknowledges latched faults and alerts so the chip can switch on again
    async fn clear_status(
        &mut self,
        faults: ErrorFlags,
        alerts: AlertFlags,
    ) -> Result<(), Self::Error>;

    /// Writes raw protection codes previously obtained from [`Afe::protection_encoding`]
    async fn write_protection(
        &mut self,
        kind: ProtectionKind,
        codes: ProtectionCodes,
    ) -> Result<(), Self::Error>;

    /// Switching an already switched FET must succeed. Chips switching their
    /// FETs autonomously implement this as a no-op.
    async fn set_switch(&mut self, switch: Switch, enabled: bool) -> Result<(), Self::Error>;

    /// Sets the balancing switches of one bank, bit 0 being the bank's first cell
    async fn set_balance_bitmap(&mut self, bank: usize, bitmap: u8) -> Result<(), Self::Error>;

    async fn enter_mode(&mut self, mode: Mode) -> Result<(), Self::Error>;
}
