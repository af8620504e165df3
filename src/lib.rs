#![no_std]

//! Platform-agnostic battery management core.
//!
//! Protection limits are quantized to what the analog front-end supports, faults
//! are debounced and recovered automatically, the charge/discharge FETs follow a
//! small state machine, cells are balanced passively and the state of charge is
//! estimated by coulomb counting. All chip access goes through [`afe::Afe`].

pub(crate) mod fmt;
pub(crate) mod registers;

pub mod afe;
pub mod balancing;
pub mod config;
pub mod faults;
pub mod measurements;
pub mod protection;
pub mod quantizer;
pub mod soc;
pub mod state;
pub mod status;

use afe::{Afe, Mode, RawStatus};
use balancing::Balancer;
use faults::{FaultManager, FaultState};
#[cfg(feature = "defmt")]
use fmt::*;
use soc::{SocEstimator, SocReset};
use state::StateMachine;

pub use config::{BmsConfig, CellType};
pub use status::{AlertFlags, BmsState, BmsStatus, ErrorFlags, FaultKind};

/// Consecutive failed measurement refreshes after which the AFE is reported unresponsive
pub const IO_FAILURE_LIMIT: u8 = 5;

/// BMS error type
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error<E> {
    /// Communication with the AFE failed
    Afe(E),
    /// The AFE has no hardware support for the requested protection
    NotSupported,
    /// The configuration was rejected as implausible
    InvalidConfig,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Afe(e)
    }
}

/// BMS handle, owning the AFE and all per-pack state
pub struct Bms<A, const N: usize> {
    afe: A,
    config: BmsConfig,
    status: BmsStatus<N>,
    raw: RawStatus,
    faults: FaultManager,
    state: StateMachine,
    balancer: Balancer,
    soc: SocEstimator,
    io_failures: u8,
}

impl<A, const N: usize> Bms<A, N>
where
    A: Afe<N>,
{
    /// Creates the BMS instance. Nothing is written to the chip before [`Bms::init`].
    pub fn new(afe: A, config: BmsConfig) -> Self {
        Self {
            afe,
            config,
            status: BmsStatus::new(),
            raw: RawStatus::default(),
            faults: FaultManager::new(),
            state: StateMachine::new(A::STARTUP_DELAY_MS),
            balancer: Balancer::new(),
            soc: SocEstimator::new(),
            io_failures: 0,
        }
    }

    /// Activates the AFE, programs all protections and takes a first measurement
    /// to initialize the SoC from the cell voltages
    pub async fn init(&mut self, now_ms: u64) -> Result<(), Error<A::Error>> {
        self.afe.enter_mode(Mode::Active).await?;
        self.apply_protections().await?;

        if !self.refresh(now_ms).await {
            warn!("initial measurement incomplete");
        }
        self.soc_reset(SocReset::FromOcv);

        info!("BMS initialized with {} cells", self.status.connected_cells);

        Ok(())
    }

    /// Runs one control cycle: measurements, faults, state machine, balancing
    /// and SoC, in that order. Intended to be called once per second.
    pub async fn tick(&mut self, now_ms: u64) {
        self.refresh(now_ms).await;
        self.handle_faults(now_ms).await;

        if self.update_state(now_ms).await.is_err() {
            warn!("switching FETs failed");
        }

        if self.balance(now_ms).await.is_err() {
            warn!("balancing update failed");
        }

        self.update_soc(now_ms);
    }

    /// Reads all measurements and the chip status. Failed reads keep the
    /// previous values. Returns false if any read failed.
    pub async fn refresh(&mut self, now_ms: u64) -> bool {
        let mut ok = true;

        match self.afe.read_cell_voltages().await {
            Ok(reading) => measurements::apply_cell_voltages(&mut self.status, &self.config, &reading),
            Err(_) => {
                warn!("reading cell voltages failed");
                ok = false;
            }
        }

        match self.afe.read_pack_current().await {
            Ok(current_ma) => {
                measurements::apply_pack_current(&mut self.status, &self.config, current_ma, now_ms)
            }
            Err(_) => {
                warn!("reading pack current failed");
                ok = false;
            }
        }

        match self.afe.read_temperatures().await {
            Ok(reading) => measurements::apply_temperatures(&mut self.status, &reading),
            Err(_) => {
                warn!("reading temperatures failed");
                ok = false;
            }
        }

        match self.afe.read_raw_status().await {
            Ok(raw) => self.raw = raw,
            Err(_) => {
                warn!("reading AFE status failed");
                ok = false;
            }
        }

        if ok {
            if self.status.afe_unresponsive {
                info!("AFE responding again");
            }
            self.io_failures = 0;
            self.status.afe_unresponsive = false;
        } else {
            self.io_failures = self.io_failures.saturating_add(1);
            if self.io_failures >= IO_FAILURE_LIMIT && !self.status.afe_unresponsive {
                error!("AFE unresponsive for {} cycles", self.io_failures);
                self.status.afe_unresponsive = true;
            }
        }

        ok
    }

    /// Updates the error flags from the latest measurements and retries clearing
    /// confirmed faults
    pub async fn handle_faults(&mut self, now_ms: u64) {
        self.faults
            .run(&mut self.afe, &self.config, &mut self.status, &self.raw, now_ms)
            .await;
    }

    pub async fn update_state(&mut self, now_ms: u64) -> Result<(), Error<A::Error>> {
        self.state.run(&mut self.afe, &mut self.status, now_ms).await?;
        Ok(())
    }

    pub async fn balance(&mut self, now_ms: u64) -> Result<(), Error<A::Error>> {
        self.balancer
            .update(&mut self.afe, &self.config, &mut self.status, now_ms)
            .await?;
        Ok(())
    }

    /// Integrates the last measured pack current into the SoC
    pub fn update_soc(&mut self, now_ms: u64) {
        let current = self.status.pack_current;
        self.soc.integrate(&self.config, &mut self.status, current, now_ms);
    }

    /// Reads the pack current and integrates it right away. Can be called more
    /// often than [`Bms::tick`], e.g. whenever the AFE signals a new sample.
    pub async fn sample_current(&mut self, now_ms: u64) -> Result<(), Error<A::Error>> {
        let current_ma = self.afe.read_pack_current().await?;
        measurements::apply_pack_current(&mut self.status, &self.config, current_ma, now_ms);
        self.update_soc(now_ms);
        Ok(())
    }

    pub fn soc_reset(&mut self, how: SocReset) {
        self.soc.reset(&self.config, &mut self.status, how);
    }

    pub async fn apply_cell_ovp(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_cell_ovp::<A, N>(&mut self.afe, &mut self.config).await
    }

    pub async fn apply_cell_uvp(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_cell_uvp::<A, N>(&mut self.afe, &mut self.config).await
    }

    pub async fn apply_dis_scp(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_dis_scp::<A, N>(&mut self.afe, &mut self.config).await
    }

    pub async fn apply_dis_ocp(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_dis_ocp::<A, N>(&mut self.afe, &mut self.config).await
    }

    pub async fn apply_chg_ocp(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_chg_ocp::<A, N>(&mut self.afe, &mut self.config).await
    }

    pub async fn apply_temp_limits(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_temp_limits::<A, N>(&mut self.afe, &mut self.config).await
    }

    /// Applies all protection limits, see [`protection::apply_all`]
    pub async fn apply_protections(&mut self) -> Result<(), Error<A::Error>> {
        protection::apply_all::<A, N>(&mut self.afe, &mut self.config).await
    }

    /// Puts the AFE into its off mode. Both FETs open and the chip needs an
    /// external wake-up afterwards.
    pub async fn shutdown(&mut self) -> Result<(), Error<A::Error>> {
        info!("shutting down");
        self.afe.enter_mode(Mode::Off).await?;
        self.status.state = BmsState::Off;
        Ok(())
    }

    /// Manually allows or forbids charging
    pub fn set_chg_enable(&mut self, enable: bool) {
        self.status.chg_enable = enable;
    }

    /// Manually allows or forbids discharging
    pub fn set_dis_enable(&mut self, enable: bool) {
        self.status.dis_enable = enable;
    }

    pub fn config(&self) -> &BmsConfig {
        &self.config
    }

    /// Changed protection limits only take effect after they were applied again
    pub fn config_mut(&mut self) -> &mut BmsConfig {
        &mut self.config
    }

    pub fn status(&self) -> &BmsStatus<N> {
        &self.status
    }

    pub fn fault_state(&self, kind: FaultKind) -> FaultState {
        self.faults.state(kind)
    }

    pub fn afe(&self) -> &A {
        &self.afe
    }

    pub fn afe_mut(&mut self) -> &mut A {
        &mut self.afe
    }

    /// Destroys the BMS instance, returning the AFE
    pub fn release(self) -> A {
        self.afe
    }
}
