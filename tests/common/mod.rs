#![allow(dead_code)]

use bms_core::afe::{Afe, Mode, RawStatus, Switch};
use bms_core::measurements::{CellVoltages, Temperatures};
use bms_core::protection::{ProtectionCodes, ProtectionEncoding, ProtectionKind, ResetEncoding};
use bms_core::quantizer::Encoding;
use bms_core::{AlertFlags, Bms, BmsConfig, CellType, ErrorFlags};

pub const CELLS: usize = 8;

/// Cell voltage step of the mock's voltage registers (V)
pub const VOLTAGE_STEP: f32 = 0.0506;

static SCD_THRESHOLDS_MV: [f32; 16] = [
    10.0, 20.0, 40.0, 60.0, 80.0, 100.0, 125.0, 150.0, 175.0, 200.0, 250.0, 300.0, 350.0, 400.0,
    450.0, 500.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// AFE stand-in with linear protection registers. Records every command and can
/// be told to fail reads or writes.
pub struct MockAfe {
    pub cells: [f32; CELLS],
    pub current_ma: i32,
    pub temps: Vec<f32>,
    pub ic_temp: f32,

    /// Faults latched by the chip
    pub faults: ErrorFlags,
    /// Faults that latch again right after being cleared
    pub sticky: ErrorFlags,
    pub alerts: AlertFlags,
    pub chg_fet: bool,
    pub dis_fet: bool,

    pub hardware: ErrorFlags,
    pub chg_ocp: bool,
    pub temp_protection: bool,

    pub fail_reads: bool,
    pub fail_writes: bool,

    pub clears: Vec<(ErrorFlags, AlertFlags)>,
    pub switches: Vec<(Switch, bool)>,
    pub balancing: Vec<(usize, u8)>,
    pub protections: Vec<(ProtectionKind, ProtectionCodes)>,
    pub modes: Vec<Mode>,
}

impl MockAfe {
    pub fn new() -> Self {
        Self {
            cells: [3.7; CELLS],
            current_ma: 0,
            temps: vec![25.0, 25.0],
            ic_temp: 30.0,
            faults: ErrorFlags::empty(),
            sticky: ErrorFlags::empty(),
            alerts: AlertFlags::empty(),
            chg_fet: false,
            dis_fet: false,
            hardware: ErrorFlags::CELL_UNDERVOLTAGE
                | ErrorFlags::CELL_OVERVOLTAGE
                | ErrorFlags::SHORT_CIRCUIT
                | ErrorFlags::DIS_OVERCURRENT
                | ErrorFlags::OPEN_WIRE,
            chg_ocp: false,
            temp_protection: false,
            fail_reads: false,
            fail_writes: false,
            clears: Vec::new(),
            switches: Vec::new(),
            balancing: Vec::new(),
            protections: Vec::new(),
            modes: Vec::new(),
        }
    }

    /// Latches a fault the way the chip does, opening the affected FETs
    pub fn trip(&mut self, fault: ErrorFlags) {
        self.faults |= fault;

        if fault.blocks_discharging() {
            self.dis_fet = false;
        }
        if fault.blocks_charging() {
            self.chg_fet = false;
        }
    }

    fn read(&self) -> Result<(), MockError> {
        if self.fail_reads {
            Err(MockError)
        } else {
            Ok(())
        }
    }

    fn write(&self) -> Result<(), MockError> {
        if self.fail_writes {
            Err(MockError)
        } else {
            Ok(())
        }
    }
}

impl Afe<CELLS> for MockAfe {
    type Error = MockError;

    fn hardware_faults(&self) -> ErrorFlags {
        self.hardware
    }

    fn protection_encoding(&self, kind: ProtectionKind) -> Option<ProtectionEncoding> {
        let voltage_hyst = ResetEncoding::Hysteresis(Encoding::Linear {
            offset: 0.0,
            gain: VOLTAGE_STEP,
            min: 2,
            max: 20,
        });
        let voltage_delay = Encoding::Linear {
            offset: 0.0,
            gain: 3.3,
            min: 1,
            max: 2047,
        };
        let current_delay = Encoding::Linear {
            offset: 6.6,
            gain: 3.3,
            min: 1,
            max: 127,
        };
        let temp = ProtectionEncoding {
            threshold: Encoding::Linear {
                offset: -40.0,
                gain: 1.0,
                min: 0,
                max: 160,
            },
            delay: None,
            reset: ResetEncoding::Hysteresis(Encoding::Linear {
                offset: 0.0,
                gain: 1.0,
                min: 1,
                max: 20,
            }),
        };

        match kind {
            ProtectionKind::CellOvervoltage => Some(ProtectionEncoding {
                threshold: Encoding::Linear {
                    offset: 0.0,
                    gain: VOLTAGE_STEP,
                    min: 20,
                    max: 110,
                },
                delay: Some(voltage_delay),
                reset: voltage_hyst,
            }),
            ProtectionKind::CellUndervoltage => Some(ProtectionEncoding {
                threshold: Encoding::Linear {
                    offset: 0.0,
                    gain: VOLTAGE_STEP,
                    min: 20,
                    max: 90,
                },
                delay: Some(voltage_delay),
                reset: voltage_hyst,
            }),
            ProtectionKind::ShortCircuit => Some(ProtectionEncoding {
                threshold: Encoding::Table(&SCD_THRESHOLDS_MV),
                delay: Some(Encoding::Linear {
                    offset: -15.0,
                    gain: 15.0,
                    min: 1,
                    max: 31,
                }),
                reset: ResetEncoding::Software,
            }),
            ProtectionKind::DisOvercurrent => Some(ProtectionEncoding {
                threshold: Encoding::Linear {
                    offset: 0.0,
                    gain: 2.0,
                    min: 2,
                    max: 100,
                },
                delay: Some(current_delay),
                reset: ResetEncoding::Software,
            }),
            ProtectionKind::ChgOvercurrent if self.chg_ocp => Some(ProtectionEncoding {
                threshold: Encoding::Linear {
                    offset: 0.0,
                    gain: 2.0,
                    min: 2,
                    max: 62,
                },
                delay: Some(current_delay),
                reset: ResetEncoding::Software,
            }),
            ProtectionKind::ChgOvertemp
            | ProtectionKind::ChgUndertemp
            | ProtectionKind::DisOvertemp
            | ProtectionKind::DisUndertemp
                if self.temp_protection =>
            {
                Some(temp)
            }
            _ => None,
        }
    }

    async fn read_cell_voltages(&mut self) -> Result<CellVoltages<CELLS>, MockError> {
        self.read()?;
        Ok(CellVoltages::from_cells(self.cells, None))
    }

    async fn read_pack_current(&mut self) -> Result<i32, MockError> {
        self.read()?;
        Ok(self.current_ma)
    }

    async fn read_temperatures(&mut self) -> Result<Temperatures, MockError> {
        self.read()?;
        Ok(Temperatures::new(&self.temps, self.ic_temp))
    }

    async fn read_raw_status(&mut self) -> Result<RawStatus, MockError> {
        self.read()?;
        Ok(RawStatus {
            faults: self.faults,
            alerts: self.alerts,
            chg_fet: self.chg_fet,
            dis_fet: self.dis_fet,
        })
    }

    async fn clear_status(&mut self, faults: ErrorFlags, alerts: AlertFlags) -> Result<(), MockError> {
        self.write()?;
        self.clears.push((faults, alerts));
        self.faults &= !(faults - self.sticky);
        self.alerts &= !alerts;
        Ok(())
    }

    async fn write_protection(
        &mut self,
        kind: ProtectionKind,
        codes: ProtectionCodes,
    ) -> Result<(), MockError> {
        self.write()?;
        self.protections.push((kind, codes));
        Ok(())
    }

    async fn set_switch(&mut self, switch: Switch, enabled: bool) -> Result<(), MockError> {
        self.write()?;
        self.switches.push((switch, enabled));
        match switch {
            Switch::Charge => self.chg_fet = enabled,
            Switch::Discharge => self.dis_fet = enabled,
            Switch::Precharge => {}
        }
        Ok(())
    }

    async fn set_balance_bitmap(&mut self, bank: usize, bitmap: u8) -> Result<(), MockError> {
        self.write()?;
        self.balancing.push((bank, bitmap));
        Ok(())
    }

    async fn enter_mode(&mut self, mode: Mode) -> Result<(), MockError> {
        self.write()?;
        self.modes.push(mode);
        if mode == Mode::Off {
            self.chg_fet = false;
            self.dis_fet = false;
        }
        Ok(())
    }
}

/// NMC pack of 10 Ah with all cells at 3.7 V
pub fn config() -> BmsConfig {
    BmsConfig::new(CellType::Nmc, 10.0)
}

pub fn bms(afe: MockAfe) -> Bms<MockAfe, CELLS> {
    Bms::new(afe, config())
}

/// Runs one tick per second from `from_s` to `to_s`, both inclusive
pub fn run_seconds(bms: &mut Bms<MockAfe, CELLS>, from_s: u64, to_s: u64) {
    for s in from_s..=to_s {
        embassy_futures::block_on(bms.tick(s * 1000));
    }
}

pub fn close(a: f32, b: f32) -> bool {
    (a - b).abs() < 1e-3
}
