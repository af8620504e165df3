//! Driver for the Texas Instruments BQ76920/30/40 analog front-ends
//!
//! The chip has hardware protection for cell over/under-voltage, short circuit
//! and discharge over-current. Everything else (charge over-current,
//! temperatures) is left to the fault manager.

use byteorder::{BigEndian, ByteOrder};
use embedded_hal_async::i2c;

use crate::afe::{Afe, Mode, RawStatus, Switch, BANK_SIZE};
#[cfg(feature = "defmt")]
use crate::fmt::*;
use crate::measurements::{CellVoltages, Temperatures};
use crate::protection::{ProtectionCodes, ProtectionEncoding, ProtectionKind, ResetEncoding};
use crate::quantizer::Encoding;
use crate::registers::*;
use crate::status::{AlertFlags, ErrorFlags, MAX_THERMISTORS};

/// Reads with a bad checksum are repeated this many times
const READ_ATTEMPTS: usize = 10;

/// Readings closer to zero than this are noise (mA)
const CURRENT_DEADBAND_MA: i32 = 10;

/// Chip error type
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChipError<E> {
    I2c(E),
    /// Checksum of a read did not match after all retries
    Crc,
    /// No chip answered on any of the known addresses
    NotDetected,
}

impl<E> From<E> for ChipError<E> {
    fn from(e: E) -> Self {
        Self::I2c(e)
    }
}

/// CRC-8 with polynomial 0x07 as used by the bus protocol
fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;

    for b in data.iter() {
        crc ^= *b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }

    crc
}

/// Chip handle, `N` being the number of cell channels (5, 10 or 15)
pub struct Bq769x0<I, const N: usize> {
    i2c: I,
    addr: u8,
    crc: bool,
    /// Factory calibrated ADC gain (uV/LSB)
    adc_gain_uv: i32,
    /// Factory calibrated ADC offset (mV)
    adc_offset_mv: i32,
    shunt_res_mohm: f32,
    thermistor_beta: f32,
}

impl<I, E, const N: usize> Bq769x0<I, N>
where
    I: i2c::I2c<Error = E>,
{
    const SECTIONS: usize = (N + BANK_SIZE - 1) / BANK_SIZE;

    /// Creates the driver instance. Call [`Bq769x0::probe`] or enter
    /// [`Mode::Active`] before use.
    pub fn new(i2c: I, shunt_res_mohm: f32, thermistor_beta: f32) -> Self {
        Self {
            i2c,
            addr: ADDRESSES[0],
            crc: true,
            adc_gain_uv: 365,
            adc_offset_mv: 0,
            shunt_res_mohm,
            thermistor_beta,
        }
    }

    /*
     * With CRC enabled the first checksum covers the address byte (incl. R/W bit)
     * and the first data byte, every following checksum only its own data byte.
     */
    async fn read_bytes(&mut self, reg: u8, data: &mut [u8]) -> Result<(), ChipError<E>> {
        if !self.crc {
            self.i2c.write_read(self.addr, &[reg], data).await?;
            return Ok(());
        }

        let len = data.len().min(2);
        let mut buf = [0u8; 4];

        for _ in 0..READ_ATTEMPTS {
            self.i2c
                .write_read(self.addr, &[reg], &mut buf[..len * 2])
                .await?;

            if crc8(&[(self.addr << 1) | 1, buf[0]]) != buf[1] {
                continue;
            }

            if len == 2 && crc8(&buf[2..3]) != buf[3] {
                continue;
            }

            data[0] = buf[0];
            if len == 2 {
                data[1] = buf[2];
            }

            return Ok(());
        }

        error!("reading {:x} failed after {} attempts", reg, READ_ATTEMPTS);
        Err(ChipError::Crc)
    }

    async fn read_byte(&mut self, reg: u8) -> Result<u8, ChipError<E>> {
        let mut data = [0];
        self.read_bytes(reg, &mut data).await?;
        Ok(data[0])
    }

    async fn read_word(&mut self, reg: u8) -> Result<u16, ChipError<E>> {
        let mut data = [0, 0];
        self.read_bytes(reg, &mut data).await?;
        Ok(BigEndian::read_u16(&data))
    }

    async fn write_byte(&mut self, reg: u8, data: u8) -> Result<(), ChipError<E>> {
        if self.crc {
            let crc = crc8(&[self.addr << 1, reg, data]);
            self.i2c.write(self.addr, &[reg, data, crc]).await?;
        } else {
            self.i2c.write(self.addr, &[reg, data]).await?;
        }

        Ok(())
    }

    /// Finds the chip address and whether it expects checksums by writing
    /// CC_CFG and reading it back
    pub async fn probe(&mut self) -> Result<(), ChipError<E>> {
        for addr in ADDRESSES {
            for crc in [true, false] {
                self.addr = addr;
                self.crc = crc;

                if self.write_byte(regs::CC_CFG, CC_CFG_VALUE).await.is_err() {
                    continue;
                }

                if let Ok(CC_CFG_VALUE) = self.read_byte(regs::CC_CFG).await {
                    info!("bq769x0 found at {:x}, crc: {}", addr, crc);
                    return Ok(());
                }
            }
        }

        Err(ChipError::NotDetected)
    }

    /// Switches the ADC and coulomb counter on and reads the calibration
    async fn activate(&mut self) -> Result<(), ChipError<E>> {
        self.probe().await?;

        self.write_byte(regs::SYS_CTRL1, (SysCtrl1::ADC_EN | SysCtrl1::TEMP_SEL).bits())
            .await?;
        self.write_byte(regs::SYS_CTRL2, SysCtrl2::CC_EN.bits())
            .await?;

        // offset is two's complement
        self.adc_offset_mv = self.read_byte(regs::ADCOFFSET).await? as i8 as i32;

        let gain1 = self.read_byte(regs::ADCGAIN1).await?;
        let gain2 = self.read_byte(regs::ADCGAIN2).await?;
        self.adc_gain_uv = 365 + ((((gain1 & 0b0000_1100) << 1) | ((gain2 & 0b1110_0000) >> 5)) as i32);

        debug!("adc gain {} uV/LSB, offset {} mV", self.adc_gain_uv, self.adc_offset_mv);

        Ok(())
    }

    /// Puts the chip into ship mode
    async fn shutdown(&mut self) -> Result<(), ChipError<E>> {
        self.write_byte(regs::SYS_CTRL1, 0).await?;
        self.write_byte(regs::SYS_CTRL1, SysCtrl1::SHUT_B.bits())
            .await?;
        self.write_byte(regs::SYS_CTRL1, SysCtrl1::SHUT_A.bits())
            .await
    }

    /// Trip registers hold bits 11..4 of the 14 bit ADC value, all other bits are
    /// fixed to `base`
    fn trip_encoding(&self, base: u32) -> Encoding {
        let gain_v = self.adc_gain_uv as f32 * 1e-6;

        Encoding::Linear {
            offset: base as f32 * gain_v + self.adc_offset_mv as f32 * 1e-3,
            gain: 16.0 * gain_v,
            min: 0,
            max: 0xFF,
        }
    }

    fn adc_to_volts(&self, raw: u16) -> f32 {
        (raw as f32 * self.adc_gain_uv as f32 * 1e-3 + self.adc_offset_mv as f32) * 1e-3
    }

    /// Beta equation for a 10k thermistor against the internal 10k pull-up
    fn thermistor_celsius(&self, raw: u16) -> f32 {
        let vtsx_mv = raw as f32 * 0.382;
        let rts = 10000.0 * vtsx_mv / (3300.0 - vtsx_mv);

        1.0 / (1.0 / (273.15 + 25.0) + libm::logf(rts / 10000.0) / self.thermistor_beta) - 273.15
    }
}

impl<I, E, const N: usize> Afe<N> for Bq769x0<I, N>
where
    I: i2c::I2c<Error = E>,
{
    type Error = ChipError<E>;

    // t_BOOTREADY
    const STARTUP_DELAY_MS: u64 = 10;

    fn hardware_faults(&self) -> ErrorFlags {
        ErrorFlags::CELL_UNDERVOLTAGE
            | ErrorFlags::CELL_OVERVOLTAGE
            | ErrorFlags::SHORT_CIRCUIT
            | ErrorFlags::DIS_OVERCURRENT
    }

    fn protection_encoding(&self, kind: ProtectionKind) -> Option<ProtectionEncoding> {
        let encoding = match kind {
            ProtectionKind::CellOvervoltage => ProtectionEncoding {
                threshold: self.trip_encoding(0b10_0000_0000_1000),
                delay: Some(Encoding::Table(&OV_DELAYS_MS)),
                reset: ResetEncoding::Software,
            },
            ProtectionKind::CellUndervoltage => ProtectionEncoding {
                threshold: self.trip_encoding(0b01_0000_0000_0000),
                delay: Some(Encoding::Table(&UV_DELAYS_MS)),
                reset: ResetEncoding::Software,
            },
            ProtectionKind::ShortCircuit => ProtectionEncoding {
                threshold: Encoding::Table(&SCD_THRESHOLDS_MV),
                delay: Some(Encoding::Table(&SCD_DELAYS_US)),
                reset: ResetEncoding::Software,
            },
            ProtectionKind::DisOvercurrent => ProtectionEncoding {
                threshold: Encoding::Table(&OCD_THRESHOLDS_MV),
                delay: Some(Encoding::Table(&OCD_DELAYS_MS)),
                reset: ResetEncoding::Software,
            },
            _ => return None,
        };

        Some(encoding)
    }

    async fn read_cell_voltages(&mut self) -> Result<CellVoltages<N>, Self::Error> {
        let mut cells = [0.0; N];

        for (i, cell) in cells.iter_mut().enumerate() {
            let raw = self.read_word(regs::VC1_HI + 2 * i as u8).await? & 0x3FFF;
            *cell = self.adc_to_volts(raw);
        }

        let raw = self.read_word(regs::BAT_HI).await?;
        let connected = CellVoltages::from_cells(cells, None).connected;
        let pack = (4.0 * self.adc_gain_uv as f32 * raw as f32 * 1e-3
            + (connected as i32 * self.adc_offset_mv) as f32)
            * 1e-3;

        Ok(CellVoltages::from_cells(cells, Some(pack)))
    }

    async fn read_pack_current(&mut self) -> Result<i32, Self::Error> {
        let mut data = [0, 0];
        self.read_bytes(regs::CC_HI, &mut data).await?;
        self.write_byte(regs::SYS_STAT, SysStat::CC_READY.bits())
            .await?;

        let raw = BigEndian::read_i16(&data);
        let current_ma = (raw as f32 * 8.44 / self.shunt_res_mohm) as i32;

        if current_ma.abs() < CURRENT_DEADBAND_MA {
            Ok(0)
        } else {
            Ok(current_ma)
        }
    }

    async fn read_temperatures(&mut self) -> Result<Temperatures, Self::Error> {
        let mut temps = [0.0; MAX_THERMISTORS];
        let count = Self::SECTIONS.min(MAX_THERMISTORS);

        for (i, temp) in temps[..count].iter_mut().enumerate() {
            let raw = self.read_word(regs::TS1_HI + 2 * i as u8).await? & 0x3FFF;
            *temp = self.thermistor_celsius(raw);
        }

        // the die temperature is not available while TEMP_SEL selects the thermistors
        Ok(Temperatures::new(&temps[..count], f32::NAN))
    }

    async fn read_raw_status(&mut self) -> Result<RawStatus, Self::Error> {
        let stat = SysStat::from_bits_truncate(self.read_byte(regs::SYS_STAT).await?);
        let ctrl2 = SysCtrl2::from_bits_truncate(self.read_byte(regs::SYS_CTRL2).await?);

        let mut faults = ErrorFlags::empty();
        faults.set(ErrorFlags::CELL_UNDERVOLTAGE, stat.contains(SysStat::UV));
        faults.set(ErrorFlags::CELL_OVERVOLTAGE, stat.contains(SysStat::OV));
        faults.set(ErrorFlags::SHORT_CIRCUIT, stat.contains(SysStat::SCD));
        faults.set(ErrorFlags::DIS_OVERCURRENT, stat.contains(SysStat::OCD));

        let mut alerts = AlertFlags::empty();
        alerts.set(AlertFlags::DEVICE_NOT_READY, stat.contains(SysStat::DEVICE_XREADY));
        alerts.set(AlertFlags::OVERRIDE_ALERT, stat.contains(SysStat::OVRD_ALERT));

        Ok(RawStatus {
            faults,
            alerts,
            chg_fet: ctrl2.contains(SysCtrl2::CHG_ON),
            dis_fet: ctrl2.contains(SysCtrl2::DSG_ON),
        })
    }

    async fn clear_status(
        &mut self,
        faults: ErrorFlags,
        alerts: AlertFlags,
    ) -> Result<(), Self::Error> {
        let mut stat = SysStat::empty();
        stat.set(SysStat::UV, faults.contains(ErrorFlags::CELL_UNDERVOLTAGE));
        stat.set(SysStat::OV, faults.contains(ErrorFlags::CELL_OVERVOLTAGE));
        stat.set(SysStat::SCD, faults.contains(ErrorFlags::SHORT_CIRCUIT));
        stat.set(SysStat::OCD, faults.contains(ErrorFlags::DIS_OVERCURRENT));
        stat.set(SysStat::DEVICE_XREADY, alerts.contains(AlertFlags::DEVICE_NOT_READY));
        stat.set(SysStat::OVRD_ALERT, alerts.contains(AlertFlags::OVERRIDE_ALERT));

        if stat.is_empty() {
            return Ok(());
        }

        self.write_byte(regs::SYS_STAT, stat.bits()).await
    }

    async fn write_protection(
        &mut self,
        kind: ProtectionKind,
        codes: ProtectionCodes,
    ) -> Result<(), Self::Error> {
        let delay = codes.delay.unwrap_or(0);

        match kind {
            ProtectionKind::CellOvervoltage => {
                self.write_byte(regs::OV_TRIP, codes.threshold as u8).await?;
                let protect3 = self.read_byte(regs::PROTECT3).await?;
                self.write_byte(regs::PROTECT3, fields::set(protect3, fields::OV_DELAY, delay))
                    .await
            }
            ProtectionKind::CellUndervoltage => {
                self.write_byte(regs::UV_TRIP, codes.threshold as u8).await?;
                let protect3 = self.read_byte(regs::PROTECT3).await?;
                self.write_byte(regs::PROTECT3, fields::set(protect3, fields::UV_DELAY, delay))
                    .await
            }
            ProtectionKind::ShortCircuit => {
                let protect1 = fields::set(PROTECT1_RSNS, fields::SCD_DELAY, delay);
                let protect1 = fields::set(protect1, fields::SCD_THRESH, codes.threshold);
                self.write_byte(regs::PROTECT1, protect1).await
            }
            ProtectionKind::DisOvercurrent => {
                let protect2 = fields::set(0, fields::OCD_DELAY, delay);
                let protect2 = fields::set(protect2, fields::OCD_THRESH, codes.threshold);
                self.write_byte(regs::PROTECT2, protect2).await
            }
            _ => {
                warn!("{:?} not available in hardware", kind);
                Ok(())
            }
        }
    }

    async fn set_switch(&mut self, switch: Switch, enabled: bool) -> Result<(), Self::Error> {
        let flag = match switch {
            Switch::Charge => SysCtrl2::CHG_ON,
            Switch::Discharge => SysCtrl2::DSG_ON,
            // no pre-charge FET driver on this chip
            Switch::Precharge => return Ok(()),
        };

        let mut ctrl2 = SysCtrl2::from_bits_truncate(self.read_byte(regs::SYS_CTRL2).await?);
        ctrl2.set(flag, enabled);

        self.write_byte(regs::SYS_CTRL2, ctrl2.bits()).await
    }

    async fn set_balance_bitmap(&mut self, bank: usize, bitmap: u8) -> Result<(), Self::Error> {
        if bank >= Self::SECTIONS {
            return Ok(());
        }

        self.write_byte(regs::CELLBAL1 + bank as u8, bitmap & 0x1F)
            .await
    }

    async fn enter_mode(&mut self, mode: Mode) -> Result<(), Self::Error> {
        match mode {
            Mode::Active => self.activate().await,
            Mode::Off => self.shutdown().await,
        }
    }
}
