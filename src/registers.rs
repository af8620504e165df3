//! These are low-level definitions for the BQ76920/30/40 family

use crate::fmt::bitflags;

/// Register addresses
pub mod regs {
    #![allow(dead_code)]
    pub const SYS_STAT: u8 = 0x00;
    pub const CELLBAL1: u8 = 0x01;
    pub const CELLBAL2: u8 = 0x02;
    pub const CELLBAL3: u8 = 0x03;
    pub const SYS_CTRL1: u8 = 0x04;
    pub const SYS_CTRL2: u8 = 0x05;
    pub const PROTECT1: u8 = 0x06;
    pub const PROTECT2: u8 = 0x07;
    pub const PROTECT3: u8 = 0x08;
    pub const OV_TRIP: u8 = 0x09;
    pub const UV_TRIP: u8 = 0x0A;
    pub const CC_CFG: u8 = 0x0B;

    // ADC results, big endian words, two bytes per channel
    pub const VC1_HI: u8 = 0x0C;
    pub const BAT_HI: u8 = 0x2A;
    pub const TS1_HI: u8 = 0x2C;
    pub const CC_HI: u8 = 0x32;

    // Factory calibration
    pub const ADCGAIN1: u8 = 0x50;
    pub const ADCOFFSET: u8 = 0x51;
    pub const ADCGAIN2: u8 = 0x59;
}

/// Value CC_CFG has to be programmed to, also used to detect the chip
pub const CC_CFG_VALUE: u8 = 0x19;

/// Possible I2C addresses, depending on the exact part number
pub const ADDRESSES: [u8; 2] = [0x08, 0x18];

/// Short circuit thresholds with RSNS = 1 (mV)
pub static SCD_THRESHOLDS_MV: [f32; 8] = [44.0, 67.0, 89.0, 111.0, 133.0, 155.0, 178.0, 200.0];

/// Short circuit delays (us)
pub static SCD_DELAYS_US: [f32; 4] = [70.0, 100.0, 200.0, 400.0];

/// Over-current thresholds with RSNS = 1 (mV)
pub static OCD_THRESHOLDS_MV: [f32; 16] = [
    17.0, 22.0, 28.0, 33.0, 39.0, 44.0, 50.0, 56.0, 61.0, 67.0, 72.0, 78.0, 83.0, 89.0, 94.0,
    100.0,
];

/// Over-current delays (ms)
pub static OCD_DELAYS_MS: [f32; 8] = [8.0, 20.0, 40.0, 80.0, 160.0, 320.0, 640.0, 1280.0];

/// Under-voltage delays (ms)
pub static UV_DELAYS_MS: [f32; 4] = [1000.0, 4000.0, 8000.0, 16000.0];

/// Over-voltage delays (ms)
pub static OV_DELAYS_MS: [f32; 4] = [1000.0, 2000.0, 4000.0, 8000.0];

bitflags! {
    /// Contents of SYS_STAT, write 1 to clear a bit
    pub struct SysStat: u8 {
        const CC_READY = 1 << 7;
        const DEVICE_XREADY = 1 << 5;
        const OVRD_ALERT = 1 << 4;
        const UV = 1 << 3;
        const OV = 1 << 2;
        const SCD = 1 << 1;
        const OCD = 1 << 0;
    }
}

bitflags! {
    pub struct SysCtrl1: u8 {
        const ADC_EN = 1 << 4;
        const TEMP_SEL = 1 << 3;
        const SHUT_A = 1 << 1;
        const SHUT_B = 1 << 0;
    }
}

bitflags! {
    pub struct SysCtrl2: u8 {
        const DELAY_DIS = 1 << 7;
        const CC_EN = 1 << 6;
        const CC_ONESHOT = 1 << 5;
        const DSG_ON = 1 << 1;
        const CHG_ON = 1 << 0;
    }
}

/// Double the sense voltage range of the current protections
pub const PROTECT1_RSNS: u8 = 1 << 7;

/// Field helpers for the protection registers, `(shift, mask)` pairs
pub mod fields {
    pub const SCD_DELAY: (u8, u8) = (3, 0x03);
    pub const SCD_THRESH: (u8, u8) = (0, 0x07);
    pub const OCD_DELAY: (u8, u8) = (4, 0x07);
    pub const OCD_THRESH: (u8, u8) = (0, 0x0F);
    pub const UV_DELAY: (u8, u8) = (6, 0x03);
    pub const OV_DELAY: (u8, u8) = (4, 0x03);

    /// Replaces a field in a register value
    pub fn set(reg: u8, field: (u8, u8), value: u16) -> u8 {
        let (shift, mask) = field;
        (reg & !(mask << shift)) | (((value as u8) & mask) << shift)
    }
}
