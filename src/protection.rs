//! Programming of the hardware protection limits
//!
//! Each `apply_*` function quantizes the requested limits from [`BmsConfig`] to
//! what the AFE supports, writes them and stores the achieved values back into
//! the configuration. The configuration is only touched once the write went
//! through, so after an error it still holds the request.

use crate::afe::Afe;
use crate::config::BmsConfig;
#[cfg(feature = "defmt")]
use crate::fmt::*;
use crate::quantizer::{Encoding, Rounding};
use crate::Error;

/// Over-temperature limits have to be at least this far above the matching
/// under-temperature limit (°C)
pub const MIN_TEMP_WINDOW: f32 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtectionKind {
    /// Threshold in V, delay in ms
    CellOvervoltage,
    /// Threshold in V, delay in ms
    CellUndervoltage,
    /// Threshold in mV across the shunt, delay in us
    ShortCircuit,
    /// Threshold in mV across the shunt, delay in ms
    DisOvercurrent,
    /// Threshold in mV across the shunt, delay in ms
    ChgOvercurrent,
    /// Threshold in °C
    ChgOvertemp,
    ChgUndertemp,
    DisOvertemp,
    DisUndertemp,
}

/// How a protection is released again
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResetEncoding {
    /// The chip has no release threshold, the fault manager checks the reset
    /// value in software
    Software,
    /// The chip releases the protection at the threshold minus (for upper
    /// limits) or plus (for lower limits) a programmable hysteresis
    Hysteresis(Encoding),
}

/// Register layout of one protection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionEncoding {
    pub threshold: Encoding,
    /// `None` if the delay is fixed or not configurable
    pub delay: Option<Encoding>,
    pub reset: ResetEncoding,
}

/// Raw codes handed to [`Afe::write_protection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProtectionCodes {
    pub threshold: u16,
    pub delay: Option<u16>,
    pub hysteresis: Option<u16>,
}

/// Direction of a limit. Upper limits may only move down, lower limits up.
#[derive(Clone, Copy, PartialEq)]
enum Bound {
    Upper,
    Lower,
}

struct Request {
    limit: f32,
    delay: f32,
    /// Requested distance between limit and release point, always positive
    hysteresis: f32,
    bound: Bound,
}

struct Achieved {
    limit: f32,
    delay: Option<f32>,
    /// Release point derived from the achieved limit
    reset: f32,
    /// Hysteresis the chip actually applies, `None` for software release
    hysteresis: Option<f32>,
}

async fn program<A, const N: usize>(
    afe: &mut A,
    kind: ProtectionKind,
    request: Request,
) -> Result<Option<Achieved>, Error<A::Error>>
where
    A: Afe<N>,
{
    let encoding = match afe.protection_encoding(kind) {
        Some(encoding) => encoding,
        None => return Ok(None),
    };

    let rounding = match request.bound {
        Bound::Upper => Rounding::Down,
        Bound::Lower => Rounding::Up,
    };

    let (threshold, limit) = encoding.threshold.apply(request.limit, rounding);

    let delay = encoding
        .delay
        .map(|e| e.apply(request.delay, Rounding::Nearest));

    let hysteresis = match encoding.reset {
        ResetEncoding::Software => None,
        ResetEncoding::Hysteresis(e) => {
            let raw = e
                .quantize(request.hysteresis, Rounding::Nearest)
                .max(e.first_positive());
            Some((raw, e.value(raw)))
        }
    };

    let codes = ProtectionCodes {
        threshold,
        delay: delay.map(|(raw, _)| raw),
        hysteresis: hysteresis.map(|(raw, _)| raw),
    };

    debug!("{:?}: writing {:?}", kind, codes);
    afe.write_protection(kind, codes).await?;

    let hyst = hysteresis.map_or(request.hysteresis, |(_, v)| v);
    let reset = match request.bound {
        Bound::Upper => limit - hyst,
        Bound::Lower => limit + hyst,
    };

    Ok(Some(Achieved {
        limit,
        delay: delay.map(|(_, v)| v),
        reset,
        hysteresis: hysteresis.map(|(_, v)| v),
    }))
}

fn round_delay(value: f32) -> u32 {
    libm::roundf(value).max(0.0) as u32
}

/// Cell over-voltage protection. The reset voltage keeps its distance to the limit.
pub async fn apply_cell_ovp<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    let request = Request {
        limit: config.cell_ov_limit,
        delay: config.cell_ov_delay_ms as f32,
        hysteresis: (config.cell_ov_limit - config.cell_ov_reset).max(0.0),
        bound: Bound::Upper,
    };

    let achieved = match program::<A, N>(afe, ProtectionKind::CellOvervoltage, request).await? {
        Some(achieved) => achieved,
        None => return Err(Error::NotSupported),
    };

    config.cell_ov_limit = achieved.limit;
    config.cell_ov_reset = achieved.reset;
    if let Some(delay) = achieved.delay {
        config.cell_ov_delay_ms = round_delay(delay);
    }

    Ok(())
}

/// Cell under-voltage protection. The reset voltage keeps its distance to the limit.
pub async fn apply_cell_uvp<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    let request = Request {
        limit: config.cell_uv_limit,
        delay: config.cell_uv_delay_ms as f32,
        hysteresis: (config.cell_uv_reset - config.cell_uv_limit).max(0.0),
        bound: Bound::Lower,
    };

    let achieved = match program::<A, N>(afe, ProtectionKind::CellUndervoltage, request).await? {
        Some(achieved) => achieved,
        None => return Err(Error::NotSupported),
    };

    config.cell_uv_limit = achieved.limit;
    config.cell_uv_reset = achieved.reset;
    if let Some(delay) = achieved.delay {
        config.cell_uv_delay_ms = round_delay(delay);
    }

    Ok(())
}

/// Discharge short circuit protection
pub async fn apply_dis_scp<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    let request = Request {
        limit: config.dis_sc_limit * config.shunt_res_mohm,
        delay: config.dis_sc_delay_us as f32,
        hysteresis: 0.0,
        bound: Bound::Upper,
    };

    let achieved = match program::<A, N>(afe, ProtectionKind::ShortCircuit, request).await? {
        Some(achieved) => achieved,
        None => return Err(Error::NotSupported),
    };

    config.dis_sc_limit = achieved.limit / config.shunt_res_mohm;
    if let Some(delay) = achieved.delay {
        config.dis_sc_delay_us = round_delay(delay);
    }

    Ok(())
}

/// Discharge over-current protection
pub async fn apply_dis_ocp<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    let request = Request {
        limit: config.dis_oc_limit * config.shunt_res_mohm,
        delay: config.dis_oc_delay_ms as f32,
        hysteresis: 0.0,
        bound: Bound::Upper,
    };

    let achieved = match program::<A, N>(afe, ProtectionKind::DisOvercurrent, request).await? {
        Some(achieved) => achieved,
        None => return Err(Error::NotSupported),
    };

    config.dis_oc_limit = achieved.limit / config.shunt_res_mohm;
    if let Some(delay) = achieved.delay {
        config.dis_oc_delay_ms = round_delay(delay);
    }

    Ok(())
}

/// Charge over-current protection. Many chips can't do this in hardware, the
/// fault manager then checks the limit in software and this returns
/// [`Error::NotSupported`].
pub async fn apply_chg_ocp<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    let request = Request {
        limit: config.chg_oc_limit * config.shunt_res_mohm,
        delay: config.chg_oc_delay_ms as f32,
        hysteresis: 0.0,
        bound: Bound::Upper,
    };

    let achieved = match program::<A, N>(afe, ProtectionKind::ChgOvercurrent, request).await? {
        Some(achieved) => achieved,
        None => return Err(Error::NotSupported),
    };

    config.chg_oc_limit = achieved.limit / config.shunt_res_mohm;
    if let Some(delay) = achieved.delay {
        config.chg_oc_delay_ms = round_delay(delay);
    }

    Ok(())
}

/// Checks that the temperature windows make sense before anything is written
pub fn check_temp_limits(config: &BmsConfig) -> bool {
    config.dis_ot_limit >= 0.0
        && config.chg_ot_limit >= 0.0
        && config.dis_ot_limit >= config.dis_ut_limit + MIN_TEMP_WINDOW
        && config.chg_ot_limit >= config.chg_ut_limit + MIN_TEMP_WINDOW
}

/// Temperature protection for charging and discharging. Limits the chip can't
/// handle stay as configured and are evaluated in software.
pub async fn apply_temp_limits<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    if !check_temp_limits(config) {
        warn!("implausible temperature limits");
        return Err(Error::InvalidConfig);
    }

    let limits = [
        (ProtectionKind::DisOvertemp, config.dis_ot_limit, Bound::Upper),
        (ProtectionKind::DisUndertemp, config.dis_ut_limit, Bound::Lower),
        (ProtectionKind::ChgOvertemp, config.chg_ot_limit, Bound::Upper),
        (ProtectionKind::ChgUndertemp, config.chg_ut_limit, Bound::Lower),
    ];

    for (kind, limit, bound) in limits {
        let request = Request {
            limit,
            delay: 0.0,
            hysteresis: config.t_limit_hyst,
            bound,
        };

        let achieved = match program::<A, N>(afe, kind, request).await? {
            Some(achieved) => achieved,
            None => {
                debug!("{:?}: checked in software", kind);
                continue;
            }
        };

        match kind {
            ProtectionKind::DisOvertemp => config.dis_ot_limit = achieved.limit,
            ProtectionKind::DisUndertemp => config.dis_ut_limit = achieved.limit,
            ProtectionKind::ChgOvertemp => config.chg_ot_limit = achieved.limit,
            _ => config.chg_ut_limit = achieved.limit,
        }

        if let Some(hyst) = achieved.hysteresis {
            config.t_limit_hyst = hyst;
        }
    }

    Ok(())
}

/// Applies all protections. Charge over-current protection missing in hardware
/// is not an error.
pub async fn apply_all<A, const N: usize>(
    afe: &mut A,
    config: &mut BmsConfig,
) -> Result<(), Error<A::Error>>
where
    A: Afe<N>,
{
    apply_cell_ovp::<A, N>(afe, config).await?;
    apply_cell_uvp::<A, N>(afe, config).await?;
    apply_dis_scp::<A, N>(afe, config).await?;
    apply_dis_ocp::<A, N>(afe, config).await?;

    match apply_chg_ocp::<A, N>(afe, config).await {
        Err(Error::NotSupported) => info!("charge over-current checked in software"),
        other => other?,
    }

    apply_temp_limits::<A, N>(afe, config).await
}
