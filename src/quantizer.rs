//! Mapping of physical setpoints onto the discrete settings an AFE supports.
//!
//! Every protection register describes its value range with an [`Encoding`]. The
//! quantizer picks the raw register code for a requested value and reports which
//! physical value that code actually represents, so callers can write the
//! achieved (possibly coarser) limit back into the configuration.

/// Raw codes within this distance of an integer count as exact hits, so
/// re-applying an achieved value yields the same code despite float noise
const CODE_EPSILON: f32 = 1e-3;

/// Direction in which a value is allowed to move when no exact setting exists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Rounding {
    /// Closest setting not above the request (upper limits)
    Down,
    /// Closest setting not below the request (lower limits)
    Up,
    /// Closest setting in either direction (delays, hysteresis). Enumerated
    /// tables still take the next lower entry.
    Nearest,
}

/// Description of the settings a register field can hold
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Encoding {
    /// Enumerated settings in ascending order, the raw code is the table index
    Table(&'static [f32]),
    /// `value = offset + raw * gain` with `raw` limited to `min..=max`.
    /// `gain` has to be positive.
    Linear {
        offset: f32,
        gain: f32,
        min: u16,
        max: u16,
    },
    /// Look-up table of `(value, raw)` points, linearly interpolated in between.
    /// Values must be ascending, raw codes monotonic in either direction.
    Lut(&'static [(f32, f32)]),
}

impl Encoding {
    /// Finds the raw code for `target`, clamped to the supported range
    pub fn quantize(&self, target: f32, rounding: Rounding) -> u16 {
        match *self {
            Encoding::Table(table) => quantize_table(table, target, rounding),
            Encoding::Linear {
                offset,
                gain,
                min,
                max,
            } => {
                let exact = (target - offset) / gain;
                let raw = match rounding {
                    Rounding::Down => libm::floorf(exact + CODE_EPSILON),
                    Rounding::Up => libm::ceilf(exact - CODE_EPSILON),
                    Rounding::Nearest => libm::roundf(exact),
                };

                clamp_code(raw, min, max)
            }
            Encoding::Lut(points) => quantize_lut(points, target, rounding),
        }
    }

    /// Physical value represented by a raw code
    pub fn value(&self, raw: u16) -> f32 {
        match *self {
            Encoding::Table(table) => match table.get(raw as usize) {
                Some(v) => *v,
                None => table.last().copied().unwrap_or(0.0),
            },
            Encoding::Linear { offset, gain, .. } => offset + raw as f32 * gain,
            Encoding::Lut(points) => {
                let (values, raws) = split_points(points);
                interpolate_by(raws, values, points.len(), raw as f32)
            }
        }
    }

    /// Quantizes `target` and returns the raw code together with its achieved value
    pub fn apply(&self, target: f32, rounding: Rounding) -> (u16, f32) {
        let raw = self.quantize(target, rounding);
        (raw, self.value(raw))
    }

    /// Smallest code describing a strictly positive step, used for hysteresis
    /// settings which must never collapse to zero
    pub fn first_positive(&self) -> u16 {
        match *self {
            Encoding::Table(table) => table.iter().position(|v| *v > 0.0).unwrap_or(0) as u16,
            Encoding::Linear {
                offset,
                gain,
                min,
                max,
            } => {
                let mut raw = min;
                while raw < max && offset + raw as f32 * gain <= 0.0 {
                    raw += 1;
                }
                raw
            }
            Encoding::Lut(_) => {
                let (raw, _) = self.apply(0.0, Rounding::Up);
                if self.value(raw) > 0.0 {
                    raw
                } else {
                    raw.saturating_add(1)
                }
            }
        }
    }
}

fn clamp_code(raw: f32, min: u16, max: u16) -> u16 {
    if raw <= min as f32 {
        min
    } else if raw >= max as f32 {
        max
    } else {
        raw as u16
    }
}

/// Largest index whose value does not exceed the target (index 0 if none does),
/// or for [`Rounding::Up`] the smallest index not below it (last index if none is)
fn quantize_table(table: &[f32], target: f32, rounding: Rounding) -> u16 {
    match rounding {
        Rounding::Down | Rounding::Nearest => {
            for i in (1..table.len()).rev() {
                if target >= table[i] {
                    return i as u16;
                }
            }
            0
        }
        Rounding::Up => {
            for (i, v) in table.iter().enumerate() {
                if target <= *v {
                    return i as u16;
                }
            }
            table.len().saturating_sub(1) as u16
        }
    }
}

fn quantize_lut(points: &'static [(f32, f32)], target: f32, rounding: Rounding) -> u16 {
    let (values, raws) = split_points(points);
    let exact = interpolate_by(values, raws, points.len(), target);

    let lo = clamp_code(libm::floorf(exact), 0, u16::MAX);
    let hi = clamp_code(libm::ceilf(exact), 0, u16::MAX);
    let encoding = Encoding::Lut(points);
    let (v_lo, v_hi) = (encoding.value(lo), encoding.value(hi));

    // the raw axis may run in either direction, so decide on the physical values
    let (below, above) = if v_lo <= v_hi {
        ((lo, v_lo), (hi, v_hi))
    } else {
        ((hi, v_hi), (lo, v_lo))
    };

    match rounding {
        Rounding::Down => {
            if above.1 <= target {
                above.0
            } else {
                below.0
            }
        }
        Rounding::Up => {
            if below.1 >= target {
                below.0
            } else {
                above.0
            }
        }
        Rounding::Nearest => libm::roundf(exact).clamp(0.0, u16::MAX as f32) as u16,
    }
}

// Keeps the LUT data in one static table while still being able to feed
// separate axes to the interpolation below
fn split_points(points: &[(f32, f32)]) -> (impl Fn(usize) -> f32 + '_, impl Fn(usize) -> f32 + '_) {
    (move |i: usize| points[i].0, move |i: usize| points[i].1)
}

/// Interpolation in a look-up table. Values of `a` must be monotonically
/// increasing or decreasing. Values outside the table are clamped to the
/// corresponding end of `b`.
pub fn interpolate(a: &[f32], b: &[f32], value_a: f32) -> f32 {
    let size = a.len().min(b.len());
    interpolate_by(|i| a[i], |i| b[i], size, value_a)
}

pub(crate) fn interpolate_by(a: impl Fn(usize) -> f32, b: impl Fn(usize) -> f32, size: usize, value_a: f32) -> f32 {
    if size == 0 {
        return 0.0;
    }

    let ascending = a(0) < a(size - 1);

    for i in 0..size {
        let reached = if ascending {
            value_a <= a(i)
        } else {
            value_a >= a(i)
        };

        if reached {
            if i == 0 {
                return b(0);
            }

            return b(i - 1) + (b(i) - b(i - 1)) * (value_a - a(i - 1)) / (a(i) - a(i - 1));
        }
    }

    b(size - 1)
}
