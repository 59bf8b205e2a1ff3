use chrono::{DateTime, Utc};
use num_complex::Complex64;
use rustfft::FftPlanner;
use std::f64::consts::{PI, SQRT_2};
use std::time::Duration;

/// Fewer samples than this cannot resolve a fundamental.
pub const MIN_SAMPLES: usize = 8;

const SECONDS_PER_HOUR: f64 = 3600.0;

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ComputeError {
    #[error("Non-finite {quantity} in power computation")]
    InvalidSample { quantity: &'static str },

    #[error("Power quantities indeterminate: {reason}")]
    Indeterminate { reason: &'static str },

    #[error("Voltage has {voltage} samples but current has {current}")]
    LengthMismatch { voltage: usize, current: usize },

    #[error("Need at least 8 samples, got {0}")]
    TooShort(usize),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("Measured power is zero, cannot derive a correction factor")]
    MeasuredZero,

    #[error("Non-finite {which} power: {value}")]
    NonFinite { which: &'static str, value: f64 },

    #[error("Expected power of zero would zero the current scale")]
    ExpectedZero,
}

/// One computed set of power quantities.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    /// Real power (W), time-domain mean of v·i.
    pub p: f64,
    /// Apparent power (VA).
    pub s: f64,
    /// Fundamental reactive power (var), positive when inductive.
    pub q1: f64,
    /// Signed power factor, same sign as `p`.
    pub pf: f64,
    pub phi1_deg: f64,
    pub vrms: f64,
    pub irms: f64,
    /// Fundamental frequency (Hz). Zero when the record has no AC
    /// component; `p1`, `q1`, `pf1` and `phi1_deg` then describe the DC level.
    pub f0: f64,
    pub p1: f64,
    pub pf1: f64,
    /// |Z| = Vrms / Irms (Ω).
    pub impedance: f64,
}

impl PowerSample {
    pub fn has_fundamental(&self) -> bool {
        self.f0 > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerAnalyzer {
    pub remove_dc: bool,
}

impl Default for PowerAnalyzer {
    fn default() -> Self {
        Self { remove_dc: true }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn rms(values: &[f64]) -> f64 {
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

fn finite(value: f64, quantity: &'static str) -> Result<f64, ComputeError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ComputeError::InvalidSample { quantity })
    }
}

/// AC content below this fraction of the total RMS counts as none.
const AC_FLOOR: f64 = 1e-9;
const GRID_STEPS: usize = 32;
const GOLDEN_ITERATIONS: usize = 60;
const RESYNC_INTERVAL: usize = 1024;

/// Signal energy captured by the best-fitting sinusoid plus offset at
/// `phase_step` radians per sample.
fn fitted_energy(x: &[f64], phase_step: f64) -> f64 {
    let rotation = Complex64::from_polar(1.0, phase_step);
    let mut phasor = Complex64::new(1.0, 0.0);
    let (mut sum_c, mut sum_s, mut sum_x) = (0.0, 0.0, 0.0);
    let (mut cc, mut ss, mut cs, mut xc, mut xs) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (k, &v) in x.iter().enumerate() {
        let (c, s) = (phasor.re, phasor.im);
        sum_c += c;
        sum_s += s;
        sum_x += v;
        cc += c * c;
        ss += s * s;
        cs += c * s;
        xc += v * c;
        xs += v * s;
        phasor = if (k + 1) % RESYNC_INTERVAL == 0 {
            Complex64::from_polar(1.0, phase_step * (k + 1) as f64)
        } else {
            phasor * rotation
        };
    }
    // Centring the basis is the same as fitting a constant alongside it.
    let n = x.len() as f64;
    let cc = cc - sum_c * sum_c / n;
    let ss = ss - sum_s * sum_s / n;
    let cs = cs - sum_c * sum_s / n;
    let xc = xc - sum_x * sum_c / n;
    let xs = xs - sum_x * sum_s / n;
    let det = cc * ss - cs * cs;
    if det <= 1e-12 * cc * ss || det <= 0.0 {
        return 0.0;
    }
    (ss * xc * xc - 2.0 * cs * xc * xs + cc * xs * xs) / det
}

/// Argument of the maximum of `f` on `[lo, hi]`, assuming a single peak.
fn golden_section_max(mut lo: f64, mut hi: f64, f: impl Fn(f64) -> f64) -> f64 {
    const INV_PHI: f64 = 0.618_033_988_749_894_8;
    let mut a = hi - INV_PHI * (hi - lo);
    let mut b = lo + INV_PHI * (hi - lo);
    let (mut fa, mut fb) = (f(a), f(b));
    for _ in 0..GOLDEN_ITERATIONS {
        if fa < fb {
            lo = a;
            a = b;
            fa = fb;
            b = lo + INV_PHI * (hi - lo);
            fb = f(b);
        } else {
            hi = b;
            b = a;
            fb = fa;
            a = hi - INV_PHI * (hi - lo);
            fa = f(a);
        }
    }
    0.5 * (lo + hi)
}

/// Fundamental frequency of `x`, or `None` when it has no AC component.
///
/// A Hann-windowed FFT finds the dominant bin and the Hann two-bin ratio
/// places the tone between bins. A least-squares sine fit within one bin of
/// that estimate then removes what bias is left, including the pull of the
/// negative-frequency image on windows of only a few periods.
fn fundamental_frequency(x: &[f64], dt: f64) -> Option<f64> {
    let n = x.len();
    let level = mean(x);
    let ac: Vec<f64> = x.iter().map(|v| v - level).collect();
    let ac_rms = rms(&ac);
    if ac_rms <= AC_FLOOR * rms(x) {
        return None;
    }

    let mut spectrum: Vec<Complex64> = ac
        .iter()
        .enumerate()
        .map(|(k, &v)| {
            let hann = 0.5 - 0.5 * (2.0 * PI * k as f64 / n as f64).cos();
            Complex64::new(v * hann, 0.0)
        })
        .collect();
    FftPlanner::new().plan_fft_forward(n).process(&mut spectrum);

    let half = n / 2;
    let magnitudes: Vec<f64> = spectrum[..=half].iter().map(|c| c.norm()).collect();
    let (bin, peak) = magnitudes
        .iter()
        .enumerate()
        .skip(1)
        .fold((0usize, 0.0f64), |best, (k, &m)| if m > best.1 { (k, m) } else { best });
    if bin == 0 || peak <= 0.0 {
        return None;
    }

    let left = magnitudes[bin - 1];
    let right = if bin < half { magnitudes[bin + 1] } else { 0.0 };
    let offset = if right > left {
        let ratio = right / peak;
        (2.0 * ratio - 1.0) / (ratio + 1.0)
    } else {
        let ratio = left / peak;
        -(2.0 * ratio - 1.0) / (ratio + 1.0)
    };

    let bin_width = 1.0 / (n as f64 * dt);
    let nyquist = 0.5 / dt;
    let coarse = (bin as f64 + offset.clamp(-1.0, 1.0)) * bin_width;
    let lo = (coarse - bin_width).max(0.1 * bin_width);
    let hi = (coarse + bin_width).min(nyquist);
    if hi <= lo {
        return Some(coarse);
    }

    let energy = |f: f64| fitted_energy(&ac, 2.0 * PI * f * dt);
    let step = (hi - lo) / GRID_STEPS as f64;
    let best = (0..=GRID_STEPS)
        .map(|k| (k as f64).mul_add(step, lo))
        .map(|f| (f, energy(f)))
        .fold((coarse, f64::NEG_INFINITY), |best, (f, e)| if e > best.1 { (f, e) } else { best })
        .0;
    let refined = golden_section_max((best - step).max(lo), (best + step).min(hi), energy);
    log::trace!("f0 coarse {:.6}Hz, refined {:.6}Hz", coarse, refined);
    Some(refined)
}

/// RMS phasor of `x` at angular frequency `omega`.
fn phasor(x: &[f64], omega: f64, dt: f64) -> Complex64 {
    let sum: Complex64 = x
        .iter()
        .enumerate()
        .map(|(n, &v)| Complex64::from_polar(v, -omega * n as f64 * dt))
        .sum();
    sum * (SQRT_2 / x.len() as f64)
}

/// Samples covering the largest whole number of periods of `f0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_period_len(len: usize, f0: f64, dt: f64) -> usize {
    let periods = (len as f64 * dt * f0 + 1e-9).floor();
    if periods < 1.0 {
        return len;
    }
    let samples = (periods / f0 / dt).round() as usize;
    samples.clamp(1, len)
}

impl PowerAnalyzer {
    pub fn new(remove_dc: bool) -> Self {
        Self { remove_dc }
    }

    /// Compute one [`PowerSample`] from aligned voltage and current arrays
    /// spaced `dt` seconds apart.
    pub fn analyze(
        &self,
        voltage: &[f64],
        current: &[f64],
        dt: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<PowerSample, ComputeError> {
        if voltage.len() != current.len() {
            return Err(ComputeError::LengthMismatch {
                voltage: voltage.len(),
                current: current.len(),
            });
        }
        if voltage.len() < MIN_SAMPLES {
            return Err(ComputeError::TooShort(voltage.len()));
        }
        if !(dt.is_finite() && dt > 0.0) {
            return Err(ComputeError::InvalidSample {
                quantity: "sample interval",
            });
        }
        if voltage.iter().any(|v| !v.is_finite()) {
            return Err(ComputeError::InvalidSample { quantity: "voltage" });
        }
        if current.iter().any(|i| !i.is_finite()) {
            return Err(ComputeError::InvalidSample { quantity: "current" });
        }

        let (v, i) = if self.remove_dc {
            let (v_mean, i_mean) = (mean(voltage), mean(current));
            (
                voltage.iter().map(|v| v - v_mean).collect::<Vec<_>>(),
                current.iter().map(|i| i - i_mean).collect::<Vec<_>>(),
            )
        } else {
            (voltage.to_vec(), current.to_vec())
        };

        let vrms = finite(rms(&v), "Vrms")?;
        let irms = finite(rms(&i), "Irms")?;
        let p = finite(
            v.iter().zip(&i).map(|(v, i)| v * i).sum::<f64>() / v.len() as f64,
            "P",
        )?;
        let s = finite(vrms * irms, "S")?;
        if s == 0.0 {
            return Err(ComputeError::Indeterminate {
                reason: "apparent power is zero",
            });
        }

        let pf = finite((p / s).abs().copysign(p), "PF")?;

        let fundamental = fundamental_frequency(&v, dt).or_else(|| fundamental_frequency(&i, dt));
        let (f0, p1, q1, pf1) = match fundamental {
            Some(f0) => {
                let f0 = finite(f0, "f0")?;
                let window = whole_period_len(v.len(), f0, dt);
                let omega = 2.0 * PI * f0;
                let u1 = phasor(&v[..window], omega, dt);
                let i1 = phasor(&i[..window], omega, dt);
                let s1 = u1 * i1.conj();
                let p1 = finite(s1.re, "P1")?;
                let q1 = finite(s1.im, "Q1")?;
                let s1_abs = s1.norm();
                if s1_abs == 0.0 {
                    return Err(ComputeError::Indeterminate {
                        reason: "fundamental apparent power is zero",
                    });
                }
                (f0, p1, q1, finite(p1 / s1_abs, "PF1")?)
            }
            // Pure DC: the level itself is the fundamental.
            None => {
                log::debug!("No AC component, reporting DC power");
                (0.0, p, 0.0, pf)
            }
        };

        let phi1_deg = finite(q1.atan2(p1).to_degrees(), "phi1")?;
        let impedance = finite(vrms / irms, "impedance")?;

        log::trace!(
            "analyzed {} samples: f0={:.3}Hz P={:.4}W Q1={:.4}var",
            v.len(),
            f0,
            p,
            q1
        );

        Ok(PowerSample {
            timestamp,
            p,
            s,
            q1,
            pf,
            phi1_deg,
            vrms,
            irms,
            f0,
            p1,
            pf1,
            impedance,
        })
    }
}

/// New correction factor `expected / measured`, where `measured` was taken
/// with a correction of 1.
pub fn auto_calibrate(expected: f64, measured: f64) -> Result<f64, CalibrationError> {
    if !measured.is_finite() {
        return Err(CalibrationError::NonFinite {
            which: "measured",
            value: measured,
        });
    }
    if !expected.is_finite() {
        return Err(CalibrationError::NonFinite {
            which: "expected",
            value: expected,
        });
    }
    if measured == 0.0 {
        return Err(CalibrationError::MeasuredZero);
    }
    if expected == 0.0 {
        return Err(CalibrationError::ExpectedZero);
    }
    let correction = expected / measured;
    if !correction.is_finite() {
        return Err(CalibrationError::NonFinite {
            which: "correction",
            value: correction,
        });
    }
    Ok(correction)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnergySnapshot {
    pub e_p_wh: f64,
    pub e_s_vah: f64,
    pub e_q_varh: f64,
    pub elapsed: Duration,
    pub samples: u64,
}

/// Average-based energy: `E = mean(X) * active hours`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnergyAccumulator {
    sum_p: f64,
    sum_s: f64,
    sum_q1: f64,
    samples: u64,
    elapsed: Duration,
}

impl EnergyAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sample seen after `active_elapsed` of measuring time.
    pub fn record(&mut self, sample: &PowerSample, active_elapsed: Duration) {
        self.sum_p += sample.p;
        self.sum_s += sample.s;
        self.sum_q1 += sample.q1;
        self.samples += 1;
        self.elapsed = self.elapsed.max(active_elapsed);
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn mean_p(&self) -> f64 {
        self.mean(self.sum_p)
    }

    pub fn mean_s(&self) -> f64 {
        self.mean(self.sum_s)
    }

    pub fn mean_q1(&self) -> f64 {
        self.mean(self.sum_q1)
    }

    fn mean(&self, sum: f64) -> f64 {
        if self.samples == 0 {
            0.0
        } else {
            sum / self.samples as f64
        }
    }

    /// Energies at the elapsed time of the latest sample.
    pub fn snapshot(&self) -> EnergySnapshot {
        self.snapshot_at(self.elapsed)
    }

    /// Energies over `active_elapsed` of measuring time.
    pub fn snapshot_at(&self, active_elapsed: Duration) -> EnergySnapshot {
        let hours = active_elapsed.as_secs_f64() / SECONDS_PER_HOUR;
        EnergySnapshot {
            e_p_wh: self.mean_p() * hours,
            e_s_vah: self.mean_s() * hours,
            e_q_varh: self.mean_q1() * hours,
            elapsed: active_elapsed,
            samples: self.samples,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
