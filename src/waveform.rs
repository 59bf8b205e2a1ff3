use crate::acquisition_config::AcquisitionConfig;
use crate::instrument_link::{Channel, InstrumentLink, LinkError, LinkSession};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::ops::{Deref, DerefMut};

pub const TIME_COLUMN_NAME: &str = "time";
pub const VOLTAGE_COLUMN_NAME: &str = "voltage";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("Preamble has {0} fields, expected 10")]
    PreambleFields(usize),

    #[error("Preamble field '{field}' is not a number: '{value}'")]
    PreambleValue { field: &'static str, value: String },

    #[error("Empty waveform data")]
    Empty,

    #[error("Invalid time increment {0}")]
    TimeIncrement(f64),
}

#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    #[error("{channel}: {source}")]
    Link { channel: Channel, source: LinkError },

    #[error("{channel}: {source}")]
    Decode { channel: Channel, source: DecodeError },
}

impl AcquireError {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Link { channel, .. } | Self::Decode { channel, .. } => *channel,
        }
    }
}

/// Parsed `:WAV:PRE?` answer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preamble {
    pub points: u32,
    pub x_increment: f64,
    pub x_origin: f64,
    pub x_reference: f64,
    pub y_increment: f64,
    pub y_origin: f64,
    pub y_reference: f64,
}

impl Preamble {
    const FIELDS: [&'static str; 10] = [
        "format", "type", "points", "count", "xincrement", "xorigin", "xreference", "yincrement",
        "yorigin", "yreference",
    ];

    pub fn parse(response: &str) -> Result<Self, DecodeError> {
        let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
        if fields.len() < Self::FIELDS.len() {
            return Err(DecodeError::PreambleFields(fields.len()));
        }
        let number = |index: usize| -> Result<f64, DecodeError> {
            fields[index]
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| DecodeError::PreambleValue {
                    field: Self::FIELDS[index],
                    value: fields[index].to_string(),
                })
        };

        let x_increment = number(4)?;
        if x_increment <= 0.0 {
            return Err(DecodeError::TimeIncrement(x_increment));
        }
        Ok(Self {
            points: number(2)? as u32,
            x_increment,
            x_origin: number(5)?,
            x_reference: number(6)?,
            y_increment: number(7)?,
            y_origin: number(8)?,
            y_reference: number(9)?,
        })
    }
}

/// One decoded channel record in volts (or the channel's native unit).
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformRecord {
    samples: Vec<f64>,
    x_increment: f64,
    x_origin: f64,
    y_increment: f64,
    y_origin: f64,
    y_reference: f64,
    acquired_at: DateTime<Utc>,
}

/// `v[n] = (raw[n] - y_ref) * y_inc + y_origin`
pub fn decode(preamble: &Preamble, raw: &[u8]) -> Result<WaveformRecord, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    if preamble.points as usize != raw.len() {
        log::debug!(
            "Preamble announced {} points, block carried {}",
            preamble.points,
            raw.len()
        );
    }
    let samples = raw
        .iter()
        .map(|&r| (f64::from(r) - preamble.y_reference) * preamble.y_increment + preamble.y_origin)
        .collect();
    Ok(WaveformRecord {
        samples,
        x_increment: preamble.x_increment,
        x_origin: preamble.x_origin,
        y_increment: preamble.y_increment,
        y_origin: preamble.y_origin,
        y_reference: preamble.y_reference,
        acquired_at: Utc::now(),
    })
}

impl WaveformRecord {
    /// Record from already-scaled samples.
    pub fn from_samples(samples: Vec<f64>, x_increment: f64, x_origin: f64) -> Self {
        Self {
            samples,
            x_increment,
            x_origin,
            y_increment: 1.0,
            y_origin: 0.0,
            y_reference: 0.0,
            acquired_at: Utc::now(),
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f64> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn x_increment(&self) -> f64 {
        self.x_increment
    }

    pub fn x_origin(&self) -> f64 {
        self.x_origin
    }

    pub fn y_increment(&self) -> f64 {
        self.y_increment
    }

    pub fn y_origin(&self) -> f64 {
        self.y_origin
    }

    pub fn y_reference(&self) -> f64 {
        self.y_reference
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Time span covered, first to last sample.
    pub fn duration(&self) -> f64 {
        self.x_increment * self.samples.len().saturating_sub(1) as f64
    }

    /// Time of sample `n`.
    pub fn time_at(&self, n: usize) -> f64 {
        (n as f64).mul_add(self.x_increment, self.x_origin)
    }

    /// Linear interpolation of this record at the sample times of a
    /// `count`-point axis starting at `x_origin` with step `x_increment`.
    /// Times outside this record take its first or last sample.
    pub fn resampled_onto(&self, x_origin: f64, x_increment: f64, count: usize) -> Self {
        let n = self.samples.len();
        let samples: Vec<f64> = if n == 0 {
            Vec::new()
        } else {
            let last = (n - 1) as f64;
            (0..count)
                .map(|k| {
                    let t = (k as f64).mul_add(x_increment, x_origin);
                    let position = ((t - self.x_origin) / self.x_increment).clamp(0.0, last);
                    let left = (position.floor() as usize).min(n - 1);
                    let right = (left + 1).min(n - 1);
                    let frac = position - left as f64;
                    self.samples[left].mul_add(1.0 - frac, self.samples[right] * frac)
                })
                .collect()
        };
        Self {
            samples,
            x_increment,
            x_origin,
            y_increment: self.y_increment,
            y_origin: self.y_origin,
            y_reference: self.y_reference,
            acquired_at: self.acquired_at,
        }
    }

    /// Polars frame with `time` and `voltage` columns.
    pub fn to_lazy_frame(&self) -> Result<LazyFrame, PolarsError> {
        let voltage: Column = Series::new(VOLTAGE_COLUMN_NAME.into(), self.samples.clone()).into();
        let df = DataFrame::new(vec![voltage])?;
        Ok(df
            .lazy()
            .with_row_index("row_index", Some(0))
            .with_columns([(col("row_index").cast(DataType::Float64) * lit(self.x_increment)
                + lit(self.x_origin))
            .alias(TIME_COLUMN_NAME)])
            .select([col(TIME_COLUMN_NAME), col(VOLTAGE_COLUMN_NAME)]))
    }
}

/// Bring two records onto one time axis so index `n` means the same instant.
///
/// The longer record is interpolated at the shorter record's sample times;
/// afterwards both share `x_origin` and `x_increment`.
pub fn align(voltage: WaveformRecord, current: WaveformRecord) -> (WaveformRecord, WaveformRecord) {
    let same_axis = voltage.len() == current.len()
        && voltage.x_origin == current.x_origin
        && voltage.x_increment == current.x_increment;
    if same_axis {
        return (voltage, current);
    }
    if voltage.len() > current.len() {
        log::debug!("Resampling voltage record {} -> {} points", voltage.len(), current.len());
        let voltage = voltage.resampled_onto(current.x_origin, current.x_increment, current.len());
        (voltage, current)
    } else {
        log::debug!("Resampling current record {} -> {} points", current.len(), voltage.len());
        let current = current.resampled_onto(voltage.x_origin, voltage.x_increment, voltage.len());
        (voltage, current)
    }
}

/// Holds the instrument in `:STOP` and sends `:RUN` when dropped.
pub struct AcquisitionHalt<'s, 'l> {
    session: &'s mut LinkSession<'l>,
}

impl<'s, 'l> AcquisitionHalt<'s, 'l> {
    pub fn engage(session: &'s mut LinkSession<'l>) -> Result<Self, LinkError> {
        session.write(":STOP")?;
        log::debug!("Acquisition stopped for memory readout");
        Ok(Self { session })
    }
}

impl<'l> Deref for AcquisitionHalt<'_, 'l> {
    type Target = LinkSession<'l>;

    fn deref(&self) -> &Self::Target {
        &*self.session
    }
}

impl DerefMut for AcquisitionHalt<'_, '_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.session
    }
}

impl Drop for AcquisitionHalt<'_, '_> {
    fn drop(&mut self) {
        match self.session.write(":RUN") {
            Ok(()) => log::debug!("Acquisition resumed"),
            Err(e) => log::error!("Failed to resume acquisition: {}", e),
        }
    }
}

/// Read one channel through an already held link session.
pub fn fetch_waveform(
    session: &mut LinkSession<'_>,
    channel: Channel,
    config: &AcquisitionConfig,
) -> Result<WaveformRecord, AcquireError> {
    let link_err = |source| AcquireError::Link { channel, source };

    for command in config.into_setup_commands(channel) {
        session.execute(&command).map_err(link_err)?;
    }
    // The first preamble after a source change still describes the old source.
    session.query(":WAV:PRE?").map_err(link_err)?;
    std::thread::sleep(config.settle);
    let preamble = Preamble::parse(&session.query(":WAV:PRE?").map_err(link_err)?)
        .map_err(|source| AcquireError::Decode { channel, source })?;

    let raw = if config.bulk {
        let total = preamble.points.min(config.points);
        let mut raw = Vec::with_capacity(total as usize);
        for (start, stop) in config.chunk_ranges(total) {
            session.write(&format!(":WAV:STAR {}", start)).map_err(link_err)?;
            session.write(&format!(":WAV:STOP {}", stop)).map_err(link_err)?;
            raw.extend(session.query_block(":WAV:DATA?").map_err(link_err)?);
        }
        raw
    } else {
        session.query_block(":WAV:DATA?").map_err(link_err)?
    };

    if (raw.len() as u64) < u64::from(config.points.min(preamble.points)) {
        log::warn!(
            "{}: only received {} samples (requested {})",
            channel,
            raw.len(),
            config.points
        );
    }
    decode(&preamble, &raw).map_err(|source| AcquireError::Decode { channel, source })
}

/// Fetch voltage and current records in one exclusive link hold and align them.
pub fn fetch_pair(
    link: &InstrumentLink,
    voltage: Channel,
    current: Channel,
    config: &AcquisitionConfig,
) -> Result<(WaveformRecord, WaveformRecord), AcquireError> {
    let mut session = link
        .exclusive()
        .map_err(|source| AcquireError::Link { channel: voltage, source })?;
    fetch_pair_in(&mut session, voltage, current, config)
}

/// [`fetch_pair`] through a session the caller already holds.
pub fn fetch_pair_in(
    session: &mut LinkSession<'_>,
    voltage: Channel,
    current: Channel,
    config: &AcquisitionConfig,
) -> Result<(WaveformRecord, WaveformRecord), AcquireError> {
    let (v, i) = if config.bulk {
        let mut halted = AcquisitionHalt::engage(session)
            .map_err(|source| AcquireError::Link { channel: voltage, source })?;
        let v = fetch_waveform(&mut halted, voltage, config)?;
        let i = fetch_waveform(&mut halted, current, config)?;
        (v, i)
    } else {
        let v = fetch_waveform(session, voltage, config)?;
        let i = fetch_waveform(session, current, config)?;
        (v, i)
    };
    Ok(align(v, i))
}
