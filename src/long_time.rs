use crate::acquisition_config::{AcquisitionConfig, AcquisitionConfigError};
use crate::instrument_link::{Channel, ChannelUnit, InstrumentLink, LinkError};
use crate::power_log::TIMESTAMP_COLUMN_NAME;
use crate::probe::{resolve_scaling, ProbeScalingConfig};
use crate::session::SessionArbiter;
use crate::waveform::{fetch_waveform, AcquireError};
use chrono::{DateTime, Utc};
use polars::prelude::*;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum LongTimeConfigError {
    #[error("No channels selected")]
    NoChannels,

    #[error("{0} selected twice")]
    DuplicateChannel(Channel),

    #[error("Logging interval must be positive")]
    ZeroInterval,

    #[error(transparent)]
    Acquisition(#[from] AcquisitionConfigError),
}

/// Peak-to-peak, mean and RMS of one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelStats {
    pub vpp: f64,
    pub vavg: f64,
    pub vrms: f64,
}

impl ChannelStats {
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        let n = samples.len() as f64;
        Some(Self {
            vpp: max - min,
            vavg: samples.iter().sum::<f64>() / n,
            vrms: (samples.iter().map(|v| v * v).sum::<f64>() / n).sqrt(),
        })
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            vpp: self.vpp * factor,
            vavg: self.vavg * factor,
            vrms: self.vrms * factor,
        }
    }
}

/// A logged channel. With a probe, non-AMP readings are converted to amps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LongTimeChannel {
    pub channel: Channel,
    pub probe: Option<ProbeScalingConfig>,
}

impl From<Channel> for LongTimeChannel {
    fn from(channel: Channel) -> Self {
        Self { channel, probe: None }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LongTimeConfig {
    pub channels: Vec<LongTimeChannel>,
    pub include_vavg: bool,
    pub include_vrms: bool,
    pub interval: Duration,
    pub duration: Option<Duration>,
    pub acquisition: AcquisitionConfig,
}

impl LongTimeConfig {
    pub fn builder() -> LongTimeBuilder {
        LongTimeBuilder {
            channels: Vec::new(),
            include_vavg: false,
            include_vrms: false,
            interval: Duration::from_secs(1),
            duration: None,
            acquisition: None,
        }
    }

    /// CSV columns: timestamp, then `<ch>_Vpp[, <ch>_Vavg][, <ch>_Vrms]` per channel.
    pub fn header(&self) -> Vec<String> {
        let mut header = vec![TIMESTAMP_COLUMN_NAME.to_string()];
        for entry in &self.channels {
            header.push(format!("{}_Vpp", entry.channel));
            if self.include_vavg {
                header.push(format!("{}_Vavg", entry.channel));
            }
            if self.include_vrms {
                header.push(format!("{}_Vrms", entry.channel));
            }
        }
        header
    }

    /// Number of cycles that fit in the configured duration.
    pub fn total_cycles(&self) -> Option<u64> {
        self.duration
            .map(|d| (d.as_secs_f64() / self.interval.as_secs_f64()).floor() as u64)
    }
}

#[derive(Debug)]
pub struct LongTimeBuilder {
    channels: Vec<LongTimeChannel>,
    include_vavg: bool,
    include_vrms: bool,
    interval: Duration,
    duration: Option<Duration>,
    acquisition: Option<AcquisitionConfig>,
}

impl LongTimeBuilder {
    pub fn channel(mut self, channel: impl Into<LongTimeChannel>) -> Self {
        self.channels.push(channel.into());
        self
    }

    /// Log `channel` in amps using `probe` unless the scope already reports AMP.
    pub fn current_channel(mut self, channel: Channel, probe: ProbeScalingConfig) -> Self {
        self.channels.push(LongTimeChannel {
            channel,
            probe: Some(probe),
        });
        self
    }

    pub fn vavg(mut self, enabled: bool) -> Self {
        self.include_vavg = enabled;
        self
    }

    pub fn vrms(mut self, enabled: bool) -> Self {
        self.include_vrms = enabled;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn acquisition(mut self, acquisition: AcquisitionConfig) -> Self {
        self.acquisition = Some(acquisition);
        self
    }

    pub fn build(self) -> Result<LongTimeConfig, LongTimeConfigError> {
        if self.channels.is_empty() {
            return Err(LongTimeConfigError::NoChannels);
        }
        for (index, entry) in self.channels.iter().enumerate() {
            if self.channels[..index].iter().any(|e| e.channel == entry.channel) {
                return Err(LongTimeConfigError::DuplicateChannel(entry.channel));
            }
        }
        if self.interval.is_zero() {
            return Err(LongTimeConfigError::ZeroInterval);
        }
        let acquisition = match self.acquisition {
            Some(acquisition) => acquisition,
            None => AcquisitionConfig::windowed().build()?,
        };
        Ok(LongTimeConfig {
            channels: self.channels,
            include_vavg: self.include_vavg,
            include_vrms: self.include_vrms,
            interval: self.interval,
            duration: self.duration,
            acquisition,
        })
    }
}

/// One logged row. `None` marks a channel that could not be read this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct LongTimeRow {
    pub timestamp: DateTime<Utc>,
    pub channels: Vec<(Channel, Option<ChannelStats>)>,
}

impl LongTimeRow {
    /// Single-row frame laid out as [`LongTimeConfig::header`].
    pub fn to_frame(&self, config: &LongTimeConfig) -> Result<DataFrame, PolarsError> {
        let header = config.header();
        let mut values: Vec<Option<f64>> = Vec::with_capacity(header.len() - 1);
        for (_, stats) in &self.channels {
            values.push(stats.map(|s| s.vpp));
            if config.include_vavg {
                values.push(stats.map(|s| s.vavg));
            }
            if config.include_vrms {
                values.push(stats.map(|s| s.vrms));
            }
        }
        let timestamp = self.timestamp.to_rfc3339();
        let mut columns: Vec<Column> = vec![Series::new(header[0].as_str().into(), &[timestamp.as_str()]).into()];
        for (name, value) in header[1..].iter().zip(values) {
            columns.push(Series::new(name.as_str().into(), &[value]).into());
        }
        DataFrame::new(columns)
    }
}

/// Reads every configured channel once per cycle.
pub struct LongTimeLogger {
    link: Arc<InstrumentLink>,
    config: LongTimeConfig,
}

impl LongTimeLogger {
    pub fn new(link: Arc<InstrumentLink>, config: LongTimeConfig) -> Self {
        Self { link, config }
    }

    pub fn config(&self) -> &LongTimeConfig {
        &self.config
    }

    /// Fetch all channels in one exclusive link hold.
    ///
    /// A channel that fails to read is left empty in the row; losing the
    /// connection aborts the whole row.
    pub fn measure_row(&self) -> Result<LongTimeRow, AcquireError> {
        let first = self.config.channels.first().map_or(Channel::Analog(1), |c| c.channel);
        let mut session = self
            .link
            .exclusive()
            .map_err(|source| AcquireError::Link { channel: first, source })?;
        let timestamp = Utc::now();
        let mut channels = Vec::with_capacity(self.config.channels.len());

        for entry in &self.config.channels {
            let channel = entry.channel;
            let unit = match entry.probe {
                Some(_) => match session.refresh_channel(channel) {
                    Ok(config) => config.unit,
                    Err(source @ LinkError::Disconnected { .. }) => {
                        return Err(AcquireError::Link { channel, source })
                    }
                    Err(e) => {
                        log::warn!("Unit detection failed for {}: {}", channel, e);
                        ChannelUnit::Unknown
                    }
                },
                None => ChannelUnit::Volt,
            };
            let stats = match fetch_waveform(&mut session, channel, &self.config.acquisition) {
                Ok(record) => ChannelStats::from_samples(record.samples()),
                Err(AcquireError::Link {
                    source: source @ LinkError::Disconnected { .. },
                    ..
                }) => return Err(AcquireError::Link { channel, source }),
                Err(e) => {
                    log::warn!("{}", e);
                    None
                }
            };
            let stats = match entry.probe {
                Some(probe) => stats.map(|s| s.scaled(resolve_scaling(&probe, channel, unit).total())),
                None => stats,
            };
            if let Some(s) = stats {
                log::debug!("{} Vpp={:.3} Vavg={:.3} Vrms={:.3}", channel, s.vpp, s.vavg, s.vrms);
            }
            channels.push((channel, stats));
        }
        Ok(LongTimeRow { timestamp, channels })
    }

    /// Read one row if the session is measuring; failures are counted on the arbiter.
    pub fn cycle(&self, arbiter: &SessionArbiter) -> Result<Option<LongTimeRow>, AcquireError> {
        if !arbiter.state().is_active() {
            return Ok(None);
        }
        self.measure_row().map(Some).inspect_err(|e| arbiter.record_acquisition_failure(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_stats() {
        let stats = ChannelStats::from_samples(&[1.0, -1.0, 1.0, -1.0]).unwrap();
        assert_eq!(stats.vpp, 2.0);
        assert_eq!(stats.vavg, 0.0);
        assert_eq!(stats.vrms, 1.0);
        assert!(ChannelStats::from_samples(&[]).is_none());

        let scaled = ChannelStats::from_samples(&[0.5, 1.5]).unwrap().scaled(10.0);
        assert_eq!(scaled.vpp, 10.0);
        assert_eq!(scaled.vavg, 10.0);
    }

    #[test]
    fn test_header_layout() {
        let config = LongTimeConfig::builder()
            .channel(Channel::Analog(1))
            .current_channel(Channel::Analog(2), ProbeScalingConfig::clamp(100.0).unwrap())
            .vrms(true)
            .build()
            .unwrap();
        assert_eq!(
            config.header(),
            vec!["timestamp", "CH1_Vpp", "CH1_Vrms", "CH2_Vpp", "CH2_Vrms"]
        );
    }

    #[test]
    fn test_builder_rejects() {
        assert_eq!(LongTimeConfig::builder().build(), Err(LongTimeConfigError::NoChannels));
        assert_eq!(
            LongTimeConfig::builder()
                .channel(Channel::Analog(3))
                .channel(Channel::Analog(3))
                .build(),
            Err(LongTimeConfigError::DuplicateChannel(Channel::Analog(3)))
        );
        assert_eq!(
            LongTimeConfig::builder()
                .channel(Channel::Analog(1))
                .interval(Duration::ZERO)
                .build(),
            Err(LongTimeConfigError::ZeroInterval)
        );
    }

    #[test]
    fn test_total_cycles() {
        let config = LongTimeConfig::builder()
            .channel(Channel::Analog(1))
            .interval(Duration::from_secs(5))
            .duration(Duration::from_secs(3600))
            .build()
            .unwrap();
        assert_eq!(config.total_cycles(), Some(720));
    }

    #[test]
    fn test_row_frame_leaves_failed_channel_empty() {
        let config = LongTimeConfig::builder()
            .channel(Channel::Analog(1))
            .channel(Channel::Analog(2))
            .vavg(true)
            .build()
            .unwrap();
        let row = LongTimeRow {
            timestamp: Utc::now(),
            channels: vec![
                (Channel::Analog(1), ChannelStats::from_samples(&[0.0, 2.0])),
                (Channel::Analog(2), None),
            ],
        };
        let df = row.to_frame(&config).unwrap();
        assert_eq!(df.width(), 5);
        assert_eq!(df.column("CH1_Vpp").unwrap().f64().unwrap().get(0), Some(2.0));
        assert_eq!(df.column("CH2_Vavg").unwrap().null_count(), 1);
    }
}
