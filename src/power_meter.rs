use crate::acquisition_config::{AcquisitionConfig, AcquisitionConfigError};
use crate::instrument_link::{Channel, InstrumentLink, LinkError};
use crate::power::{auto_calibrate, CalibrationError, ComputeError, PowerAnalyzer, PowerSample};
use crate::power_log::PowerRecord;
use crate::probe::{resolve_scaling, scale_current, ProbeConfigError, ProbeScalingConfig};
use crate::session::SessionArbiter;
use crate::waveform::{fetch_pair_in, AcquireError};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PowerConfigError {
    #[error("Voltage and current must be different channels, both are {0}")]
    SameChannel(Channel),

    #[error("Logging interval must be positive")]
    ZeroInterval,

    #[error(transparent)]
    Probe(#[from] ProbeConfigError),

    #[error(transparent)]
    Acquisition(#[from] AcquisitionConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    #[error("Reading {channel} setup failed: {source}")]
    Channel { channel: Channel, source: LinkError },

    #[error("Acquisition failed on {0}")]
    Acquire(#[from] AcquireError),

    #[error("Power computation failed: {0}")]
    Compute(#[from] ComputeError),

    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Probe(#[from] ProbeConfigError),
}

/// Everything the operator chooses for a power analysis session.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerAnalysisConfig {
    pub voltage: Channel,
    pub current: Channel,
    pub probe: ProbeScalingConfig,
    pub remove_dc: bool,
    pub acquisition: AcquisitionConfig,
    pub interval: Duration,
}

impl PowerAnalysisConfig {
    pub fn builder(voltage: Channel, current: Channel, probe: ProbeScalingConfig) -> PowerAnalysisBuilder {
        PowerAnalysisBuilder {
            voltage,
            current,
            probe,
            correction: None,
            remove_dc: true,
            bulk_points: None,
            acquisition: None,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct PowerAnalysisBuilder {
    voltage: Channel,
    current: Channel,
    probe: ProbeScalingConfig,
    correction: Option<f64>,
    remove_dc: bool,
    bulk_points: Option<u32>,
    acquisition: Option<AcquisitionConfig>,
    interval: Duration,
}

impl PowerAnalysisBuilder {
    pub fn correction(mut self, correction: f64) -> Self {
        self.correction = Some(correction);
        self
    }

    /// Turn off for true DC measurements.
    pub fn remove_dc(mut self, remove_dc: bool) -> Self {
        self.remove_dc = remove_dc;
        self
    }

    /// Read `points` from deep memory with the acquisition halted.
    pub fn bulk(mut self, points: u32) -> Self {
        self.bulk_points = Some(points);
        self
    }

    /// Explicit acquisition setup; overrides [`Self::bulk`].
    pub fn acquisition(mut self, acquisition: AcquisitionConfig) -> Self {
        self.acquisition = Some(acquisition);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn build(self) -> Result<PowerAnalysisConfig, PowerConfigError> {
        if self.voltage == self.current {
            return Err(PowerConfigError::SameChannel(self.voltage));
        }
        if self.interval.is_zero() {
            return Err(PowerConfigError::ZeroInterval);
        }
        let probe = match self.correction {
            Some(correction) => self.probe.with_correction(correction)?,
            None => self.probe,
        };
        let acquisition = match (self.acquisition, self.bulk_points) {
            (Some(acquisition), _) => acquisition,
            (None, Some(points)) => AcquisitionConfig::bulk(points).build()?,
            (None, None) => AcquisitionConfig::windowed().build()?,
        };
        Ok(PowerAnalysisConfig {
            voltage: self.voltage,
            current: self.current,
            probe,
            remove_dc: self.remove_dc,
            acquisition,
            interval: self.interval,
        })
    }
}

/// Runs the fetch, scale and compute chain for one sample.
pub struct PowerMeter {
    link: Arc<InstrumentLink>,
    config: PowerAnalysisConfig,
}

impl PowerMeter {
    pub fn new(link: Arc<InstrumentLink>, config: PowerAnalysisConfig) -> Self {
        Self { link, config }
    }

    pub fn config(&self) -> &PowerAnalysisConfig {
        &self.config
    }

    pub fn link(&self) -> &Arc<InstrumentLink> {
        &self.link
    }

    /// One sample with the configured correction applied.
    pub fn measure(&self) -> Result<PowerSample, MeasureError> {
        self.measure_with(&self.config.probe)
    }

    fn measure_with(&self, probe: &ProbeScalingConfig) -> Result<PowerSample, MeasureError> {
        let (voltage, current) = (self.config.voltage, self.config.current);
        let acquisition = &self.config.acquisition;

        let (v, i, unit) = {
            let mut session = self.link.exclusive().map_err(|source| MeasureError::Channel {
                channel: current,
                source,
            })?;
            // The unit guard needs the current channel's unit as set right now.
            let current_config = session
                .refresh_channel(current)
                .map_err(|source| MeasureError::Channel {
                    channel: current,
                    source,
                })?;
            let (v, i) = fetch_pair_in(&mut session, voltage, current, acquisition)?;
            (v, i, current_config.unit)
        };

        let scaling = resolve_scaling(probe, current, unit);
        let dt = v.x_increment();
        let timestamp = v.acquired_at();
        let mut amps = i.into_samples();
        scale_current(&mut amps, &scaling);

        let sample = PowerAnalyzer::new(self.config.remove_dc).analyze(v.samples(), &amps, dt, timestamp)?;
        log::debug!(
            "P={:.4}W S={:.4}VA Q1={:.4}var PF={:.4} Vrms={:.4}V Irms={:.4}A f0={:.3}Hz",
            sample.p,
            sample.s,
            sample.q1,
            sample.pf,
            sample.vrms,
            sample.irms,
            sample.f0
        );
        Ok(sample)
    }

    /// Measure with a correction of 1 and set the correction that makes P read
    /// `expected_watts`. Returns the new factor.
    pub fn auto_calibrate(&mut self, expected_watts: f64) -> Result<f64, MeasureError> {
        let measured = self.measure_with(&self.config.probe.uncorrected())?;
        let correction = auto_calibrate(expected_watts, measured.p)?;
        self.config.probe.set_correction(correction)?;
        log::info!(
            "Calibrated: measured {:.4}W, expected {:.4}W, correction {:.6}",
            measured.p,
            expected_watts,
            correction
        );
        Ok(correction)
    }

    /// Measure once and fold the result into the session.
    ///
    /// Compute faults drop the sample and are counted on the arbiter; `Ok(None)`
    /// is returned for them. Acquisition failures are counted too and returned.
    pub fn cycle(&self, arbiter: &SessionArbiter) -> Result<Option<PowerRecord>, MeasureError> {
        match self.measure() {
            Ok(sample) => match arbiter.record_sample(&sample) {
                Ok(energy) => Ok(Some(PowerRecord { sample, energy })),
                Err(e) => {
                    log::debug!("Sample discarded: {}", e);
                    Ok(None)
                }
            },
            Err(MeasureError::Compute(e)) => {
                arbiter.record_fault(&e);
                Ok(None)
            }
            Err(e) => {
                arbiter.record_acquisition_failure(&e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shunt() -> ProbeScalingConfig {
        ProbeScalingConfig::shunt(0.01).unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let config = PowerAnalysisConfig::builder(Channel::Analog(1), Channel::Analog(2), shunt())
            .build()
            .unwrap();
        assert!(config.remove_dc);
        assert!(!config.acquisition.bulk);
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.probe.correction(), 1.0);
    }

    #[test]
    fn test_builder_bulk_and_correction() {
        let config = PowerAnalysisConfig::builder(Channel::Analog(1), Channel::Math(1), shunt())
            .bulk(500_000)
            .correction(1.1)
            .remove_dc(false)
            .build()
            .unwrap();
        assert!(config.acquisition.bulk);
        assert_eq!(config.acquisition.points, 500_000);
        assert!((config.probe.correction() - 1.1).abs() < 1e-12);
        assert!(!config.remove_dc);
    }

    #[test]
    fn test_builder_rejects() {
        assert_eq!(
            PowerAnalysisConfig::builder(Channel::Analog(1), Channel::Analog(1), shunt()).build(),
            Err(PowerConfigError::SameChannel(Channel::Analog(1)))
        );
        assert_eq!(
            PowerAnalysisConfig::builder(Channel::Analog(1), Channel::Analog(2), shunt())
                .correction(0.0)
                .build(),
            Err(PowerConfigError::Probe(ProbeConfigError::InvalidCorrection(0.0)))
        );
        assert_eq!(
            PowerAnalysisConfig::builder(Channel::Analog(1), Channel::Analog(2), shunt())
                .interval(Duration::ZERO)
                .build(),
            Err(PowerConfigError::ZeroInterval)
        );
    }
}
