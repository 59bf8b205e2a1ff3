use crate::instrument_link::{Channel, ChannelUnit};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ProbeConfigError {
    #[error("Shunt resistance must be a positive number of ohms, got {0}")]
    InvalidShunt(f64),

    #[error("Clamp sensitivity must be a positive number of mV/A, got {0}")]
    InvalidClamp(f64),

    #[error("Correction factor must be finite and non-zero, got {0}")]
    InvalidCorrection(f64),
}

/// How the current channel senses current.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeMode {
    /// Voltage drop across a known resistor.
    Shunt { r_ohms: f64 },
    /// Transducer rated in millivolts per amp.
    Clamp { mv_per_amp: f64 },
}

impl ProbeMode {
    /// Amps per volt, before any correction.
    pub fn base_scale(&self) -> f64 {
        match *self {
            ProbeMode::Shunt { r_ohms } => 1.0 / r_ohms,
            ProbeMode::Clamp { mv_per_amp } => 1.0 / (mv_per_amp / 1000.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeScalingConfig {
    mode: ProbeMode,
    correction: f64,
}

fn is_positive(value: f64) -> bool {
    value.is_finite() && value > 0.0
}

impl ProbeScalingConfig {
    pub fn shunt(r_ohms: f64) -> Result<Self, ProbeConfigError> {
        if !is_positive(r_ohms) {
            return Err(ProbeConfigError::InvalidShunt(r_ohms));
        }
        Ok(Self {
            mode: ProbeMode::Shunt { r_ohms },
            correction: 1.0,
        })
    }

    pub fn clamp(mv_per_amp: f64) -> Result<Self, ProbeConfigError> {
        if !is_positive(mv_per_amp) {
            return Err(ProbeConfigError::InvalidClamp(mv_per_amp));
        }
        Ok(Self {
            mode: ProbeMode::Clamp { mv_per_amp },
            correction: 1.0,
        })
    }

    pub fn with_correction(mut self, correction: f64) -> Result<Self, ProbeConfigError> {
        self.set_correction(correction)?;
        Ok(self)
    }

    pub fn set_correction(&mut self, correction: f64) -> Result<(), ProbeConfigError> {
        if !correction.is_finite() || correction == 0.0 {
            return Err(ProbeConfigError::InvalidCorrection(correction));
        }
        self.correction = correction;
        Ok(())
    }

    /// Same probe with the correction factor reset to 1.
    pub fn uncorrected(&self) -> Self {
        Self {
            mode: self.mode,
            correction: 1.0,
        }
    }

    pub fn mode(&self) -> ProbeMode {
        self.mode
    }

    pub fn correction(&self) -> f64 {
        self.correction
    }
}

/// Amps-per-volt factor for a current channel reading in `unit`.
///
/// A channel already reporting amps gets 1.0 whatever the probe says, so the
/// instrument's own conversion is never applied twice.
pub fn scale_factor(config: &ProbeScalingConfig, unit: ChannelUnit) -> f64 {
    match unit {
        ChannelUnit::Amp => 1.0,
        ChannelUnit::Volt | ChannelUnit::Watt | ChannelUnit::Unknown => config.mode.base_scale(),
    }
}

/// What was applied to a current record, kept for traceability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurrentScaling {
    pub scale: f64,
    pub correction: f64,
    pub unit_guarded: bool,
}

impl CurrentScaling {
    pub fn total(&self) -> f64 {
        self.scale * self.correction
    }
}

/// Resolve the factor for `channel` and log how it was chosen.
pub fn resolve_scaling(config: &ProbeScalingConfig, channel: Channel, unit: ChannelUnit) -> CurrentScaling {
    let scale = scale_factor(config, unit);
    let unit_guarded = unit == ChannelUnit::Amp;
    if unit_guarded {
        log::info!("{} unit is AMP, no probe scaling applied", channel);
        if config.mode.base_scale() != 1.0 {
            log::debug!(
                "{} probe setting {:?} ignored while the scope reports amps",
                channel,
                config.mode
            );
        }
    } else {
        log::debug!(
            "{} unit is {:?}, scaling = base {:.4} x corr {:.4} = {:.4} A/V",
            channel,
            unit,
            scale,
            config.correction,
            scale * config.correction
        );
    }
    CurrentScaling {
        scale,
        correction: config.correction,
        unit_guarded,
    }
}

/// `i[n] = v_current[n] * scale * correction`
pub fn scale_current(samples: &mut [f64], scaling: &CurrentScaling) {
    let factor = scaling.total();
    for sample in samples.iter_mut() {
        *sample *= factor;
    }
}
