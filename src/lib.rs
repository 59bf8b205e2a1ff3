//! # scope-power
//!
//! Calibrated power and energy analysis from the waveforms of a remote SCPI
//! oscilloscope (Rigol MSO5000 class).
//!
//! The crate covers the chain from the instrument socket to a CSV log row:
//! voltage and current records are fetched over one serialized link, decoded,
//! aligned, scaled from probe volts to amps and reduced to real, apparent and
//! fundamental reactive power. A session arbiter keeps power analysis and
//! long-time logging from fighting over the same instrument.
//!
//! ## Features
//!
//! - **Serialized instrument link**: one query in flight, per-query timeouts,
//!   transparent retries and a per-template blacklist with cool-down
//! - **Waveform decode**: `:WAV:PRE?` preamble and IEEE 488.2 byte blocks,
//!   windowed reads or chunked deep-memory reads with guaranteed `:RUN`
//! - **Shunt and clamp probes**: with a unit guard for channels already in AMP
//! - **Power engine**: time-domain P, RMS, signed PF and sign-correct Q1 from
//!   fundamental phasors (`rustfft`)
//! - **Sessions**: pause/resume/stop state machine, energy accumulation and a
//!   drift-free cycle scheduler
//! - **DataFrame output**: `polars` frames and CSV logs
//!
//! ## Examples
//!
//! ### Power analysis
//!
//! ```rust,no_run
//! use scope_power::{
//!     Channel, CsvLog, InstrumentLink, LinkPolicy, MeasurementMode, PowerAnalysisConfig,
//!     PowerMeter, ProbeScalingConfig, SessionArbiter,
//! };
//! use std::sync::Arc;
//!
//! let link = Arc::new(InstrumentLink::connect_tcp("192.168.1.50", LinkPolicy::default())?);
//! let config = PowerAnalysisConfig::builder(
//!     Channel::Analog(1),
//!     Channel::Analog(2),
//!     ProbeScalingConfig::shunt(0.01)?,
//! )
//! .build()?;
//! let meter = PowerMeter::new(link, config);
//!
//! let arbiter = SessionArbiter::new();
//! arbiter.start(MeasurementMode::PowerAnalysis)?;
//! let mut log = CsvLog::create("power_log.csv")?;
//! for _ in 0..10 {
//!     if let Some(record) = meter.cycle(&arbiter)? {
//!         log.append_power(&record)?;
//!     }
//! }
//! let energy = arbiter.stop()?;
//! println!("E_P = {:.3} Wh", energy.e_p_wh);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ### Computing power from arrays
//!
//! ```rust
//! use scope_power::PowerAnalyzer;
//!
//! let dt = 1e-4;
//! let wave = |amplitude: f64, phase: f64| -> Vec<f64> {
//!     (0..2000)
//!         .map(|n| amplitude * (2.0 * std::f64::consts::PI * 50.0 * n as f64 * dt + phase).cos())
//!         .collect()
//! };
//! let sample = PowerAnalyzer::default()
//!     .analyze(&wave(325.0, 0.0), &wave(10.0, -0.5), dt, chrono::Utc::now())
//!     .unwrap();
//! assert!(sample.q1 > 0.0); // current lags: inductive
//! ```
//!
//! ### Raw commands
//!
//! ```rust,no_run
//! use scope_power::{Command, InstrumentLink, LinkPolicy, Response};
//!
//! let link = InstrumentLink::connect_tcp("192.168.1.50", LinkPolicy::default())?;
//! if let Response::Text(rate) = link.execute(Command::query(":ACQ:SRAT?"))? {
//!     println!("Sample rate: {}", rate);
//! }
//! println!("Blacklisted: {:?}", link.blacklisted());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod acquisition_config;
pub mod blacklist;
pub mod export;
pub mod instrument_link;
pub mod long_time;
pub mod power;
pub mod power_log;
pub mod power_meter;
pub mod probe;
pub mod scpi_terminal;
pub mod session;
pub mod waveform;

// Re-export the main types for convenience
pub use acquisition_config::{AcquisitionConfig, AcquisitionConfigError, WaveformMode};

pub use blacklist::{Admission, QueryBlacklist};

pub use export::{export_snapshot, try_export_snapshot, write_waveform_csv, ExportError, SnapshotHeader};

pub use instrument_link::{
    Channel, ChannelConfig, ChannelUnit, Command, InstrumentLink, LinkError, LinkPolicy, LinkSession,
    LinkState, Response,
};

pub use long_time::{ChannelStats, LongTimeConfig, LongTimeConfigError, LongTimeLogger, LongTimeRow};

pub use power::{
    auto_calibrate, CalibrationError, ComputeError, EnergyAccumulator, EnergySnapshot, PowerAnalyzer,
    PowerSample,
};

pub use power_log::{CsvLog, LogError, PowerRecord};

pub use power_meter::{MeasureError, PowerAnalysisConfig, PowerConfigError, PowerMeter};

pub use probe::{scale_factor, ProbeConfigError, ProbeMode, ProbeScalingConfig};

pub use scpi_terminal::{ScpiTransport, StreamTerminal, TerminalError};

pub use session::{
    CycleScheduler, MeasurementLoop, MeasurementMode, SampleFaults, SessionArbiter, SessionError,
    SessionState,
};

pub use waveform::{align, decode, AcquireError, Preamble, WaveformRecord};
