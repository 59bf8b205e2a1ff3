use crate::acquisition_config::AcquisitionConfig;
use crate::instrument_link::{Channel, InstrumentLink, LinkError, LinkSession};
use crate::session::{ExportGuard, SessionArbiter, SessionError};
use crate::waveform::{fetch_waveform, AcquireError, AcquisitionHalt, WaveformRecord};
use chrono::{DateTime, SecondsFormat, Utc};
use polars::prelude::*;
use std::fs::File;
use std::io::Write;
use std::path::Path;

const UNAVAILABLE: &str = "N/A";

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Busy(#[from] SessionError),

    #[error(transparent)]
    Acquire(#[from] AcquireError),

    #[error("Writing waveform CSV failed: {0}")]
    Polars(#[from] PolarsError),

    #[error("Cannot create {path}: {source}")]
    Io { path: String, source: std::io::Error },
}

/// Instrument settings written as `# Key: value` lines above the samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotHeader {
    pub device: String,
    pub channel: Channel,
    pub timebase: String,
    pub scale: String,
    pub offset: String,
    pub trigger: String,
    pub timestamp: DateTime<Utc>,
}

impl SnapshotHeader {
    /// Read the settings of `channel`. Unanswered queries read `N/A`.
    pub fn read(session: &mut LinkSession<'_>, channel: Channel) -> Result<Self, LinkError> {
        let name = channel.scpi_name();
        Ok(Self {
            device: session.identity().to_string(),
            channel,
            timebase: session.query_or(":TIM:SCAL?", UNAVAILABLE)?,
            scale: session.query_or(&format!(":{}:SCAL?", name), UNAVAILABLE)?,
            offset: session.query_or(&format!(":{}:OFFS?", name), UNAVAILABLE)?,
            trigger: session.query_or(":TRIG:STAT?", UNAVAILABLE)?,
            timestamp: Utc::now(),
        })
    }

    fn lines(&self) -> Vec<String> {
        let device = if self.device.is_empty() { UNAVAILABLE } else { self.device.as_str() };
        vec![
            format!("# Device: {}", device.trim()),
            format!("# Channel: {}", self.channel.scpi_name()),
            format!("# Timebase: {} s/div", self.timebase.trim()),
            format!("# Scale: {} V/div", self.scale.trim()),
            format!("# Offset: {} V", self.offset.trim()),
            format!("# Trigger: {}", self.trigger.trim()),
            format!("# Timestamp: {}", self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        ]
    }
}

/// Write `record` as a `time,voltage` CSV, preceded by `header` as comment
/// lines when given. Returns the number of rows.
pub fn write_waveform_csv(
    record: &WaveformRecord,
    header: Option<&SnapshotHeader>,
    path: impl AsRef<Path>,
) -> Result<usize, ExportError> {
    let path = path.as_ref();
    let io_error = |source: std::io::Error| ExportError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut df = record.to_lazy_frame()?.collect()?;
    let mut file = File::create(path).map_err(io_error)?;
    if let Some(header) = header {
        for line in header.lines() {
            writeln!(file, "{}", line).map_err(io_error)?;
        }
    }
    CsvWriter::new(&mut file).include_header(true).finish(&mut df)?;
    log::info!("Exported {} points to '{}'", df.height(), path.display());
    Ok(df.height())
}

/// Fetch `channel` and write it to `path` without interleaving with a
/// measurement cycle. Waits for an in-flight cycle to finish.
pub fn export_snapshot(
    arbiter: &SessionArbiter,
    link: &InstrumentLink,
    channel: Channel,
    config: &AcquisitionConfig,
    path: impl AsRef<Path>,
) -> Result<usize, ExportError> {
    let guard = arbiter.begin_export();
    export_locked(&guard, link, channel, config, path.as_ref())
}

/// Like [`export_snapshot`] but fails with [`SessionError::ExportBusy`]
/// instead of waiting.
pub fn try_export_snapshot(
    arbiter: &SessionArbiter,
    link: &InstrumentLink,
    channel: Channel,
    config: &AcquisitionConfig,
    path: impl AsRef<Path>,
) -> Result<usize, ExportError> {
    let guard = arbiter.try_begin_export()?;
    export_locked(&guard, link, channel, config, path.as_ref())
}

fn export_locked(
    _guard: &ExportGuard<'_>,
    link: &InstrumentLink,
    channel: Channel,
    config: &AcquisitionConfig,
    path: &Path,
) -> Result<usize, ExportError> {
    let link_error = |source: LinkError| AcquireError::Link { channel, source };
    let (header, record) = {
        let mut session = link.exclusive().map_err(link_error)?;
        let header = SnapshotHeader::read(&mut session, channel).map_err(link_error)?;
        let record = if config.bulk {
            let mut halted = AcquisitionHalt::engage(&mut session).map_err(link_error)?;
            fetch_waveform(&mut halted, channel, config)?
        } else {
            fetch_waveform(&mut session, channel, config)?
        };
        (header, record)
    };
    write_waveform_csv(&record, Some(&header), path)
}
