use crate::instrument_link::{Channel, Command};
use std::time::Duration;

/// Largest point count the screen buffer (`NORM`) delivers.
pub const SCREEN_POINTS: u32 = 1000;
/// Largest BYTE-format block a single `:WAV:DATA?` may return.
pub const MAX_CHUNK_POINTS: u32 = 250_000;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AcquisitionConfigError {
    #[error("Point count {requested} out of range (1..={max})")]
    PointsOutOfRange { requested: u32, max: u32 },

    #[error("Chunk size {0} out of range (1..=250000)")]
    ChunkOutOfRange(u32),

    #[error("Windowed acquisition cannot read {0} points; use bulk mode")]
    NeedsBulk(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaveformMode {
    /// Screen data, safe while the scope keeps running.
    Normal,
    /// Screen data when running, memory data when stopped.
    Maximum,
    /// Internal memory; needs a stopped acquisition.
    Raw,
}

impl WaveformMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaveformMode::Normal => "NORM",
            WaveformMode::Maximum => "MAX",
            WaveformMode::Raw => "RAW",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub mode: WaveformMode,
    pub points: u32,
    pub bulk: bool,
    pub chunk_points: u32,
    /// Pause after `:WAV:SOUR` before the preamble is trusted.
    pub settle: Duration,
}

impl AcquisitionConfig {
    /// Fetch straight from a free-running scope.
    pub fn windowed() -> AcquisitionBuilder {
        AcquisitionBuilder {
            mode: WaveformMode::Normal,
            points: SCREEN_POINTS,
            bulk: false,
            chunk_points: MAX_CHUNK_POINTS,
            settle: Duration::from_millis(100),
        }
    }

    /// Fetch a deep memory record between `:STOP` and `:RUN`.
    pub fn bulk(points: u32) -> AcquisitionBuilder {
        AcquisitionBuilder {
            mode: WaveformMode::Raw,
            points,
            bulk: true,
            chunk_points: MAX_CHUNK_POINTS,
            settle: Duration::from_millis(100),
        }
    }

    /// Commands that select `channel` and the transfer format.
    pub fn into_setup_commands(&self, channel: Channel) -> Vec<Command> {
        vec![
            Command::write(":WAV:FORM BYTE"),
            Command::write(format!(":WAV:MODE {}", self.mode.as_str())),
            Command::write(format!(":WAV:POIN {}", self.points)),
            Command::write(format!(":WAV:SOUR {}", channel.scpi_name())),
        ]
    }

    /// 1-based inclusive `(start, stop)` ranges for chunked bulk reads.
    pub fn chunk_ranges(&self, total_points: u32) -> Vec<(u32, u32)> {
        let chunk = self.chunk_points.max(1);
        let mut ranges = Vec::new();
        let mut start = 1u32;
        while start <= total_points {
            let stop = start.saturating_add(chunk - 1).min(total_points);
            ranges.push((start, stop));
            match stop.checked_add(1) {
                Some(next) => start = next,
                None => break,
            }
        }
        ranges
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: WaveformMode::Normal,
            points: SCREEN_POINTS,
            bulk: false,
            chunk_points: MAX_CHUNK_POINTS,
            settle: Duration::from_millis(100),
        }
    }
}

#[derive(Debug)]
pub struct AcquisitionBuilder {
    mode: WaveformMode,
    points: u32,
    bulk: bool,
    chunk_points: u32,
    settle: Duration,
}

impl AcquisitionBuilder {
    pub fn points(mut self, points: u32) -> Self {
        self.points = points;
        self
    }

    pub fn mode(mut self, mode: WaveformMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn chunk_points(mut self, chunk_points: u32) -> Self {
        self.chunk_points = chunk_points;
        self
    }

    pub fn settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn build(self) -> Result<AcquisitionConfig, AcquisitionConfigError> {
        if self.chunk_points == 0 || self.chunk_points > MAX_CHUNK_POINTS {
            return Err(AcquisitionConfigError::ChunkOutOfRange(self.chunk_points));
        }
        let max = if self.bulk { u32::MAX } else { SCREEN_POINTS };
        if self.points == 0 {
            return Err(AcquisitionConfigError::PointsOutOfRange {
                requested: self.points,
                max,
            });
        }
        if !self.bulk && (self.points > SCREEN_POINTS || self.mode == WaveformMode::Raw) {
            return Err(AcquisitionConfigError::NeedsBulk(self.points));
        }
        Ok(AcquisitionConfig {
            mode: self.mode,
            points: self.points,
            bulk: self.bulk,
            chunk_points: self.chunk_points,
            settle: self.settle,
        })
    }
}
