use crate::power::{EnergySnapshot, PowerSample};
use polars::prelude::*;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const TIMESTAMP_COLUMN_NAME: &str = "timestamp";

/// Column order of a power log row.
pub const POWER_LOG_COLUMNS: [&str; 12] = [
    TIMESTAMP_COLUMN_NAME,
    "P(W)",
    "S(VA)",
    "Q1(var)",
    "PF",
    "phi1(deg)",
    "Vrms(V)",
    "Irms(A)",
    "f0(Hz)",
    "E_P(Wh)",
    "E_S(VAh)",
    "E_Q(varh)",
];

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Cannot open log file {path}: {source}")]
    Open { path: PathBuf, source: std::io::Error },

    #[error("Log row has columns {got:?}, expected {expected:?}")]
    Columns { got: Vec<String>, expected: Vec<String> },

    #[error(transparent)]
    Polars(#[from] PolarsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One computed sample plus the session energy at that point.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerRecord {
    pub sample: PowerSample,
    pub energy: EnergySnapshot,
}

impl PowerRecord {
    /// Single-row frame in [`POWER_LOG_COLUMNS`] order.
    pub fn to_frame(&self) -> Result<DataFrame, PolarsError> {
        let s = &self.sample;
        let timestamp = s.timestamp.to_rfc3339();
        let values = [
            s.p,
            s.s,
            s.q1,
            s.pf,
            s.phi1_deg,
            s.vrms,
            s.irms,
            s.f0,
            self.energy.e_p_wh,
            self.energy.e_s_vah,
            self.energy.e_q_varh,
        ];
        let mut columns: Vec<Column> = Vec::with_capacity(POWER_LOG_COLUMNS.len());
        columns.push(Series::new(TIMESTAMP_COLUMN_NAME.into(), &[timestamp.as_str()]).into());
        for (name, value) in POWER_LOG_COLUMNS[1..].iter().zip(values) {
            columns.push(Series::new((*name).into(), &[value]).into());
        }
        DataFrame::new(columns)
    }
}

/// Append-only CSV file. The header goes out with the first row only.
#[derive(Debug)]
pub struct CsvLog {
    path: PathBuf,
    file: File,
    columns: Option<Vec<String>>,
    rows: u64,
}

impl CsvLog {
    /// Create (or truncate) `path`, creating missing parent directories.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, LogError> {
        let path = path.as_ref().to_path_buf();
        let open = || -> std::io::Result<File> {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            File::create(&path)
        };
        let file = open().map_err(|source| LogError::Open {
            path: path.clone(),
            source,
        })?;
        log::info!("Logging to '{}'", path.display());
        Ok(Self {
            path,
            file,
            columns: None,
            rows: 0,
        })
    }

    /// Timestamped file name under `dir`, e.g. `power_log_20260101_120000.csv`.
    pub fn create_in(dir: impl AsRef<Path>, prefix: &str) -> Result<Self, LogError> {
        let name = format!("{}_{}.csv", prefix, chrono::Local::now().format("%Y%m%d_%H%M%S"));
        Self::create(dir.as_ref().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Write the rows of `df`. Every call must carry the same columns as the first.
    pub fn append(&mut self, df: &mut DataFrame) -> Result<(), LogError> {
        let got: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        match &self.columns {
            Some(expected) if *expected != got => {
                return Err(LogError::Columns {
                    got,
                    expected: expected.clone(),
                })
            }
            Some(_) => {}
            None => self.columns = Some(got),
        }
        CsvWriter::new(&mut self.file)
            .include_header(self.rows == 0)
            .finish(df)?;
        self.file.flush()?;
        self.rows += df.height() as u64;
        Ok(())
    }

    pub fn append_power(&mut self, record: &PowerRecord) -> Result<(), LogError> {
        self.append(&mut record.to_frame()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn record(p: f64) -> PowerRecord {
        PowerRecord {
            sample: PowerSample {
                timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
                p,
                s: 2.0 * p,
                q1: -3.0,
                pf: 0.5,
                phi1_deg: -60.0,
                vrms: 230.0,
                irms: 1.5,
                f0: 50.0,
                p1: p,
                pf1: 0.5,
                impedance: 153.0,
            },
            energy: EnergySnapshot {
                e_p_wh: 1.25,
                e_s_vah: 2.5,
                e_q_varh: -0.5,
                elapsed: Duration::from_secs(60),
                samples: 4,
            },
        }
    }

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("scope_power_{}_{}", name, std::process::id()))
            .join("log.csv")
    }

    #[test]
    fn test_record_frame_columns() {
        let df = record(100.0).to_frame().unwrap();
        let names: Vec<String> = df.get_column_names().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, POWER_LOG_COLUMNS.to_vec());
        assert_eq!(df.height(), 1);
    }

    #[test]
    fn test_header_written_once() {
        let path = temp_path("header");
        let mut log = CsvLog::create(&path).unwrap();
        log.append_power(&record(100.0)).unwrap();
        log.append_power(&record(-40.0)).unwrap();
        assert_eq!(log.rows(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], POWER_LOG_COLUMNS.join(","));
        assert!(lines[1].starts_with("2026-03-01T12:00:00+00:00,100.0"));
        assert!(lines[2].contains(",-40.0,"));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }

    #[test]
    fn test_rejects_changed_columns() {
        let path = temp_path("columns");
        let mut log = CsvLog::create(&path).unwrap();
        log.append_power(&record(1.0)).unwrap();
        let mut other = df!("x" => [1.0]).unwrap();
        assert!(matches!(log.append(&mut other), Err(LogError::Columns { .. })));
        std::fs::remove_dir_all(path.parent().unwrap()).ok();
    }
}
