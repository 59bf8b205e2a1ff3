// End-to-end tests against a simulated MSO5000 speaking SCPI over a fake transport.

use scope_power::{
    export_snapshot, AcquisitionConfig, Channel, CsvLog, InstrumentLink, LinkError, LinkPolicy, LongTimeConfig,
    LongTimeLogger, MeasureError, MeasurementLoop, MeasurementMode, PowerAnalysisConfig, PowerMeter,
    ProbeScalingConfig, ScpiTransport, SessionArbiter, SessionError, SessionState, TerminalError,
};
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const POINTS: usize = 1000;
const DT: f64 = 2e-4;
const FREQ: f64 = 50.0;

enum Reply {
    Line(String),
    Block(Vec<u8>),
}

struct SimChannel {
    unit: &'static str,
    y_increment: f64,
    raw: Vec<u8>,
}

/// Raw codes of a cosine centred on 128 with `counts` amplitude.
fn raw_cosine(counts: f64, phase_deg: f64) -> Vec<u8> {
    (0..POINTS)
        .map(|n| {
            let value = counts * (2.0 * PI * FREQ * n as f64 * DT + phase_deg.to_radians()).cos();
            (128.0 + value).round() as u8
        })
        .collect()
}

#[derive(Default)]
struct Scope {
    channels: HashMap<String, SimChannel>,
    source: String,
    start: usize,
    stop: usize,
    sent: Vec<String>,
    pending: VecDeque<Reply>,
    /// Block queries for these sources never answer.
    dead_sources: Vec<String>,
}

impl Scope {
    fn handle(&mut self, line: &str) {
        self.sent.push(line.to_string());
        let mut words = line.split_whitespace();
        let header = words.next().unwrap_or_default().to_ascii_uppercase();
        let argument = words.next().unwrap_or_default();
        match header.as_str() {
            "*IDN?" => self.reply("RIGOL TECHNOLOGIES,MSO5074,DS5A000000001,00.01.03"),
            ":WAV:SOUR" => self.source = argument.to_string(),
            ":WAV:STAR" => self.start = argument.parse().unwrap_or(1),
            ":WAV:STOP" => self.stop = argument.parse().unwrap_or(POINTS),
            ":WAV:POIN" => {
                self.start = 1;
                self.stop = argument.parse().unwrap_or(POINTS).min(POINTS);
            }
            ":WAV:PRE?" => {
                let y_increment = self.channels.get(&self.source).map_or(1.0, |c| c.y_increment);
                self.reply(&format!(
                    "0,0,{},1,{:e},0.0,0,{:e},0.0,128",
                    POINTS, DT, y_increment
                ));
            }
            ":WAV:DATA?" => {
                if self.dead_sources.contains(&self.source) {
                    return;
                }
                if let Some(channel) = self.channels.get(&self.source) {
                    let stop = self.stop.min(channel.raw.len());
                    let start = self.start.clamp(1, stop);
                    let data = channel.raw[start - 1..stop].to_vec();
                    self.pending.push_back(Reply::Block(data));
                }
            }
            _ if header.ends_with('?') => {
                let (channel, query) = header[1..].split_once(':').unwrap_or_default();
                let unit = self.channels.get(channel).map_or("VOLT", |c| c.unit);
                let answer = match query {
                    "UNIT?" => unit,
                    "DISP?" => "1",
                    "SCAL?" => "1.0",
                    "OFFS?" => "0.0",
                    "COUP?" => "AC",
                    "PROB?" => "1",
                    _ => return,
                };
                self.reply(answer);
            }
            _ => {}
        }
    }

    fn reply(&mut self, text: &str) {
        self.pending.push_back(Reply::Line(text.to_string()));
    }
}

struct SimTransport(Arc<Mutex<Scope>>);

impl ScpiTransport for SimTransport {
    fn send_line(&mut self, line: &str) -> Result<(), TerminalError> {
        self.0.lock().unwrap().handle(line);
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<String, TerminalError> {
        match self.0.lock().unwrap().pending.pop_front() {
            Some(Reply::Line(line)) => Ok(line),
            Some(Reply::Block(_)) => Err(TerminalError::MalformedBlock("block where a line was expected".into())),
            None => Err(TerminalError::Timeout { waited: timeout, received: 0 }),
        }
    }

    fn read_block(&mut self, timeout: Duration) -> Result<Vec<u8>, TerminalError> {
        match self.0.lock().unwrap().pending.pop_front() {
            Some(Reply::Block(block)) => Ok(block),
            Some(Reply::Line(line)) => Err(TerminalError::MalformedBlock(line)),
            None => Err(TerminalError::Timeout { waited: timeout, received: 0 }),
        }
    }

    fn clear_input(&mut self) -> Result<(), TerminalError> {
        self.0.lock().unwrap().pending.clear();
        Ok(())
    }
}

/// 325 V peak on CH1; CH2 carries 10 A peak lagging by 30 degrees, either
/// as shunt volts (0.01 ohm) or already in amps.
fn simulated_scope(current_unit: &'static str) -> Arc<Mutex<Scope>> {
    let mut scope = Scope::default();
    scope.channels.insert(
        "CHAN1".into(),
        SimChannel {
            unit: "VOLT",
            y_increment: 3.25,
            raw: raw_cosine(100.0, 0.0),
        },
    );
    let y_increment = if current_unit == "AMP" { 0.1 } else { 0.001 };
    scope.channels.insert(
        "CHAN2".into(),
        SimChannel {
            unit: current_unit,
            y_increment,
            raw: raw_cosine(100.0, -30.0),
        },
    );
    Arc::new(Mutex::new(scope))
}

fn connect(scope: &Arc<Mutex<Scope>>) -> Arc<InstrumentLink> {
    let shared = Arc::clone(scope);
    let policy = LinkPolicy {
        timeout: Duration::from_millis(20),
        block_timeout: Duration::from_millis(20),
        ..LinkPolicy::default()
    };
    let link = InstrumentLink::connect(
        Box::new(move || Ok(Box::new(SimTransport(Arc::clone(&shared))) as Box<dyn ScpiTransport>)),
        policy,
    )
    .unwrap();
    Arc::new(link)
}

fn power_config(acquisition: AcquisitionConfig) -> PowerAnalysisConfig {
    PowerAnalysisConfig::builder(
        Channel::Analog(1),
        Channel::Analog(2),
        ProbeScalingConfig::shunt(0.01).unwrap(),
    )
    .acquisition(acquisition)
    .interval(Duration::from_millis(5))
    .build()
    .unwrap()
}

fn windowed() -> AcquisitionConfig {
    AcquisitionConfig::windowed()
        .settle(Duration::ZERO)
        .build()
        .unwrap()
}

fn expected_power() -> f64 {
    325.0 * 10.0 / 2.0 * 30f64.to_radians().cos()
}

fn assert_inductive_load(p: f64, q1: f64, phi1_deg: f64, irms: f64) {
    assert!((p - expected_power()).abs() < 0.02 * expected_power(), "P = {}", p);
    assert!(q1 > 0.0);
    assert!((phi1_deg - 30.0).abs() < 1.0, "phi1 = {}", phi1_deg);
    assert!((irms - 10.0 / 2f64.sqrt()).abs() < 0.1, "Irms = {}", irms);
}

#[test]
fn shunt_channel_is_scaled_to_amps() {
    let scope = simulated_scope("VOLT");
    let meter = PowerMeter::new(connect(&scope), power_config(windowed()));
    let sample = meter.measure().unwrap();
    assert_inductive_load(sample.p, sample.q1, sample.phi1_deg, sample.irms);
    assert!((sample.f0 - FREQ).abs() < 0.5);
}

#[test]
fn amp_channel_is_not_scaled_twice() {
    let scope = simulated_scope("AMP");
    let meter = PowerMeter::new(connect(&scope), power_config(windowed()));
    let sample = meter.measure().unwrap();
    assert_inductive_load(sample.p, sample.q1, sample.phi1_deg, sample.irms);
}

#[test]
fn windowed_fetch_never_halts_the_scope() {
    let scope = simulated_scope("VOLT");
    let meter = PowerMeter::new(connect(&scope), power_config(windowed()));
    meter.measure().unwrap();

    let scope = scope.lock().unwrap();
    assert!(!scope.sent.iter().any(|s| s == ":STOP" || s == ":RUN"));
    // The stale preamble is read and discarded once per channel.
    assert_eq!(scope.sent.iter().filter(|s| *s == ":WAV:PRE?").count(), 4);
}

#[test]
fn bulk_fetch_is_chunked_and_bracketed() {
    let scope = simulated_scope("VOLT");
    let bulk = AcquisitionConfig::bulk(POINTS as u32)
        .chunk_points(400)
        .settle(Duration::ZERO)
        .build()
        .unwrap();
    let meter = PowerMeter::new(connect(&scope), power_config(bulk));
    let sample = meter.measure().unwrap();
    assert_inductive_load(sample.p, sample.q1, sample.phi1_deg, sample.irms);

    let scope = scope.lock().unwrap();
    let stop = scope.sent.iter().position(|s| s == ":STOP").unwrap();
    let run = scope.sent.iter().rposition(|s| s == ":RUN").unwrap();
    let data: Vec<usize> = scope
        .sent
        .iter()
        .enumerate()
        .filter(|(_, s)| *s == ":WAV:DATA?")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(data.len(), 6);
    assert!(data.iter().all(|&i| stop < i && i < run));
    assert!(scope.sent.contains(&":WAV:STAR 801".to_string()));
    assert!(scope.sent.contains(&":WAV:STOP 1000".to_string()));
}

#[test]
fn failed_bulk_fetch_still_resumes() {
    let scope = simulated_scope("VOLT");
    scope.lock().unwrap().dead_sources.push("CHAN2".into());
    let bulk = AcquisitionConfig::bulk(POINTS as u32)
        .settle(Duration::ZERO)
        .build()
        .unwrap();
    let meter = PowerMeter::new(connect(&scope), power_config(bulk));

    let err = meter.measure().unwrap_err();
    match err {
        MeasureError::Acquire(e) => {
            assert_eq!(e.channel(), Channel::Analog(2));
            assert!(e.to_string().contains(":WAV:DATA?"));
        }
        other => assert!(matches!(other, MeasureError::Acquire(_)), "{}", other),
    }
    assert_eq!(scope.lock().unwrap().sent.last().map(String::as_str), Some(":RUN"));
}

#[test]
fn blacklisted_data_query_fails_fast() {
    let scope = simulated_scope("VOLT");
    scope.lock().unwrap().dead_sources.push("CHAN2".into());
    let link = connect(&scope);
    let meter = PowerMeter::new(Arc::clone(&link), power_config(windowed()));

    // One call spends all three attempts and arms the blacklist.
    assert!(meter.measure().is_err());
    assert_eq!(link.blacklisted(), vec![":WAV:DATA?".to_string()]);

    let before = scope.lock().unwrap().sent.len();
    let err = link.exclusive().unwrap().query_block(":WAV:DATA?").unwrap_err();
    assert!(matches!(err, LinkError::Blacklisted { .. }));
    assert_eq!(scope.lock().unwrap().sent.len(), before);
}

#[test]
fn auto_calibration_corrects_real_power() {
    let scope = simulated_scope("VOLT");
    let mut meter = PowerMeter::new(connect(&scope), power_config(windowed()));
    let measured = meter.measure().unwrap().p;

    let correction = meter.auto_calibrate(2.0 * measured).unwrap();
    assert!((correction - 2.0).abs() < 1e-9);
    let corrected = meter.measure().unwrap().p;
    assert!((corrected - 2.0 * measured).abs() < 1e-6 * measured.abs());
}

#[test]
fn logged_session_accumulates_energy() {
    let scope = simulated_scope("VOLT");
    let meter = PowerMeter::new(connect(&scope), power_config(windowed()));
    let arbiter = Arc::new(SessionArbiter::new());
    arbiter.start(MeasurementMode::PowerAnalysis).unwrap();

    assert_eq!(
        arbiter.start(MeasurementMode::LongTimeLogging),
        Err(SessionError::ModeConflict {
            requested: MeasurementMode::LongTimeLogging,
            active: MeasurementMode::PowerAnalysis,
        })
    );

    let dir = std::env::temp_dir().join(format!("scope_power_pipeline_{}", std::process::id()));
    let path = dir.join("power.csv");
    let log = Arc::new(Mutex::new(CsvLog::create(&path).unwrap()));
    let sink = Arc::clone(&log);
    let worker = MeasurementLoop::spawn(Arc::clone(&arbiter), Duration::from_millis(5), move |arbiter| {
        if let Ok(Some(record)) = meter.cycle(arbiter) {
            sink.lock().unwrap().append_power(&record).unwrap();
        }
    })
    .unwrap();

    while log.lock().unwrap().rows() < 3 {
        std::thread::sleep(Duration::from_millis(5));
    }
    let (energy, report) = worker.stop();
    let energy = energy.unwrap();

    assert_eq!(arbiter.state(), SessionState::Stopped);
    assert_eq!(energy.samples, log.lock().unwrap().rows());
    assert!(report.cycles >= energy.samples);
    let mean_p = energy.e_p_wh / (energy.elapsed.as_secs_f64() / 3600.0);
    assert!((mean_p - expected_power()).abs() < 0.02 * expected_power());

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("timestamp,P(W),S(VA),Q1(var),PF,phi1(deg)"));
    assert_eq!(text.lines().count() as u64, energy.samples + 1);
    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn long_time_row_converts_current_channels() {
    let scope = simulated_scope("VOLT");
    scope.lock().unwrap().dead_sources.push("CHAN3".into());
    let config = LongTimeConfig::builder()
        .channel(Channel::Analog(1))
        .current_channel(Channel::Analog(2), ProbeScalingConfig::shunt(0.01).unwrap())
        .channel(Channel::Analog(3))
        .vrms(true)
        .acquisition(windowed())
        .build()
        .unwrap();
    let logger = LongTimeLogger::new(connect(&scope), config.clone());

    let row = logger.measure_row().unwrap();
    let stats: Vec<_> = row.channels.iter().map(|(_, s)| *s).collect();
    let volts = stats[0].unwrap();
    let amps = stats[1].unwrap();
    assert!((volts.vpp - 650.0).abs() < 1e-9);
    assert!((amps.vpp - 20.0).abs() < 1e-9);
    assert!((amps.vrms - 10.0 / 2f64.sqrt()).abs() < 0.1);
    assert!(stats[2].is_none());

    let df = row.to_frame(&config).unwrap();
    assert_eq!(df.width(), 7);
    assert_eq!(df.column("CH3_Vpp").unwrap().null_count(), 1);
}

#[test]
fn snapshot_export_writes_decoded_volts() {
    let scope = simulated_scope("VOLT");
    let link = connect(&scope);
    let arbiter = SessionArbiter::new();
    let path = std::env::temp_dir().join(format!("scope_power_snapshot_{}.csv", std::process::id()));

    let rows = export_snapshot(&arbiter, &link, Channel::Analog(1), &windowed(), &path).unwrap();
    assert_eq!(rows, POINTS);
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("# Device: RIGOL TECHNOLOGIES,MSO5074,DS5A000000001,00.01.03"));
    assert_eq!(lines.next(), Some("# Channel: CHAN1"));
    assert_eq!(lines.next(), Some("# Timebase: 1.0 s/div"));
    assert_eq!(lines.next(), Some("# Scale: 1.0 V/div"));
    assert_eq!(lines.next(), Some("# Offset: 0.0 V"));
    // The simulated scope never answers the trigger status.
    assert_eq!(lines.next(), Some("# Trigger: N/A"));
    assert!(lines.next().is_some_and(|l| l.starts_with("# Timestamp: ")));
    assert_eq!(lines.next(), Some("time,voltage"));
    assert_eq!(lines.next(), Some("0.0,325.0"));
    assert_eq!(lines.count(), POINTS - 1);
    std::fs::remove_file(&path).ok();
}
