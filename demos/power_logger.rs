// Headless power logger
//
// Measures P, S, Q1 and PF between a voltage and a current channel at a fixed
// interval and appends every sample with running energy totals to a CSV file.

use clap::Parser;
use scope_power::{
    Channel, CsvLog, InstrumentLink, LinkPolicy, LinkState, MeasurementLoop, MeasurementMode,
    PowerAnalysisConfig, PowerMeter, ProbeScalingConfig, SessionArbiter,
};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "power_logger")]
#[command(version = "1.0")]
#[command(about = "Log power quantities from a LAN oscilloscope")]
#[command(long_about = "Fetch voltage and current waveforms at a fixed interval, compute real, apparent and fundamental reactive power and log them with running energy totals.")]
struct Args {
    /// Instrument IP address or host name
    #[arg(long)]
    ip: String,

    /// Voltage channel (1-4, CH1, MATH1, ...)
    #[arg(long, default_value = "CH1")]
    vch: Channel,

    /// Current channel (1-4, CH2, MATH2, ...)
    #[arg(long, default_value = "CH2")]
    ich: Channel,

    /// Shunt resistance in ohms
    #[arg(long, conflicts_with = "clamp", help = "Shunt resistor value in ohms")]
    shunt: Option<f64>,

    /// Clamp sensitivity in mV/A
    #[arg(long, help = "Current clamp sensitivity in mV/A")]
    clamp: Option<f64>,

    #[arg(long, default_value_t = 1.0, help = "Correction factor applied to the current")]
    correction: f64,

    #[arg(long, help = "Calibrate against this known real power (W) before logging")]
    expected_power: Option<f64>,

    #[arg(long, help = "Keep the DC component (do not subtract the mean)")]
    dc: bool,

    #[arg(long, help = "Read this many points from deep memory with the scope stopped")]
    bulk: Option<u32>,

    #[arg(short, long, default_value_t = 5.0, help = "Seconds between samples")]
    interval: f64,

    #[arg(long, help = "Total duration in hours")]
    duration: Option<f64>,

    #[arg(short, long, help = "Number of samples (alternative to --duration)")]
    count: Option<u64>,

    #[arg(short, long, help = "Output CSV file (default: oszi_csv/power_log_<timestamp>.csv)")]
    output: Option<String>,

    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let probe = match (args.shunt, args.clamp) {
        (Some(ohms), None) => ProbeScalingConfig::shunt(ohms)?,
        (None, Some(mv_per_amp)) => ProbeScalingConfig::clamp(mv_per_amp)?,
        _ => {
            eprintln!("Specify exactly one of --shunt or --clamp");
            std::process::exit(1);
        }
    };

    let interval = Duration::from_secs_f64(args.interval);
    let total = match (args.count, args.duration) {
        (Some(count), _) => count,
        (None, Some(hours)) => (hours * 3600.0 / args.interval).floor() as u64,
        (None, None) => {
            eprintln!("Please specify either --duration or --count");
            std::process::exit(1);
        }
    };

    let mut builder = PowerAnalysisConfig::builder(args.vch, args.ich, probe)
        .correction(args.correction)
        .remove_dc(!args.dc)
        .interval(interval);
    if let Some(points) = args.bulk {
        builder = builder.bulk(points);
    }
    let config = builder.build()?;

    let link = Arc::new(InstrumentLink::connect_tcp(&args.ip, LinkPolicy::default())?);
    println!("✓ Connected: {}", link.identity());

    let mut meter = PowerMeter::new(Arc::clone(&link), config);
    if let Some(expected) = args.expected_power {
        let correction = meter.auto_calibrate(expected)?;
        println!("✓ Calibrated, correction factor = {:.6}", correction);
    }

    let mut log = match &args.output {
        Some(path) => CsvLog::create(path)?,
        None => CsvLog::create_in("oszi_csv", "power_log")?,
    };
    println!(
        "Logging {} samples every {:.1}s to {}\n",
        total,
        args.interval,
        log.path().display()
    );

    let arbiter = Arc::new(SessionArbiter::new());
    arbiter.start(MeasurementMode::PowerAnalysis)?;

    let (tx, rx) = mpsc::channel();
    let worker = MeasurementLoop::spawn(Arc::clone(&arbiter), interval, move |arbiter| {
        match meter.cycle(arbiter) {
            Ok(Some(record)) => {
                if tx.send(record).is_err() {
                    log::debug!("Receiver gone");
                }
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("{}", e);
                if meter.link().state() == LinkState::Disconnected {
                    match meter.link().reconnect() {
                        Ok(idn) => log::info!("Reconnected to {}", idn),
                        Err(e) => log::warn!("Reconnect failed: {}", e),
                    }
                }
            }
        }
    })?;

    let mut logged = 0u64;
    while logged < total {
        let Ok(record) = rx.recv() else { break };
        log.append_power(&record)?;
        logged += 1;
        let s = &record.sample;
        println!(
            "[{}/{}] P={:.3}W S={:.3}VA Q1={:.3}var PF={:.4} f0={:.2}Hz E_P={:.6}Wh",
            logged, total, s.p, s.s, s.q1, s.pf, s.f0, record.energy.e_p_wh
        );
    }

    let (energy, report) = worker.stop();
    let energy = energy?;
    let faults = arbiter.faults();
    println!("\nSummary");
    println!("=======");
    println!("Samples logged:   {}", logged);
    println!("Cycles run:       {} ({} slots skipped)", report.cycles, report.skipped);
    println!("Samples dropped:  {}", faults.total());
    println!("Active time:      {:.1}s", energy.elapsed.as_secs_f64());
    println!("E_P:              {:.6} Wh", energy.e_p_wh);
    println!("E_S:              {:.6} VAh", energy.e_s_vah);
    println!("E_Q:              {:.6} varh", energy.e_q_varh);
    Ok(())
}
