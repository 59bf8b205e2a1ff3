// Long-time logger
//
// Records Vpp (and optionally Vavg / Vrms) of several channels at a fixed
// interval for hours. Channels given with --current are converted to amps
// through the probe unless the scope already reports AMP.

use clap::Parser;
use scope_power::{
    Channel, CsvLog, InstrumentLink, LinkPolicy, LongTimeConfig, LongTimeLogger, MeasurementLoop,
    MeasurementMode, ProbeScalingConfig, SessionArbiter,
};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "long_time_logger")]
#[command(version = "1.0")]
#[command(about = "Log per-channel Vpp/Vavg/Vrms over long periods")]
struct Args {
    /// Instrument IP address or host name
    #[arg(long)]
    ip: String,

    /// Channels to log (1-4, CH1, MATH1, ...)
    #[arg(short = 'C', long = "channel", required = true, num_args = 1..)]
    channels: Vec<Channel>,

    /// Channels that carry a current probe signal
    #[arg(long = "current", num_args = 1..)]
    current: Vec<Channel>,

    #[arg(long, help = "Shunt resistance in ohms for --current channels")]
    shunt: Option<f64>,

    #[arg(long, help = "Clamp sensitivity in mV/A for --current channels")]
    clamp: Option<f64>,

    #[arg(long, help = "Also log the mean value")]
    vavg: bool,

    #[arg(long, help = "Also log the RMS value")]
    vrms: bool,

    #[arg(short, long, default_value_t = 1.0, help = "Seconds between rows")]
    interval: f64,

    #[arg(short, long, default_value_t = 1.0, help = "Total duration in hours")]
    duration: f64,

    #[arg(short, long, help = "Output CSV file (default: oszi_csv/session_<timestamp>.csv)")]
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
        (Some(ohms), None) => Some(ProbeScalingConfig::shunt(ohms)?),
        (None, Some(mv_per_amp)) => Some(ProbeScalingConfig::clamp(mv_per_amp)?),
        (None, None) => None,
        (Some(_), Some(_)) => {
            eprintln!("Use either --shunt or --clamp, not both");
            std::process::exit(1);
        }
    };

    let interval = Duration::from_secs_f64(args.interval);
    let mut builder = LongTimeConfig::builder()
        .vavg(args.vavg)
        .vrms(args.vrms)
        .interval(interval)
        .duration(Duration::from_secs_f64(args.duration * 3600.0));
    for channel in &args.channels {
        builder = match probe {
            Some(probe) if args.current.contains(channel) => builder.current_channel(*channel, probe),
            _ => builder.channel(*channel),
        };
    }
    let config = builder.build()?;
    let total = config.total_cycles().unwrap_or(0);

    let link = Arc::new(InstrumentLink::connect_tcp(&args.ip, LinkPolicy::default())?);
    println!("✓ Connected: {}", link.identity());

    let mut log = match &args.output {
        Some(path) => CsvLog::create(path)?,
        None => CsvLog::create_in("oszi_csv", "session")?,
    };
    println!("Logging {} rows to {}", total, log.path().display());
    println!("Columns: {}\n", config.header().join(", "));

    let arbiter = Arc::new(SessionArbiter::new());
    arbiter.start(MeasurementMode::LongTimeLogging)?;

    let logger = LongTimeLogger::new(link, config.clone());
    let (tx, rx) = mpsc::channel();
    let worker = MeasurementLoop::spawn(Arc::clone(&arbiter), interval, move |arbiter| {
        match logger.cycle(arbiter) {
            Ok(Some(row)) => {
                if tx.send(row).is_err() {
                    log::debug!("Receiver gone");
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Row skipped: {}", e),
        }
    })?;

    let mut written = 0u64;
    while written < total {
        let Ok(row) = rx.recv() else { break };
        log.append(&mut row.to_frame(&config)?)?;
        written += 1;
        if written % 5 == 0 || written == total {
            println!("✓ Saved {}/{}", written, total);
        }
    }

    let (stopped, report) = worker.stop();
    stopped?;
    println!(
        "\nDone: {} rows, {} cycles, {} slots skipped, {} failed reads",
        written,
        report.cycles,
        report.skipped,
        arbiter.faults().acquisition
    );
    Ok(())
}
