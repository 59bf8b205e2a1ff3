// Manual SCPI console
//
// Sends typed commands through the same serialized link the loggers use, so
// blacklisting and timeouts behave exactly as during a measurement.
//
// Console commands:
//   !blacklist              list templates cooling down
//   !reconnect              reopen the connection
//   !channel <ch>           re-read a channel's vertical setup
//   !export <ch> <file>     dump the channel's screen waveform to CSV
//   !quit

use clap::Parser;
use scope_power::{
    export_snapshot, AcquisitionConfig, Channel, Command, InstrumentLink, LinkPolicy, Response,
    SessionArbiter,
};
use std::io::{BufRead, Write};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "scpi_console")]
#[command(version = "1.0")]
#[command(about = "Interactive SCPI console with timeouts and blacklisting")]
struct Args {
    /// Instrument IP address or host name
    #[arg(long, conflicts_with = "serial")]
    ip: Option<String>,

    /// Serial port path (e.g. /dev/ttyUSB0)
    #[arg(long)]
    serial: Option<String>,

    #[arg(long, default_value_t = 115_200, help = "Baud rate for --serial")]
    baud: u32,

    #[arg(short, long, default_value_t = 5.0, help = "Per-query timeout in seconds")]
    timeout: f64,

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

    let policy = LinkPolicy {
        timeout: Duration::from_secs_f64(args.timeout),
        ..LinkPolicy::default()
    };
    let link = match (&args.ip, &args.serial) {
        (Some(ip), _) => InstrumentLink::connect_tcp(ip, policy)?,
        (None, Some(port)) => InstrumentLink::connect_serial(port, args.baud, policy)?,
        (None, None) => {
            eprintln!("Specify --ip or --serial");
            std::process::exit(1);
        }
    };
    let arbiter = SessionArbiter::new();

    println!("Connected: {}", link.identity());
    println!("Type SCPI commands, or !quit to exit.\n");

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["!quit"] => break,
            ["!blacklist"] => {
                let blocked = link.blacklisted();
                if blocked.is_empty() {
                    println!("(none)");
                }
                for template in blocked {
                    println!("{}", template);
                }
            }
            ["!reconnect"] => match link.reconnect() {
                Ok(idn) => println!("Reconnected: {}", idn),
                Err(e) => println!("Error: {}", e),
            },
            ["!channel", channel] => match channel.parse::<Channel>() {
                Ok(channel) => match link.refresh_channel(channel) {
                    Ok(config) => println!("{:#?}", config),
                    Err(e) => println!("Error: {}", e),
                },
                Err(e) => println!("Error: {}", e),
            },
            ["!export", channel, path] => {
                let channel = match channel.parse::<Channel>() {
                    Ok(channel) => channel,
                    Err(e) => {
                        println!("Error: {}", e);
                        continue;
                    }
                };
                let config = AcquisitionConfig::default();
                match export_snapshot(&arbiter, &link, channel, &config, path) {
                    Ok(rows) => println!("Wrote {} points to {}", rows, path),
                    Err(e) => println!("Error: {}", e),
                }
            }
            _ => match link.execute(Command::from_console(line)) {
                Ok(Response::Ack) => println!("OK"),
                Ok(Response::Text(text)) => println!("{}", text),
                Ok(Response::Block(bytes)) => println!("<{} byte block>", bytes.len()),
                Err(e) => println!("Error: {}", e),
            },
        }
    }
    Ok(())
}
